use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use atelier_api::config::AppConfig;
use atelier_api::migrate::MigrationOrchestrator;
use atelier_api::session::SessionFactory;
use atelier_api::state::AppState;
use atelier_api::tenancy::host::HostResolver;
use atelier_api::tenancy::lifecycle::{CreateTenant, LifecycleManager};
use atelier_api::tenancy::registry::TenantRegistry;
use atelier_api::tenancy::store::PgTenantStore;

/// Exit codes for the boot process.
const EXIT_CONFIG: u8 = 1;
const EXIT_MIGRATIONS_PENDING: u8 = 2;
const EXIT_DEPENDENCY: u8 = 3;

/// Startup reachability retry budget.
const STARTUP_ATTEMPTS: u32 = 3;
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "atelier-api", about = "Multi-tenant boutique commerce backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Apply pending shared-namespace migrations and exit.
    MigrateShared,
    /// Apply pending per-tenant migrations across all active tenants.
    MigrateTenants,
    /// Operator tenant lifecycle actions.
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },
}

#[derive(Subcommand)]
enum TenantAction {
    Create {
        key: String,
        store_name: String,
        admin_email: String,
        admin_password: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
    },
    Suspend { key: String },
    Resume { key: String },
    Destroy { key: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present so local runs pick up DB_DSN and friends.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!(error = %e, "fatal misconfiguration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let factory = match SessionFactory::new(&config.database) {
        Ok(factory) => factory,
        Err(e) => {
            tracing::error!(error = %e, "fatal misconfiguration: database pool");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if !wait_for_database(&factory).await {
        tracing::error!("database unreachable after {} attempts", STARTUP_ATTEMPTS);
        return ExitCode::from(EXIT_DEPENDENCY);
    }

    let store = Arc::new(PgTenantStore::new(factory.pool().clone()));
    let orchestrator = Arc::new(MigrationOrchestrator::new(factory.clone(), store.clone()));
    let registry = Arc::new(TenantRegistry::new(store, config.registry.clone()));
    let lifecycle = Arc::new(LifecycleManager::new(
        factory.clone(),
        registry.clone(),
        orchestrator.clone(),
        config.clone(),
    ));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            serve(config, factory, registry, lifecycle, orchestrator).await
        }
        Command::MigrateShared => match orchestrator.apply_shared().await {
            Ok(count) => {
                tracing::info!(applied = count, "shared migrations applied");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "shared migration failed");
                ExitCode::from(EXIT_DEPENDENCY)
            }
        },
        Command::MigrateTenants => match orchestrator.apply_all_tenants().await {
            Ok(reports) => {
                let mut failed = false;
                for report in reports {
                    match report.result {
                        Ok(count) => {
                            tracing::info!(tenant = %report.key, applied = count, "tenant migrated")
                        }
                        Err(reason) => {
                            failed = true;
                            tracing::error!(tenant = %report.key, %reason, "tenant migration failed");
                        }
                    }
                }
                if failed {
                    ExitCode::from(EXIT_DEPENDENCY)
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "fleet migration failed");
                ExitCode::from(EXIT_DEPENDENCY)
            }
        },
        Command::Tenant { action } => run_tenant_action(&lifecycle, action).await,
    }
}

async fn serve(
    config: Arc<AppConfig>,
    factory: SessionFactory,
    registry: Arc<TenantRegistry>,
    lifecycle: Arc<LifecycleManager>,
    orchestrator: Arc<MigrationOrchestrator>,
) -> ExitCode {
    // Refuse to serve over a stale shared schema.
    match orchestrator.pending_shared().await {
        Ok(0) => {}
        Ok(pending) => {
            if config.migrations_auto_apply {
                if let Err(e) = orchestrator.apply_shared().await {
                    tracing::error!(error = %e, "shared migration failed at boot");
                    return ExitCode::from(EXIT_DEPENDENCY);
                }
            } else {
                tracing::error!(
                    pending,
                    "shared migrations pending and MIGRATIONS_AUTO_APPLY is off"
                );
                return ExitCode::from(EXIT_MIGRATIONS_PENDING);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "could not determine migration state");
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    }

    let state = AppState {
        resolver: HostResolver::new(config.hosting.base_domains.clone()),
        config: config.clone(),
        registry,
        sessions: factory,
        lifecycle,
    };

    let app = atelier_api::app(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %bind_addr, "failed to bind");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    tracing::info!(%bind_addr, "atelier-api listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server error");
            ExitCode::from(EXIT_DEPENDENCY)
        }
    }
}

async fn run_tenant_action(lifecycle: &LifecycleManager, action: TenantAction) -> ExitCode {
    let outcome = match action {
        TenantAction::Create {
            key,
            store_name,
            admin_email,
            admin_password,
            first_name,
            last_name,
        } => lifecycle
            .create(CreateTenant {
                key,
                display_name: store_name,
                admin_email,
                admin_password,
                admin_first_name: first_name,
                admin_last_name: last_name,
            })
            .await
            .map(|descriptor| {
                tracing::info!(key = %descriptor.key, host = %descriptor.primary_host, "tenant created");
            }),
        TenantAction::Suspend { key } => match lifecycle.tenant_id(&key).await {
            Ok(id) => lifecycle.suspend(id).await.map(|_| {
                tracing::info!(%key, "tenant suspended");
            }),
            Err(e) => Err(e),
        },
        TenantAction::Resume { key } => match lifecycle.tenant_id(&key).await {
            Ok(id) => lifecycle.resume(id).await.map(|_| {
                tracing::info!(%key, "tenant resumed");
            }),
            Err(e) => Err(e),
        },
        TenantAction::Destroy { key } => match lifecycle.tenant_id(&key).await {
            Ok(id) => lifecycle.destroy(id).await.map(|_| {
                tracing::info!(%key, "tenant destroyed");
            }),
            Err(e) => Err(e),
        },
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "tenant action failed");
            ExitCode::from(EXIT_DEPENDENCY)
        }
    }
}

/// Ping the shared store within the startup retry budget.
async fn wait_for_database(factory: &SessionFactory) -> bool {
    for attempt in 1..=STARTUP_ATTEMPTS {
        match sqlx::query("SELECT 1").execute(factory.pool()).await {
            Ok(_) => return true,
            Err(e) => {
                tracing::warn!(attempt, error = %e, "database not reachable yet");
                if attempt < STARTUP_ATTEMPTS {
                    tokio::time::sleep(STARTUP_RETRY_DELAY).await;
                }
            }
        }
    }
    false
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
