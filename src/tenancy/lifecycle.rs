//! Tenant lifecycle: provisioning saga, suspend/resume, teardown.
//!
//! `create` cannot be one database transaction (it mixes shared-store DML
//! with DDL in a new schema), so it runs as a saga: each step has a
//! compensating action, failures unwind best-effort, and a failed
//! compensation leaves the tenant row in `failed` for operator
//! reconciliation rather than half-created and live.

use sha2::{Digest, Sha256};
use sqlx::Row;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::migrate::{MigrateError, MigrationOrchestrator};
use crate::session::{is_valid_schema_name, quote_identifier, SessionError, SessionFactory};
use crate::tenancy::registry::TenantRegistry;
use crate::tenancy::store::{TenantDescriptor, TenantStatus};

/// Capabilities granted to the seeded administrator role.
const ADMIN_PERMISSIONS: &[&str] = &[
    "products.read",
    "products.write",
    "orders.read",
    "orders.write",
    "tickets.read",
    "tickets.write",
    "crm.read",
    "crm.write",
    "settings.write",
];

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid tenant key: {0}")]
    InvalidKey(String),

    #[error("tenant key taken: {0}")]
    KeyTaken(String),

    #[error("tenant not found: {0}")]
    NotFound(String),

    #[error("lifecycle saga failed at {step}: {detail}")]
    SagaFailed { step: &'static str, detail: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] MigrateError),
}

#[derive(Debug, Clone)]
pub struct CreateTenant {
    pub key: String,
    pub display_name: String,
    pub admin_email: String,
    pub admin_password: String,
    pub admin_first_name: String,
    pub admin_last_name: String,
}

pub struct LifecycleManager {
    factory: SessionFactory,
    registry: Arc<TenantRegistry>,
    orchestrator: Arc<MigrationOrchestrator>,
    config: Arc<AppConfig>,
}

impl LifecycleManager {
    pub fn new(
        factory: SessionFactory,
        registry: Arc<TenantRegistry>,
        orchestrator: Arc<MigrationOrchestrator>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            factory,
            registry,
            orchestrator,
            config,
        }
    }

    /// Provision a tenant end to end: registry row, schema, migrations,
    /// bootstrap admin, primary domain, activation.
    pub async fn create(&self, req: CreateTenant) -> Result<TenantDescriptor, LifecycleError> {
        validate_key(&req.key, &self.config)?;
        let primary_host = self.config.render_primary_host(&req.key).to_ascii_lowercase();

        // Step 1: tenant row in `provisioning`, committed so the key is held.
        let tenant_id = self.insert_tenant_row(&req).await?;

        // Remaining steps unwind on failure.
        let mut schema_created = false;
        let mut domain_inserted = false;

        let outcome = self
            .provision(&req, tenant_id, &primary_host, &mut schema_created, &mut domain_inserted)
            .await;

        match outcome {
            Ok(()) => {
                self.registry.invalidate_host(&primary_host).await;
                self.registry.invalidate_tenant(tenant_id).await;
                tracing::info!(key = %req.key, %tenant_id, "tenant provisioned");
                Ok(TenantDescriptor {
                    id: tenant_id,
                    key: req.key,
                    display_name: req.display_name,
                    status: TenantStatus::Active,
                    primary_host,
                })
            }
            Err((step, source)) => {
                tracing::error!(key = %req.key, step, error = %source, "tenant creation failed, compensating");
                let compensated = self
                    .compensate(tenant_id, &req.key, schema_created, domain_inserted)
                    .await;
                if !compensated {
                    self.mark_failed(tenant_id).await;
                }
                self.registry.invalidate_host(&primary_host).await;
                self.registry.invalidate_tenant(tenant_id).await;
                Err(LifecycleError::SagaFailed {
                    step,
                    detail: source,
                })
            }
        }
    }

    async fn provision(
        &self,
        req: &CreateTenant,
        tenant_id: Uuid,
        primary_host: &str,
        schema_created: &mut bool,
        domain_inserted: &mut bool,
    ) -> Result<(), (&'static str, String)> {
        // Step 2: schema DDL, elevated.
        {
            let mut elevated = self
                .factory
                .begin_elevated(&req.key)
                .await
                .map_err(|e| ("create_schema", e.to_string()))?;
            let exists = elevated
                .schema_exists()
                .await
                .map_err(|e| ("create_schema", e.to_string()))?;
            if exists {
                elevated.release().await;
                return Err(("create_schema", format!("schema already present: {}", req.key)));
            }
            let created = elevated.create_schema().await;
            elevated.release().await;
            created.map_err(|e| ("create_schema", e.to_string()))?;
            *schema_created = true;
        }

        // Step 3: per-tenant migrations.
        self.orchestrator
            .apply_tenant(&req.key)
            .await
            .map_err(|e| ("apply_migrations", e.to_string()))?;

        // Step 4: bootstrap admin with the administrator role.
        self.seed_admin(req)
            .await
            .map_err(|e| ("seed_admin", e.to_string()))?;

        // Steps 5 and 6 share one shared-store transaction: domain row plus
        // activation flip commit together.
        let mut session = self
            .factory
            .begin_public()
            .await
            .map_err(|e| ("publish_domain", e.to_string()))?;

        let result = async {
            sqlx::query(
                "INSERT INTO public.domains (host, tenant_id, is_primary) VALUES ($1, $2, true)",
            )
            .bind(primary_host)
            .bind(tenant_id)
            .execute(session.executor())
            .await?;
            *domain_inserted = true;

            sqlx::query(
                "UPDATE public.tenants SET status = 'active', updated_at = now() WHERE id = $1",
            )
            .bind(tenant_id)
            .execute(session.executor())
            .await?;
            Ok::<(), sqlx::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                let committed = session.commit().await;
                session.release().await;
                committed.map_err(|e| ("activate", e.to_string()))
            }
            Err(e) => {
                session.release().await;
                Err(("publish_domain", e.to_string()))
            }
        }
    }

    async fn insert_tenant_row(&self, req: &CreateTenant) -> Result<Uuid, LifecycleError> {
        let mut session = self.factory.begin_public().await?;
        let inserted = sqlx::query(
            "INSERT INTO public.tenants (key, display_name, status)
             VALUES ($1, $2, 'provisioning') RETURNING id",
        )
        .bind(&req.key)
        .bind(&req.display_name)
        .fetch_one(session.executor())
        .await;

        match inserted {
            Ok(row) => {
                let id: Uuid = row.get("id");
                let committed = session.commit().await;
                session.release().await;
                committed?;
                Ok(id)
            }
            Err(e) => {
                session.release().await;
                if is_unique_violation(&e) {
                    Err(LifecycleError::KeyTaken(req.key.clone()))
                } else {
                    Err(LifecycleError::Sql(e))
                }
            }
        }
    }

    /// Create the platform admin inside the new schema and grant the
    /// administrator role every capability. One transaction on the elevated
    /// connection; identifiers are schema-qualified because the advisory-lock
    /// session keeps a neutral search path.
    async fn seed_admin(&self, req: &CreateTenant) -> Result<(), LifecycleError> {
        let mut elevated = self.factory.begin_elevated(&req.key).await?;
        let schema = quote_identifier(&req.key);
        let digest = hash_password(&req.admin_password);

        let result = async {
            sqlx::query("BEGIN").execute(elevated.executor()).await?;

            let user_row = sqlx::query(&format!(
                "INSERT INTO {}.users (email, password_digest, first_name, last_name)
                 VALUES ($1, $2, $3, $4) RETURNING id",
                schema
            ))
            .bind(&req.admin_email)
            .bind(&digest)
            .bind(&req.admin_first_name)
            .bind(&req.admin_last_name)
            .fetch_one(elevated.executor())
            .await?;
            let user_id: Uuid = user_row.get("id");

            let role_row = sqlx::query(&format!(
                "INSERT INTO {}.roles (name) VALUES ('administrator') RETURNING id",
                schema
            ))
            .fetch_one(elevated.executor())
            .await?;
            let role_id: Uuid = role_row.get("id");

            for permission in ADMIN_PERMISSIONS {
                sqlx::query(&format!(
                    "INSERT INTO {}.role_permissions (role_id, permission) VALUES ($1, $2)",
                    schema
                ))
                .bind(role_id)
                .bind(permission)
                .execute(elevated.executor())
                .await?;
            }

            sqlx::query(&format!(
                "INSERT INTO {}.user_roles (user_id, role_id) VALUES ($1, $2)",
                schema
            ))
            .bind(user_id)
            .bind(role_id)
            .execute(elevated.executor())
            .await?;

            sqlx::query("COMMIT").execute(elevated.executor()).await?;
            Ok::<(), sqlx::Error>(())
        }
        .await;

        if result.is_err() {
            let _ = sqlx::query("ROLLBACK").execute(elevated.executor()).await;
        }
        elevated.release().await;
        result.map_err(LifecycleError::Sql)
    }

    /// Reverse the create steps best-effort. Returns false if any
    /// compensating action itself failed.
    async fn compensate(
        &self,
        tenant_id: Uuid,
        key: &str,
        schema_created: bool,
        domain_inserted: bool,
    ) -> bool {
        let mut clean = true;

        if domain_inserted {
            clean &= self
                .run_public(
                    "DELETE FROM public.domains WHERE tenant_id = $1",
                    tenant_id,
                )
                .await;
        }

        if schema_created {
            match self.factory.begin_elevated(key).await {
                Ok(mut elevated) => {
                    let dropped = elevated.drop_schema().await;
                    elevated.release().await;
                    if let Err(e) = dropped {
                        tracing::error!(key, error = %e, "compensation: schema drop failed");
                        clean = false;
                    }
                }
                Err(e) => {
                    tracing::error!(key, error = %e, "compensation: could not lease elevated session");
                    clean = false;
                }
            }
        }

        if clean {
            clean &= self
                .run_public("DELETE FROM public.tenants WHERE id = $1", tenant_id)
                .await;
        }

        clean
    }

    async fn mark_failed(&self, tenant_id: Uuid) {
        let _ = self
            .run_public(
                "UPDATE public.tenants SET status = 'failed', updated_at = now() WHERE id = $1",
                tenant_id,
            )
            .await;
    }

    async fn run_public(&self, statement: &str, tenant_id: Uuid) -> bool {
        let mut session = match self.factory.begin_public().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "compensation: could not open shared session");
                return false;
            }
        };
        let executed = sqlx::query(statement)
            .bind(tenant_id)
            .execute(session.executor())
            .await;
        let ok = match executed {
            Ok(_) => session.commit().await.is_ok(),
            Err(e) => {
                tracing::error!(error = %e, statement, "compensation statement failed");
                false
            }
        };
        session.release().await;
        ok
    }

    /// Stop binding new sessions for the tenant. In-flight requests finish;
    /// the registry invalidation makes new lookups see the new status within
    /// one TTL window.
    pub async fn suspend(&self, tenant_id: Uuid) -> Result<(), LifecycleError> {
        self.flip_status(tenant_id, TenantStatus::Active, TenantStatus::Suspended)
            .await
    }

    pub async fn resume(&self, tenant_id: Uuid) -> Result<(), LifecycleError> {
        self.flip_status(tenant_id, TenantStatus::Suspended, TenantStatus::Active)
            .await
    }

    async fn flip_status(
        &self,
        tenant_id: Uuid,
        from: TenantStatus,
        to: TenantStatus,
    ) -> Result<(), LifecycleError> {
        let mut session = self.factory.begin_public().await?;
        let result = sqlx::query(
            "UPDATE public.tenants SET status = $1, updated_at = now()
             WHERE id = $2 AND status = $3",
        )
        .bind(to.as_str())
        .bind(tenant_id)
        .bind(from.as_str())
        .execute(session.executor())
        .await;

        let outcome = match result {
            Ok(r) if r.rows_affected() == 1 => {
                session.commit().await?;
                Ok(())
            }
            Ok(_) => Err(LifecycleError::NotFound(tenant_id.to_string())),
            Err(e) => Err(LifecycleError::Sql(e)),
        };
        session.release().await;

        if outcome.is_ok() {
            self.registry.invalidate_tenant(tenant_id).await;
        }
        outcome
    }

    /// Teardown: tombstone the row and remove domains first, then drop the
    /// schema. A crash between the two leaves a deleted tenant with an
    /// orphaned schema for an operator to reap, never a live tenant whose
    /// binds fail. The row stays for audit; schema removal is the
    /// destructive part.
    pub async fn destroy(&self, tenant_id: Uuid) -> Result<(), LifecycleError> {
        let key = self.tenant_key(tenant_id).await?;

        let mut session = self.factory.begin_public().await?;
        let result = async {
            sqlx::query("DELETE FROM public.domains WHERE tenant_id = $1")
                .bind(tenant_id)
                .execute(session.executor())
                .await?;
            sqlx::query(
                "UPDATE public.tenants SET status = 'deleted', updated_at = now() WHERE id = $1",
            )
            .bind(tenant_id)
            .execute(session.executor())
            .await?;
            Ok::<(), sqlx::Error>(())
        }
        .await;

        let outcome = match result {
            Ok(()) => session.commit().await.map_err(LifecycleError::from),
            Err(e) => Err(LifecycleError::Sql(e)),
        };
        session.release().await;
        outcome?;
        self.registry.invalidate_tenant(tenant_id).await;

        let mut elevated = self.factory.begin_elevated(&key).await?;
        let dropped = elevated.drop_schema().await;
        elevated.release().await;
        dropped?;

        tracing::info!(%tenant_id, key, "tenant destroyed");
        Ok(())
    }

    /// Resolve a tenant id to its key through the shared store.
    pub async fn tenant_key(&self, tenant_id: Uuid) -> Result<String, LifecycleError> {
        let mut session = self.factory.begin_public().await?;
        let row = sqlx::query("SELECT key FROM public.tenants WHERE id = $1 AND status <> 'deleted'")
            .bind(tenant_id)
            .fetch_optional(session.executor())
            .await;
        session.release().await;
        match row {
            Ok(Some(r)) => Ok(r.get("key")),
            Ok(None) => Err(LifecycleError::NotFound(tenant_id.to_string())),
            Err(e) => Err(LifecycleError::Sql(e)),
        }
    }

    /// Resolve a tenant key to its id through the shared store.
    pub async fn tenant_id(&self, key: &str) -> Result<Uuid, LifecycleError> {
        let mut session = self.factory.begin_public().await?;
        let row = sqlx::query("SELECT id FROM public.tenants WHERE key = $1 AND status <> 'deleted'")
            .bind(key)
            .fetch_optional(session.executor())
            .await;
        session.release().await;
        match row {
            Ok(Some(r)) => Ok(r.get("id")),
            Ok(None) => Err(LifecycleError::NotFound(key.to_string())),
            Err(e) => Err(LifecycleError::Sql(e)),
        }
    }
}

/// Key rules: `^[a-z][a-z0-9_]{1,62}$`, not reserved.
pub fn validate_key(key: &str, config: &AppConfig) -> Result<(), LifecycleError> {
    if !is_valid_schema_name(key) {
        return Err(LifecycleError::InvalidKey(format!(
            "key must match ^[a-z][a-z0-9_]{{1,62}}$: {}",
            key
        )));
    }
    if config.is_reserved_key(key) {
        return Err(LifecycleError::InvalidKey(format!("key is reserved: {}", key)));
    }
    Ok(())
}

/// Salted SHA-256 digest in `sha256$<salt>$<hex>` form.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("sha256${}${:x}", salt, hasher.finalize())
}

/// Check a password against a stored `sha256$<salt>$<hex>` digest.
pub fn verify_password(password: &str, digest: &str) -> bool {
    let mut parts = digest.splitn(3, '$');
    let (Some("sha256"), Some(salt), Some(expected)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize()) == expected
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_config() -> AppConfig {
        use crate::config::*;
        use std::time::Duration;
        AppConfig {
            database: DatabaseConfig {
                dsn: "postgres://localhost/test".to_string(),
                pool_max: 5,
                acquire_timeout: Duration::from_secs(2),
            },
            hosting: HostingConfig {
                primary_host_pattern: "{key}.example.com".to_string(),
                base_domains: vec!["example.com".to_string()],
                reserved_keys: HashSet::from(["public".to_string(), "www".to_string()]),
            },
            registry: RegistryConfig {
                positive_ttl: Duration::from_secs(60),
                negative_ttl: Duration::from_secs(10),
                stale_ceiling: Duration::from_secs(300),
                max_entries: 100,
            },
            request: RequestConfig {
                deadline: Duration::from_secs(30),
            },
            security: SecurityConfig {
                token_secret: "secret".to_string(),
            },
            migrations_auto_apply: false,
            port: 3000,
        }
    }

    #[test]
    fn accepts_well_formed_keys() {
        let config = test_config();
        assert!(validate_key("pepita", &config).is_ok());
        assert!(validate_key("shop_2", &config).is_ok());
    }

    #[test]
    fn rejects_reserved_keys() {
        let config = test_config();
        assert!(matches!(
            validate_key("public", &config),
            Err(LifecycleError::InvalidKey(_))
        ));
        assert!(matches!(
            validate_key("www", &config),
            Err(LifecycleError::InvalidKey(_))
        ));
    }

    #[test]
    fn rejects_malformed_keys() {
        let config = test_config();
        for key in ["", "P", "1shop", "shop-a", "a", "Shop"] {
            assert!(
                matches!(validate_key(key, &config), Err(LifecycleError::InvalidKey(_))),
                "key {:?} should be invalid",
                key
            );
        }
    }

    #[test]
    fn password_digest_round_trips() {
        let digest = hash_password("pw12345678");
        assert!(digest.starts_with("sha256$"));
        assert!(verify_password("pw12345678", &digest));
        assert!(!verify_password("wrong", &digest));
        assert!(!verify_password("pw12345678", "garbage"));
    }

    #[test]
    fn digests_are_salted() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }
}
