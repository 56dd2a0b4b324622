//! Migration orchestration for the two-namespace layout.
//!
//! Two disjoint, totally ordered migration lists: shared migrations applied
//! once to `public`, and per-tenant migrations applied once per tenant schema.
//! Each schema carries its own bookkeeping table and the applied set must be
//! a strict prefix of the list; gaps or unknown entries abort before anything
//! runs. The bookkeeping tables use different names so the tenant table never
//! shadows the shared one on the bound search path.

use std::sync::Arc;

use sqlx::Row;
use thiserror::Error;

use crate::session::{quote_identifier, SessionError, SessionFactory};
use crate::tenancy::store::TenantStore;

pub struct Migration {
    pub id: &'static str,
    pub statements: &'static [&'static str],
}

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("tenant store unavailable: {0}")]
    Store(String),

    #[error("schema {schema}: applied migrations diverge from the list (expected {expected}, found {found})")]
    OutOfOrder {
        schema: String,
        expected: String,
        found: String,
    },
}

/// Shared-namespace migrations, applied at boot.
pub const SHARED_MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_tenants",
        statements: &[r#"
            CREATE TABLE tenants (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                key text NOT NULL UNIQUE,
                display_name text NOT NULL,
                status text NOT NULL
                    CHECK (status IN ('provisioning', 'active', 'suspended', 'deleted', 'failed')),
                created_at timestamptz NOT NULL DEFAULT now(),
                updated_at timestamptz NOT NULL DEFAULT now()
            )
        "#],
    },
    Migration {
        id: "0002_domains",
        statements: &[
            r#"
            CREATE TABLE domains (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                host text NOT NULL UNIQUE,
                tenant_id uuid NOT NULL REFERENCES tenants (id) ON DELETE CASCADE,
                is_primary boolean NOT NULL DEFAULT false,
                created_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
            // Exactly one primary host per tenant.
            r#"
            CREATE UNIQUE INDEX domains_one_primary_per_tenant
                ON domains (tenant_id) WHERE is_primary
        "#,
        ],
    },
];

/// Per-tenant migrations, applied into each tenant schema in order. All
/// identifiers are unqualified; the orchestrator binds the search path before
/// every statement so they land in the tenant schema.
pub const TENANT_MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_identity",
        statements: &[
            r#"
            CREATE TABLE users (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                email text NOT NULL UNIQUE,
                password_digest text NOT NULL,
                first_name text NOT NULL DEFAULT '',
                last_name text NOT NULL DEFAULT '',
                created_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
            r#"
            CREATE TABLE roles (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                name text NOT NULL UNIQUE
            )
        "#,
            r#"
            CREATE TABLE role_permissions (
                role_id uuid NOT NULL REFERENCES roles (id) ON DELETE CASCADE,
                permission text NOT NULL,
                PRIMARY KEY (role_id, permission)
            )
        "#,
            r#"
            CREATE TABLE user_roles (
                user_id uuid NOT NULL REFERENCES users (id) ON DELETE CASCADE,
                role_id uuid NOT NULL REFERENCES roles (id) ON DELETE CASCADE,
                PRIMARY KEY (user_id, role_id)
            )
        "#,
        ],
    },
    Migration {
        id: "0002_catalog",
        statements: &[
            r#"
            CREATE TABLE categories (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                name text NOT NULL,
                parent_id uuid REFERENCES categories (id) ON DELETE SET NULL
            )
        "#,
            r#"
            CREATE TABLE products (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                name text NOT NULL,
                sku text NOT NULL UNIQUE,
                price_cents bigint NOT NULL DEFAULT 0,
                category_id uuid REFERENCES categories (id) ON DELETE SET NULL,
                created_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
            r#"
            CREATE TABLE stock (
                product_id uuid PRIMARY KEY REFERENCES products (id) ON DELETE CASCADE,
                quantity integer NOT NULL DEFAULT 0,
                updated_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
        ],
    },
    Migration {
        id: "0003_commerce",
        statements: &[
            r#"
            CREATE TABLE carts (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id uuid REFERENCES users (id) ON DELETE SET NULL,
                created_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
            r#"
            CREATE TABLE orders (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id uuid REFERENCES users (id) ON DELETE SET NULL,
                status text NOT NULL DEFAULT 'pending',
                total_cents bigint NOT NULL DEFAULT 0,
                created_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
            r#"
            CREATE TABLE order_items (
                order_id uuid NOT NULL REFERENCES orders (id) ON DELETE CASCADE,
                product_id uuid NOT NULL REFERENCES products (id),
                quantity integer NOT NULL,
                unit_price_cents bigint NOT NULL,
                PRIMARY KEY (order_id, product_id)
            )
        "#,
        ],
    },
    Migration {
        id: "0004_support_crm",
        statements: &[
            r#"
            CREATE TABLE tickets (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id uuid REFERENCES users (id) ON DELETE SET NULL,
                subject text NOT NULL,
                status text NOT NULL DEFAULT 'open',
                created_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
            r#"
            CREATE TABLE leads (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                name text NOT NULL,
                email text,
                created_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
            r#"
            CREATE TABLE contacts (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                name text NOT NULL,
                email text,
                created_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
            r#"
            CREATE TABLE opportunities (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                contact_id uuid REFERENCES contacts (id) ON DELETE SET NULL,
                stage text NOT NULL DEFAULT 'new',
                value_cents bigint NOT NULL DEFAULT 0,
                created_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
            // Polymorphic activity subject as an explicit tagged union.
            r#"
            CREATE TABLE activities (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                subject_kind text NOT NULL
                    CHECK (subject_kind IN ('lead', 'contact', 'opportunity')),
                subject_id uuid NOT NULL,
                note text NOT NULL DEFAULT '',
                created_at timestamptz NOT NULL DEFAULT now()
            )
        "#,
        ],
    },
];

/// Per-tenant outcome of a fleet-wide migration run.
pub struct TenantMigrationReport {
    pub key: String,
    pub result: Result<usize, String>,
}

pub struct MigrationOrchestrator {
    factory: SessionFactory,
    store: Arc<dyn TenantStore>,
}

impl MigrationOrchestrator {
    pub fn new(factory: SessionFactory, store: Arc<dyn TenantStore>) -> Self {
        Self { factory, store }
    }

    /// Number of shared migrations not yet applied. The boot path refuses to
    /// serve when this is nonzero and auto-apply is off.
    pub async fn pending_shared(&self) -> Result<usize, MigrateError> {
        let mut conn = self.factory.pool().acquire().await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS public.shared_applied_migrations (
                id text PRIMARY KEY,
                applied_at timestamptz NOT NULL DEFAULT now()
            )",
        )
        .execute(&mut *conn)
        .await?;

        let applied = read_applied(&mut *conn, "public.shared_applied_migrations").await?;
        let next = check_prefix(&applied, SHARED_MIGRATIONS, "public")?;
        Ok(SHARED_MIGRATIONS.len() - next)
    }

    /// Apply pending shared migrations, each in its own transaction.
    pub async fn apply_shared(&self) -> Result<usize, MigrateError> {
        let mut conn = self.factory.pool().acquire().await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS public.shared_applied_migrations (
                id text PRIMARY KEY,
                applied_at timestamptz NOT NULL DEFAULT now()
            )",
        )
        .execute(&mut *conn)
        .await?;

        let applied = read_applied(&mut *conn, "public.shared_applied_migrations").await?;
        let next = check_prefix(&applied, SHARED_MIGRATIONS, "public")?;

        let mut count = 0;
        for migration in &SHARED_MIGRATIONS[next..] {
            sqlx::query("BEGIN").execute(&mut *conn).await?;
            sqlx::query("SET LOCAL search_path TO public")
                .execute(&mut *conn)
                .await?;
            let applied = apply_statements(&mut *conn, migration).await;
            match applied {
                Ok(()) => {
                    sqlx::query("INSERT INTO public.shared_applied_migrations (id) VALUES ($1)")
                        .bind(migration.id)
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("COMMIT").execute(&mut *conn).await?;
                    tracing::info!(migration = migration.id, "applied shared migration");
                    count += 1;
                }
                Err(e) => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Err(e);
                }
            }
        }
        Ok(count)
    }

    /// Apply pending per-tenant migrations into one tenant's schema, under
    /// the tenant's advisory lock. The schema must already exist.
    pub async fn apply_tenant(&self, key: &str) -> Result<usize, MigrateError> {
        let mut session = self.factory.begin_elevated(key).await?;
        let result = self.apply_tenant_locked(&mut session).await;
        session.release().await;
        result
    }

    async fn apply_tenant_locked(
        &self,
        session: &mut crate::session::ElevatedSession,
    ) -> Result<usize, MigrateError> {
        let key = session.key().to_string();
        if !session.schema_exists().await? {
            return Err(MigrateError::Session(SessionError::SchemaMissing(key)));
        }

        let bookkeeping = format!(
            "CREATE TABLE IF NOT EXISTS {}.applied_migrations (
                id text PRIMARY KEY,
                applied_at timestamptz NOT NULL DEFAULT now()
            )",
            quote_identifier(&key)
        );
        sqlx::query(&bookkeeping).execute(session.executor()).await?;

        let table = format!("{}.applied_migrations", quote_identifier(&key));
        let applied = read_applied(session.executor(), &table).await?;
        let next = check_prefix(&applied, TENANT_MIGRATIONS, &key)?;

        let bind = format!(
            "SET LOCAL search_path TO {}, public",
            quote_identifier(&key)
        );

        let mut count = 0;
        for migration in &TENANT_MIGRATIONS[next..] {
            sqlx::query("BEGIN").execute(session.executor()).await?;
            sqlx::query(&bind).execute(session.executor()).await?;
            let outcome = apply_statements(session.executor(), migration).await;
            match outcome {
                Ok(()) => {
                    sqlx::query("INSERT INTO applied_migrations (id) VALUES ($1)")
                        .bind(migration.id)
                        .execute(session.executor())
                        .await?;
                    sqlx::query("COMMIT").execute(session.executor()).await?;
                    tracing::info!(schema = %key, migration = migration.id, "applied tenant migration");
                    count += 1;
                }
                Err(e) => {
                    let _ = sqlx::query("ROLLBACK").execute(session.executor()).await;
                    return Err(e);
                }
            }
        }
        Ok(count)
    }

    /// Migrate every active tenant, one elevated session each. A failing
    /// tenant never blocks the rest; outcomes are reported per tenant.
    pub async fn apply_all_tenants(&self) -> Result<Vec<TenantMigrationReport>, MigrateError> {
        let keys = self
            .store
            .list_active_keys()
            .await
            .map_err(|e| MigrateError::Store(e.to_string()))?;

        let mut reports = Vec::with_capacity(keys.len());
        for key in keys {
            let result = match self.apply_tenant(&key).await {
                Ok(count) => Ok(count),
                Err(e) => {
                    tracing::error!(schema = %key, error = %e, "tenant migration failed");
                    Err(e.to_string())
                }
            };
            reports.push(TenantMigrationReport { key, result });
        }
        Ok(reports)
    }
}

async fn apply_statements(
    conn: &mut sqlx::PgConnection,
    migration: &Migration,
) -> Result<(), MigrateError> {
    for statement in migration.statements {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn read_applied(
    conn: &mut sqlx::PgConnection,
    table: &str,
) -> Result<Vec<String>, MigrateError> {
    let query = format!("SELECT id FROM {} ORDER BY id", table);
    let rows = sqlx::query(&query).fetch_all(conn).await?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}

/// The applied set must be a strict prefix of the list. Returns the index of
/// the first migration still to run.
fn check_prefix(
    applied: &[String],
    list: &[Migration],
    schema: &str,
) -> Result<usize, MigrateError> {
    if applied.len() > list.len() {
        return Err(MigrateError::OutOfOrder {
            schema: schema.to_string(),
            expected: "(end of list)".to_string(),
            found: applied[list.len()].clone(),
        });
    }
    for (i, id) in applied.iter().enumerate() {
        if id != list[i].id {
            return Err(MigrateError::OutOfOrder {
                schema: schema.to_string(),
                expected: list[i].id.to_string(),
                found: id.clone(),
            });
        }
    }
    Ok(applied.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[Migration]) -> Vec<&str> {
        list.iter().map(|m| m.id).collect()
    }

    #[test]
    fn migration_lists_are_strictly_ordered() {
        for list in [SHARED_MIGRATIONS, TENANT_MIGRATIONS] {
            let mut sorted = ids(list);
            sorted.sort();
            assert_eq!(sorted, ids(list), "list must be lexicographically ordered");
            let mut deduped = ids(list);
            deduped.dedup();
            assert_eq!(deduped.len(), list.len(), "duplicate migration id");
        }
    }

    #[test]
    fn empty_applied_set_starts_at_zero() {
        assert_eq!(check_prefix(&[], TENANT_MIGRATIONS, "pepita").unwrap(), 0);
    }

    #[test]
    fn full_prefix_is_accepted() {
        let applied: Vec<String> = ids(TENANT_MIGRATIONS)
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            check_prefix(&applied, TENANT_MIGRATIONS, "pepita").unwrap(),
            TENANT_MIGRATIONS.len()
        );
        assert_eq!(
            check_prefix(&applied[..2], TENANT_MIGRATIONS, "pepita").unwrap(),
            2
        );
    }

    #[test]
    fn gaps_are_rejected() {
        // Applied set skips the first migration.
        let applied = vec![TENANT_MIGRATIONS[1].id.to_string()];
        let err = check_prefix(&applied, TENANT_MIGRATIONS, "pepita").unwrap_err();
        assert!(matches!(err, MigrateError::OutOfOrder { .. }));
    }

    #[test]
    fn unknown_applied_ids_are_rejected() {
        let applied = vec!["9999_mystery".to_string()];
        let err = check_prefix(&applied, TENANT_MIGRATIONS, "pepita").unwrap_err();
        assert!(matches!(err, MigrateError::OutOfOrder { .. }));
    }

    #[test]
    fn tenant_migrations_use_unqualified_identifiers() {
        for migration in TENANT_MIGRATIONS {
            for statement in migration.statements {
                assert!(
                    !statement.contains("public."),
                    "tenant migration {} must rely on the bound search path",
                    migration.id
                );
            }
        }
    }
}
