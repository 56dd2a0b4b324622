//! Schema-scoped database sessions.
//!
//! A `Session` is one pooled connection leased to one request, with a
//! transaction open and the search path bound to the tenant's schema. The
//! binding is issued as the first statement after `BEGIN`, and the release
//! path unconditionally restores a neutral search path before the connection
//! re-enters the pool. A connection that cannot be proven neutral is detached
//! and closed instead of being reused.

use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::DatabaseConfig;
use crate::tenancy::store::TenantDescriptor;

/// Search path every connection must show before pool reuse.
const NEUTRAL_SEARCH_PATH: &str = "\"$user\", public";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection acquire timed out")]
    AcquireTimeout,

    #[error("connection acquire failed: {0}")]
    Acquire(sqlx::Error),

    #[error("tenant schema missing: {0}")]
    SchemaMissing(String),

    #[error("schema bind failed: {0}")]
    Bind(sqlx::Error),

    #[error("invalid schema name: {0}")]
    InvalidSchemaName(String),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
}

/// A session shared between the pipeline finalizer and the handler it runs.
pub type SharedSession = Arc<Mutex<Session>>;

/// Validate a schema/tenant key: `^[a-z][a-z0-9_]{1,62}$`.
pub fn is_valid_schema_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < 2 || bytes.len() > 63 {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_')
}

/// Quote a SQL identifier. Callers validate the name first; the quoting is a
/// second line of defense, not the primary one.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Leases pooled connections and binds them to tenant schemas.
#[derive(Clone)]
pub struct SessionFactory {
    pool: PgPool,
    pool_max: u32,
}

impl SessionFactory {
    /// Build the process-wide pool. Connects lazily so boot-time reachability
    /// is checked separately with a bounded retry budget.
    pub fn new(config: &DatabaseConfig) -> Result<Self, SessionError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(&config.dsn)
            .map_err(SessionError::Acquire)?;
        Ok(Self {
            pool,
            pool_max: config.pool_max,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// True when at least one lease could be served without waiting.
    pub fn has_free_slot(&self) -> bool {
        self.pool.num_idle() > 0 || self.pool.size() < self.pool_max
    }

    /// Lease a connection and bind it to the tenant's schema inside a fresh
    /// transaction. The handler is never invoked when this fails.
    pub async fn begin(&self, tenant: &TenantDescriptor) -> Result<Session, SessionError> {
        self.begin_scoped(Some(&tenant.key)).await
    }

    /// Lease a connection bound only to the shared namespace.
    pub async fn begin_public(&self) -> Result<Session, SessionError> {
        self.begin_scoped(None).await
    }

    async fn begin_scoped(&self, schema: Option<&str>) -> Result<Session, SessionError> {
        if let Some(name) = schema {
            if !is_valid_schema_name(name) {
                return Err(SessionError::InvalidSchemaName(name.to_string()));
            }
        }

        let mut conn = self.acquire().await?;

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(SessionError::Bind)?;

        let mut session = Session {
            conn: Some(conn),
            schema: schema.map(str::to_string),
            txn_open: true,
        };

        // The bind is the first statement of the leased transaction. SET LOCAL
        // silently skips schemas that do not exist, so the bind is verified by
        // reading back current_schema().
        if let Some(name) = schema {
            let stmt = format!(
                "SET LOCAL search_path TO {}, public",
                quote_identifier(name)
            );
            if let Err(e) = sqlx::query(&stmt).execute(session.executor()).await {
                session.discard().await;
                return Err(SessionError::Bind(e));
            }

            match sqlx::query("SELECT current_schema()")
                .fetch_one(session.executor())
                .await
            {
                Ok(row) => {
                    let current: String = row.get(0);
                    if current != name {
                        session.release().await;
                        return Err(SessionError::SchemaMissing(name.to_string()));
                    }
                }
                Err(e) => {
                    session.discard().await;
                    return Err(SessionError::Bind(e));
                }
            }
        }

        Ok(session)
    }

    /// Lease a connection for DDL within one tenant's schema. Takes a
    /// session-level advisory lock keyed by the tenant key so at most one
    /// lifecycle or migration action runs per tenant at a time.
    pub async fn begin_elevated(&self, key: &str) -> Result<ElevatedSession, SessionError> {
        if !is_valid_schema_name(key) {
            return Err(SessionError::InvalidSchemaName(key.to_string()));
        }

        let mut conn = self.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(SessionError::Bind)?;

        Ok(ElevatedSession {
            conn: Some(conn),
            key: key.to_string(),
        })
    }

    async fn acquire(&self) -> Result<PoolConnection<Postgres>, SessionError> {
        match self.pool.acquire().await {
            Ok(conn) => Ok(conn),
            Err(sqlx::Error::PoolTimedOut) => Err(SessionError::AcquireTimeout),
            Err(e) => Err(SessionError::Acquire(e)),
        }
    }
}

/// One leased connection with an open transaction and a bound search path.
#[derive(Debug)]
pub struct Session {
    conn: Option<PoolConnection<Postgres>>,
    schema: Option<String>,
    txn_open: bool,
}

impl Session {
    /// Schema this session is bound to; `None` means shared namespace only.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Executor for handler SQL. Panics only if used after release, which the
    /// pipeline makes impossible for well-behaved handlers.
    pub fn executor(&mut self) -> &mut PgConnection {
        &mut **self.conn.as_mut().expect("session used after release")
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    pub async fn commit(&mut self) -> Result<(), SessionError> {
        if !self.txn_open {
            return Ok(());
        }
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };
        sqlx::query("COMMIT").execute(&mut **conn).await?;
        self.txn_open = false;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<(), SessionError> {
        if !self.txn_open {
            return Ok(());
        }
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };
        sqlx::query("ROLLBACK").execute(&mut **conn).await?;
        self.txn_open = false;
        Ok(())
    }

    /// Neutralize and return the connection to the pool. Idempotent. Any
    /// lingering transaction is aborted first; the neutral search path is
    /// verified with a trivial read, and on any failure the connection is
    /// discarded instead of reused.
    pub async fn release(&mut self) {
        let mut conn = match self.conn.take() {
            Some(c) => c,
            None => return,
        };

        if self.txn_open {
            self.txn_open = false;
            if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                tracing::warn!(error = %e, "rollback during release failed, discarding connection");
                drop(conn.detach());
                return;
            }
        }

        if let Err(e) = sqlx::query("RESET search_path").execute(&mut *conn).await {
            tracing::warn!(error = %e, "search_path reset failed, discarding connection");
            drop(conn.detach());
            return;
        }

        match sqlx::query("SELECT current_setting('search_path')")
            .fetch_one(&mut *conn)
            .await
        {
            Ok(row) => {
                let current: String = row.get(0);
                if current != NEUTRAL_SEARCH_PATH {
                    tracing::warn!(
                        search_path = %current,
                        "connection not neutral after reset, discarding"
                    );
                    drop(conn.detach());
                }
                // conn drops here and re-enters the pool clean
            }
            Err(e) => {
                tracing::warn!(error = %e, "neutral-state verification failed, discarding connection");
                drop(conn.detach());
            }
        }
    }

    /// Drop the connection without returning it to the pool.
    async fn discard(&mut self) {
        self.txn_open = false;
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// A session with no connection, for tests that only need the shape.
    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Session {
        Session {
            conn: None,
            schema: None,
            txn_open: false,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A session dropped without release() still holds an open transaction
        // and a bound search path; never let that connection re-enter the pool.
        if let Some(conn) = self.conn.take() {
            tracing::warn!(
                schema = self.schema.as_deref().unwrap_or("public"),
                "session dropped without release, discarding connection"
            );
            drop(conn.detach());
        }
    }
}

/// A connection leased for DDL, holding the per-tenant advisory lock. Used
/// only by tenant lifecycle and the migration orchestrator. Statements run
/// outside any long-lived transaction so each migration can bracket its own.
pub struct ElevatedSession {
    conn: Option<PoolConnection<Postgres>>,
    key: String,
}

impl ElevatedSession {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn executor(&mut self) -> &mut PgConnection {
        &mut **self
            .conn
            .as_mut()
            .expect("elevated session used after release")
    }

    pub async fn create_schema(&mut self) -> Result<(), SessionError> {
        let stmt = format!("CREATE SCHEMA {}", quote_identifier(&self.key));
        sqlx::query(&stmt).execute(self.executor()).await?;
        Ok(())
    }

    pub async fn drop_schema(&mut self) -> Result<(), SessionError> {
        let stmt = format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            quote_identifier(&self.key)
        );
        sqlx::query(&stmt).execute(self.executor()).await?;
        Ok(())
    }

    pub async fn schema_exists(&mut self) -> Result<bool, SessionError> {
        let key = self.key.clone();
        let row =
            sqlx::query("SELECT 1 FROM information_schema.schemata WHERE schema_name = $1")
                .bind(key)
                .fetch_optional(self.executor())
                .await?;
        Ok(row.is_some())
    }

    /// Release the advisory lock and return the connection. Idempotent; a
    /// failed unlock discards the connection (the lock dies with it).
    pub async fn release(&mut self) {
        let mut conn = match self.conn.take() {
            Some(c) => c,
            None => return,
        };

        let unlock = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&self.key)
            .execute(&mut *conn)
            .await;
        if let Err(e) = unlock {
            tracing::warn!(error = %e, key = %self.key, "advisory unlock failed, discarding connection");
            drop(conn.detach());
            return;
        }

        if let Err(e) = sqlx::query("RESET search_path").execute(&mut *conn).await {
            tracing::warn!(error = %e, "search_path reset failed, discarding connection");
            drop(conn.detach());
        }
    }
}

impl Drop for ElevatedSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!(key = %self.key, "elevated session dropped without release, discarding connection");
            drop(conn.detach());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_schema_names() {
        assert!(is_valid_schema_name("pepita"));
        assert!(is_valid_schema_name("a1"));
        assert!(is_valid_schema_name("shop_north_2"));
        assert!(!is_valid_schema_name("a")); // too short
        assert!(!is_valid_schema_name("1shop")); // must start with a letter
        assert!(!is_valid_schema_name("Shop")); // lowercase only
        assert!(!is_valid_schema_name("shop-north")); // no hyphens
        assert!(!is_valid_schema_name("shop; drop schema public"));
        assert!(!is_valid_schema_name(&"x".repeat(64))); // 63 char limit
        assert!(is_valid_schema_name(&"x".repeat(63)));
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_identifier("pepita"), "\"pepita\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn neutral_search_path_is_postgres_default() {
        assert_eq!(NEUTRAL_SEARCH_PATH, "\"$user\", public");
    }
}
