//! Connection hygiene against a live database: a released session must hand
//! its connection back on the default search path, whichever way the request
//! ended.

mod common;

use std::time::Duration;

use sqlx::Row;
use uuid::Uuid;

use atelier_api::config::DatabaseConfig;
use atelier_api::session::{SessionError, SessionFactory};
use atelier_api::tenancy::store::{TenantDescriptor, TenantStatus};

fn descriptor(key: &str) -> TenantDescriptor {
    TenantDescriptor {
        id: Uuid::new_v4(),
        key: key.to_string(),
        display_name: key.to_string(),
        status: TenantStatus::Active,
        primary_host: format!("{}.example.com", key),
    }
}

/// Single-connection factory so consecutive leases reuse one physical
/// connection and hygiene failures cannot hide behind a fresh one.
/// `None` when no database is reachable; callers skip.
async fn scratch_factory() -> Option<SessionFactory> {
    let config = DatabaseConfig {
        dsn: common::db_dsn(),
        pool_max: 1,
        acquire_timeout: Duration::from_secs(2),
    };
    let factory = SessionFactory::new(&config).ok()?;
    if sqlx::query("SELECT 1").execute(factory.pool()).await.is_err() {
        eprintln!("database unreachable; skipping (is DB_DSN configured?)");
        return None;
    }
    Some(factory)
}

async fn pool_search_path(factory: &SessionFactory) -> anyhow::Result<String> {
    let mut conn = factory.pool().acquire().await?;
    let row = sqlx::query("SELECT current_setting('search_path')")
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.get(0))
}

#[tokio::test]
async fn released_sessions_restore_the_default_search_path() -> anyhow::Result<()> {
    let Some(factory) = scratch_factory().await else {
        return Ok(());
    };
    let key = common::fresh_key("scrub");

    let mut elevated = factory.begin_elevated(&key).await?;
    elevated.create_schema().await?;
    elevated.release().await;

    // Commit path.
    let mut session = factory.begin(&descriptor(&key)).await?;
    let row = sqlx::query("SELECT current_schema()")
        .fetch_one(session.executor())
        .await?;
    let bound: String = row.get(0);
    assert_eq!(bound, key, "session must be bound to the tenant schema");
    session.commit().await?;
    session.release().await;

    assert_eq!(pool_search_path(&factory).await?, "\"$user\", public");

    // Rollback path: release without commit must neutralize just the same.
    let mut session = factory.begin(&descriptor(&key)).await?;
    sqlx::query("SELECT 1").execute(session.executor()).await?;
    session.release().await;

    assert_eq!(pool_search_path(&factory).await?, "\"$user\", public");

    let mut elevated = factory.begin_elevated(&key).await?;
    elevated.drop_schema().await?;
    elevated.release().await;
    Ok(())
}

#[tokio::test]
async fn binding_a_missing_schema_is_refused() -> anyhow::Result<()> {
    let Some(factory) = scratch_factory().await else {
        return Ok(());
    };

    // The schema was never created; the bind must fail rather than fall
    // through to the shared namespace.
    let key = common::fresh_key("ghost");
    let err = factory.begin(&descriptor(&key)).await.unwrap_err();
    assert!(matches!(err, SessionError::SchemaMissing(_)), "got {:?}", err);

    // And the connection that carried the failed bind is still clean.
    assert_eq!(pool_search_path(&factory).await?, "\"$user\", public");
    Ok(())
}
