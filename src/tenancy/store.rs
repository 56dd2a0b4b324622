//! Authoritative tenant metadata reads from the shared store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Provisioning,
    Active,
    Suspended,
    Deleted,
    Failed,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Provisioning => "provisioning",
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Deleted => "deleted",
            TenantStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provisioning" => Some(TenantStatus::Provisioning),
            "active" => Some(TenantStatus::Active),
            "suspended" => Some(TenantStatus::Suspended),
            "deleted" => Some(TenantStatus::Deleted),
            "failed" => Some(TenantStatus::Failed),
            _ => None,
        }
    }
}

/// Cached snapshot of one tenant, as the registry hands it to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantDescriptor {
    pub id: Uuid,
    /// Immutable, equals the tenant's schema name bit-exact.
    pub key: String,
    pub display_name: String,
    pub status: TenantStatus,
    pub primary_host: String,
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("tenant store unavailable: {0}")]
    Unavailable(String),
}

/// Read side of the shared store, behind a trait so the registry's cache
/// behavior is testable without a database.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn fetch_by_host(&self, host: &str) -> Result<Option<TenantDescriptor>, StoreError>;
    async fn fetch_by_id(&self, id: Uuid) -> Result<Option<TenantDescriptor>, StoreError>;
    async fn list_active_keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Production store reading `public.tenants` and `public.domains`.
pub struct PgTenantStore {
    pool: PgPool,
}

impl PgTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn descriptor_from_row(row: &PgRow) -> Result<TenantDescriptor, StoreError> {
        let status_raw: String = row.get("status");
        let status = TenantStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown tenant status: {}", status_raw)))?;
        Ok(TenantDescriptor {
            id: row.get("id"),
            key: row.get("key"),
            display_name: row.get("display_name"),
            status,
            primary_host: row.get("primary_host"),
        })
    }
}

#[async_trait]
impl TenantStore for PgTenantStore {
    async fn fetch_by_host(&self, host: &str) -> Result<Option<TenantDescriptor>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT t.id, t.key, t.display_name, t.status,
                   COALESCE(pd.host, '') AS primary_host
            FROM public.domains d
            JOIN public.tenants t ON t.id = d.tenant_id
            LEFT JOIN public.domains pd ON pd.tenant_id = t.id AND pd.is_primary
            WHERE d.host = $1 AND t.status <> 'deleted'
            "#,
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        row.as_ref().map(Self::descriptor_from_row).transpose()
    }

    async fn fetch_by_id(&self, id: Uuid) -> Result<Option<TenantDescriptor>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT t.id, t.key, t.display_name, t.status,
                   COALESCE(pd.host, '') AS primary_host
            FROM public.tenants t
            LEFT JOIN public.domains pd ON pd.tenant_id = t.id AND pd.is_primary
            WHERE t.id = $1 AND t.status <> 'deleted'
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        row.as_ref().map(Self::descriptor_from_row).transpose()
    }

    async fn list_active_keys(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT key FROM public.tenants WHERE status = 'active' ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get("key")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            TenantStatus::Provisioning,
            TenantStatus::Active,
            TenantStatus::Suspended,
            TenantStatus::Deleted,
            TenantStatus::Failed,
        ] {
            assert_eq!(TenantStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TenantStatus::parse("bogus"), None);
    }
}
