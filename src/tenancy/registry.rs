//! In-memory tenant registry: `host -> descriptor` with bounded caching,
//! positive/negative TTLs, a stale-read ceiling for store outages, and
//! single-flight loads so a cold key costs the shared store exactly one read
//! no matter how many requests race on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::tenancy::store::{StoreError, TenantDescriptor, TenantStore};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no tenant for host")]
    NotFound,

    #[error("tenant registry unavailable: {0}")]
    TransientUnavailable(String),
}

struct CacheEntry {
    /// `None` is a cached miss (negative entry).
    outcome: Option<TenantDescriptor>,
    fetched_at: Instant,
}

type FlightCell = Arc<OnceCell<Result<Option<TenantDescriptor>, StoreError>>>;

pub struct TenantRegistry {
    store: Arc<dyn TenantStore>,
    config: RegistryConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    flights: Mutex<HashMap<String, FlightCell>>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn TenantStore>, config: RegistryConfig) -> Self {
        Self {
            store,
            config,
            entries: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Map a host lookup key to a tenant descriptor. A `Suspended` tenant is
    /// still returned; refusing to bind is the pipeline's call, not the
    /// registry's.
    pub async fn lookup(&self, host: &str) -> Result<TenantDescriptor, RegistryError> {
        if let Some(cached) = self.cached(host, false).await {
            return cached.ok_or(RegistryError::NotFound);
        }

        let cell = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let store = self.store.clone();
        let key = host.to_string();
        let result = cell
            .get_or_init(|| async move { store.fetch_by_host(&key).await })
            .await
            .clone();

        // Publish the cache entry before retiring the flight so a lookup
        // landing between the two sees the entry, not a cold miss.
        if let Ok(outcome) = &result {
            self.insert(host, outcome.clone()).await;
        }
        self.flights.lock().await.remove(host);

        match result {
            Ok(outcome) => outcome.ok_or(RegistryError::NotFound),
            Err(StoreError::Unavailable(detail)) => {
                // Serve stale data only up to the configured ceiling.
                if let Some(stale) = self.cached(host, true).await {
                    return stale.ok_or(RegistryError::NotFound);
                }
                Err(RegistryError::TransientUnavailable(detail))
            }
        }
    }

    /// Force the next lookup for this host to hit the store.
    pub async fn invalidate_host(&self, host: &str) {
        self.entries.lock().await.remove(host);
    }

    /// Drop every cached entry that points at the given tenant.
    pub async fn invalidate_tenant(&self, tenant_id: Uuid) {
        self.entries.lock().await.retain(|_, entry| {
            entry
                .outcome
                .as_ref()
                .map(|d| d.id != tenant_id)
                .unwrap_or(true)
        });
    }

    /// Eagerly reload one tenant and re-seed its primary host entry.
    pub async fn refresh(&self, tenant_id: Uuid) -> Result<(), RegistryError> {
        self.invalidate_tenant(tenant_id).await;
        match self.store.fetch_by_id(tenant_id).await {
            Ok(Some(descriptor)) => {
                let host = descriptor.primary_host.clone();
                if !host.is_empty() {
                    self.insert(&host, Some(descriptor)).await;
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(StoreError::Unavailable(detail)) => {
                Err(RegistryError::TransientUnavailable(detail))
            }
        }
    }

    /// Fresh-enough cache read. With `allow_stale`, freshness is judged
    /// against the stale ceiling instead of the TTLs.
    async fn cached(&self, host: &str, allow_stale: bool) -> Option<Option<TenantDescriptor>> {
        let entries = self.entries.lock().await;
        let entry = entries.get(host)?;
        let age = entry.fetched_at.elapsed();
        let limit = if allow_stale {
            self.config.stale_ceiling
        } else if entry.outcome.is_some() {
            self.config.positive_ttl
        } else {
            self.config.negative_ttl
        };
        (age < limit).then(|| entry.outcome.clone())
    }

    async fn insert(&self, host: &str, outcome: Option<TenantDescriptor>) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            host.to_string(),
            CacheEntry {
                outcome,
                fetched_at: Instant::now(),
            },
        );

        // Bounded cache: shed entries past the stale ceiling, then the oldest.
        if entries.len() > self.config.max_entries {
            let ceiling = self.config.stale_ceiling;
            entries.retain(|_, e| e.fetched_at.elapsed() < ceiling);
        }
        while entries.len() > self.config.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.fetched_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}
