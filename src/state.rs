//! Process-wide shared state. Everything else flows through the per-request
//! context.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::session::SessionFactory;
use crate::tenancy::host::HostResolver;
use crate::tenancy::lifecycle::LifecycleManager;
use crate::tenancy::registry::TenantRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub resolver: HostResolver,
    pub registry: Arc<TenantRegistry>,
    pub sessions: SessionFactory,
    pub lifecycle: Arc<LifecycleManager>,
}
