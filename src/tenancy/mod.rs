pub mod context;
pub mod host;
pub mod lifecycle;
pub mod registry;
pub mod store;

pub use context::{Principal, TenantContext, TenantScope};
pub use host::{HostLookupKey, HostResolver};
pub use registry::TenantRegistry;
pub use store::{TenantDescriptor, TenantStatus};
