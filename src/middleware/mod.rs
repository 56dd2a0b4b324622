pub mod auth;
pub mod correlation;
pub mod response;
pub mod tenant;

pub use auth::auth_middleware;
pub use correlation::{correlation_middleware, CorrelationId};
pub use response::{ApiResponse, ApiResult};
pub use tenant::tenant_pipeline;
