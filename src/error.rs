// HTTP API error types for the tenant data plane
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};
use uuid::Uuid;

/// HTTP API error with appropriate status codes and client-friendly messages.
///
/// The pipeline converts internal subsystem errors into this type exactly once,
/// at the HTTP boundary. `NotForPublic` deliberately renders the same way as
/// `TenantNotFound` so the public host cannot be used to enumerate tenants.
#[derive(Debug)]
pub enum ApiError {
    // 400 Bad Request
    BadRequest(String),
    HostUnrecognized(String),
    TenantKeyInvalid(String),

    // 401 Unauthorized
    AuthRejected(String),

    // 404 Not Found
    NotFound(String),
    TenantNotFound,
    NotForPublic,

    // 409 Conflict
    Conflict(String),
    TenantKeyTaken(String),

    // 423 Locked
    TenantSuspended,

    // 500 Internal Server Error
    InternalServerError(String),
    LifecycleSagaFailed(String),

    // 503 Service Unavailable
    TransientUnavailable(String),
    BackpressureTimeout,
    TenantUnavailable(String),
    RequestDeadline,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::HostUnrecognized(_) => StatusCode::BAD_REQUEST,
            ApiError::TenantKeyInvalid(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthRejected(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TenantNotFound => StatusCode::NOT_FOUND,
            ApiError::NotForPublic => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TenantKeyTaken(_) => StatusCode::CONFLICT,
            ApiError::TenantSuspended => StatusCode::LOCKED,
            ApiError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::LifecycleSagaFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::TransientUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BackpressureTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::TenantUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::RequestDeadline => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Client-safe message. Internal detail stays in the logs.
    pub fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::HostUnrecognized(host) => format!("unrecognized host: {}", host),
            ApiError::TenantKeyInvalid(reason) => reason.clone(),
            ApiError::AuthRejected(msg) => msg.clone(),
            ApiError::NotFound(msg) => msg.clone(),
            // Same wording for both so the public host leaks nothing.
            ApiError::TenantNotFound | ApiError::NotForPublic => "not found".to_string(),
            ApiError::Conflict(msg) => msg.clone(),
            ApiError::TenantKeyTaken(key) => format!("tenant key already taken: {}", key),
            ApiError::TenantSuspended => "tenant is suspended".to_string(),
            ApiError::InternalServerError(_) | ApiError::LifecycleSagaFailed(_) => {
                "an internal error occurred".to_string()
            }
            ApiError::TransientUnavailable(_) => "service temporarily unavailable".to_string(),
            ApiError::BackpressureTimeout => "service busy, try again shortly".to_string(),
            ApiError::TenantUnavailable(_) => "tenant temporarily unavailable".to_string(),
            ApiError::RequestDeadline => "request deadline exceeded".to_string(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::HostUnrecognized(_) => "HOST_UNRECOGNIZED",
            ApiError::TenantKeyInvalid(_) => "TENANT_KEY_INVALID",
            ApiError::AuthRejected(_) => "AUTH_REJECTED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::TenantNotFound | ApiError::NotForPublic => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::TenantKeyTaken(_) => "TENANT_KEY_TAKEN",
            ApiError::TenantSuspended => "TENANT_SUSPENDED",
            ApiError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
            ApiError::LifecycleSagaFailed(_) => "LIFECYCLE_FAILED",
            ApiError::TransientUnavailable(_) => "TRANSIENT_UNAVAILABLE",
            ApiError::BackpressureTimeout => "BACKPRESSURE_TIMEOUT",
            ApiError::TenantUnavailable(_) => "TENANT_UNAVAILABLE",
            ApiError::RequestDeadline => "REQUEST_DEADLINE",
        }
    }

    /// 503-class errors advertise a retry hint.
    pub fn retry_after_secs(&self) -> Option<u32> {
        match self {
            ApiError::TransientUnavailable(_) | ApiError::TenantUnavailable(_) => Some(5),
            ApiError::BackpressureTimeout | ApiError::RequestDeadline => Some(1),
            _ => None,
        }
    }

    pub fn to_json(&self, correlation_id: Option<Uuid>) -> Value {
        let mut body = json!({
            "error": true,
            "message": self.message(),
            "code": self.error_code(),
        });
        if let Some(id) = correlation_id {
            body["correlation_id"] = json!(id);
        }
        body
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        // Log the internal detail that message() withholds from clients.
        match &self {
            ApiError::InternalServerError(detail) | ApiError::LifecycleSagaFailed(detail) => {
                tracing::error!(code = self.error_code(), %detail, "request failed");
            }
            ApiError::TransientUnavailable(detail) | ApiError::TenantUnavailable(detail) => {
                tracing::warn!(code = self.error_code(), %detail, "request failed");
            }
            _ => {}
        }

        let status = self.status_code();
        let retry_after = self.retry_after_secs();
        let mut response = (status, Json(self.to_json(None))).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<crate::session::SessionError> for ApiError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::SessionError;
        match err {
            SessionError::AcquireTimeout => ApiError::BackpressureTimeout,
            SessionError::Acquire(e) => ApiError::TransientUnavailable(e.to_string()),
            SessionError::SchemaMissing(schema) => {
                ApiError::TenantUnavailable(format!("schema not present: {}", schema))
            }
            SessionError::Bind(e) => ApiError::TenantUnavailable(e.to_string()),
            SessionError::InvalidSchemaName(name) => {
                ApiError::InternalServerError(format!("invalid schema name: {}", name))
            }
            SessionError::Sql(e) => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl From<crate::tenancy::registry::RegistryError> for ApiError {
    fn from(err: crate::tenancy::registry::RegistryError) -> Self {
        use crate::tenancy::registry::RegistryError;
        match err {
            RegistryError::NotFound => ApiError::TenantNotFound,
            RegistryError::TransientUnavailable(detail) => ApiError::TransientUnavailable(detail),
        }
    }
}

impl From<crate::tenancy::lifecycle::LifecycleError> for ApiError {
    fn from(err: crate::tenancy::lifecycle::LifecycleError) -> Self {
        use crate::tenancy::lifecycle::LifecycleError;
        match err {
            LifecycleError::InvalidKey(reason) => ApiError::TenantKeyInvalid(reason),
            LifecycleError::KeyTaken(key) => ApiError::TenantKeyTaken(key),
            LifecycleError::NotFound(_) => ApiError::TenantNotFound,
            LifecycleError::SagaFailed { step, detail } => {
                ApiError::LifecycleSagaFailed(format!("step {}: {}", step, detail))
            }
            LifecycleError::Session(e) => e.into(),
            LifecycleError::Sql(e) => ApiError::InternalServerError(e.to_string()),
            LifecycleError::Migrate(e) => ApiError::InternalServerError(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            ApiError::HostUnrecognized("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::TenantNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::NotForPublic.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::TenantSuspended.status_code(), StatusCode::LOCKED);
        assert_eq!(
            ApiError::BackpressureTimeout.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::TenantKeyTaken("a".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Conflict("dup".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::LifecycleSagaFailed("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn not_for_public_is_indistinguishable_from_not_found() {
        let a = ApiError::TenantNotFound.to_json(None);
        let b = ApiError::NotForPublic.to_json(None);
        assert_eq!(a, b);
    }

    #[test]
    fn transient_errors_carry_retry_hint() {
        assert!(ApiError::TransientUnavailable("db down".into())
            .retry_after_secs()
            .is_some());
        assert!(ApiError::BackpressureTimeout.retry_after_secs().is_some());
        assert!(ApiError::TenantNotFound.retry_after_secs().is_none());
    }

    #[test]
    fn correlation_id_included_when_present() {
        let id = Uuid::new_v4();
        let body = ApiError::TenantSuspended.to_json(Some(id));
        assert_eq!(body["correlation_id"], serde_json::json!(id));
        assert_eq!(body["code"], "TENANT_SUSPENDED");
    }
}
