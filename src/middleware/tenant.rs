//! The tenant pipeline: host dispatch, registry lookup, session bind, and the
//! finalizer that commits or rolls back and always releases.
//!
//! Stage order is load-bearing: correlation (previous layer) → host → tenant
//! lookup → session bind → handler → finalizer. Any stage failure
//! short-circuits to an error response without invoking the handler, and the
//! bound session never outlives the request.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::correlation::CorrelationId;
use crate::state::AppState;
use crate::tenancy::context::{TenantContext, TenantScope};
use crate::tenancy::host::{HostError, HostLookupKey};
use crate::tenancy::store::TenantStatus;

/// Routes served on the public (bare base domain) host. Everything else on
/// that host is rejected exactly like an unknown tenant.
const PUBLIC_ROUTES: &[&str] = &["/tenant/info", "/tenant/register"];

/// Shallow probes that bypass tenancy entirely.
const PROBE_ROUTES: &[&str] = &["/healthz", "/readyz"];

fn is_public_route(path: &str) -> bool {
    PUBLIC_ROUTES.contains(&path)
}

pub async fn tenant_pipeline(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if PROBE_ROUTES.contains(&path.as_str()) {
        return next.run(request).await;
    }

    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0)
        .unwrap_or_else(Uuid::new_v4);
    let method = request.method().clone();

    // Host dispatch. X-Forwarded-Host is deliberately not consulted.
    let raw_host = match request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        Some(h) => h.to_string(),
        None => {
            return error_response(
                ApiError::HostUnrecognized("(missing)".to_string()),
                correlation_id,
            )
        }
    };

    let lookup_key = match state.resolver.resolve(&raw_host) {
        Ok(key) => key,
        Err(HostError::Unrecognized(host)) => {
            return error_response(ApiError::HostUnrecognized(host), correlation_id)
        }
    };

    // Tenant lookup. Status is re-validated here, at bind time, so registry
    // staleness after lifecycle changes only lasts one TTL window.
    let scope = match &lookup_key {
        HostLookupKey::Public => {
            if !is_public_route(&path) {
                return error_response(ApiError::NotForPublic, correlation_id);
            }
            TenantScope::Public
        }
        HostLookupKey::Host(host) => {
            let descriptor = match state.registry.lookup(host).await {
                Ok(d) => d,
                Err(e) => return error_response(e.into(), correlation_id),
            };
            match descriptor.status {
                TenantStatus::Active => {}
                TenantStatus::Suspended => {
                    return error_response(ApiError::TenantSuspended, correlation_id)
                }
                TenantStatus::Provisioning | TenantStatus::Failed => {
                    return error_response(
                        ApiError::TenantUnavailable(format!(
                            "tenant {} not serving (status {})",
                            descriptor.key,
                            descriptor.status.as_str()
                        )),
                        correlation_id,
                    )
                }
                TenantStatus::Deleted => {
                    return error_response(ApiError::TenantNotFound, correlation_id)
                }
            }
            TenantScope::Tenant(descriptor)
        }
    };

    // Session bind. On failure the handler is never invoked.
    let session = match &scope {
        TenantScope::Public => state.sessions.begin_public().await,
        TenantScope::Tenant(descriptor) => state.sessions.begin(descriptor).await,
    };
    let session = match session {
        Ok(s) => s,
        Err(e) => return error_response(e.into(), correlation_id),
    };

    let ctx = TenantContext::new(scope, session.into_shared(), correlation_id);
    let shared = ctx.session.clone();
    let tenant_label = ctx.tenant_label().to_string();
    let started_at = ctx.started_at;
    request.extensions_mut().insert(ctx);

    // Route dispatch under the request deadline, panics contained.
    let outcome = tokio::time::timeout(
        state.config.request.deadline,
        AssertUnwindSafe(next.run(request)).catch_unwind(),
    )
    .await;

    // Finalizer: commit on success, rollback on failure, panic, or deadline;
    // release unconditionally.
    let response = match outcome {
        Ok(Ok(response)) => {
            let mut session = shared.lock().await;
            if response.status().is_client_error() || response.status().is_server_error() {
                let _ = session.rollback().await;
                session.release().await;
                stamp_error_body(response, correlation_id).await
            } else {
                let committed = session.commit().await;
                session.release().await;
                match committed {
                    Ok(()) => response,
                    Err(e) => error_response(e.into(), correlation_id),
                }
            }
        }
        Ok(Err(_panic)) => {
            let mut session = shared.lock().await;
            let _ = session.rollback().await;
            session.release().await;
            tracing::error!(%correlation_id, tenant = %tenant_label, %path, "handler panicked");
            error_response(
                ApiError::InternalServerError("handler panicked".to_string()),
                correlation_id,
            )
        }
        Err(_elapsed) => {
            // Handler future is dropped at this point; its transaction dies
            // with the rollback below.
            let mut session = shared.lock().await;
            let _ = session.rollback().await;
            session.release().await;
            error_response(ApiError::RequestDeadline, correlation_id)
        }
    };

    tracing::info!(
        %correlation_id,
        tenant = %tenant_label,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started_at.elapsed().as_millis() as u64,
        "request"
    );

    response
}

/// Largest error body the finalizer will rewrite.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// Stamp the correlation id into a JSON error body produced below the
/// pipeline (handlers, auth), so the error envelope is uniform no matter
/// which layer raised it. Non-JSON bodies pass through untouched.
async fn stamp_error_body(response: Response, correlation_id: Uuid) -> Response {
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, ERROR_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            return Response::from_parts(parts, axum::body::Body::empty());
        }
    };

    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(mut value) => {
            if let Some(object) = value.as_object_mut() {
                object
                    .entry("correlation_id")
                    .or_insert_with(|| serde_json::json!(correlation_id));
            }
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, axum::body::Body::from(value.to_string()))
        }
        Err(_) => Response::from_parts(parts, axum::body::Body::from(bytes)),
    }
}

/// Render an error with the correlation id in the body, matching the headers
/// `ApiError::into_response` would set.
fn error_response(err: ApiError, correlation_id: Uuid) -> Response {
    let status = err.status_code();
    let retry_after = err.retry_after_secs();
    let mut response = (status, Json(err.to_json(Some(correlation_id)))).into_response();
    if let Some(secs) = retry_after {
        if let Ok(value) = secs.to_string().parse() {
            response.headers_mut().insert("retry-after", value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn public_routes_are_exactly_the_signup_surface() {
        assert!(is_public_route("/tenant/info"));
        assert!(is_public_route("/tenant/register"));
        assert!(!is_public_route("/products"));
        assert!(!is_public_route("/"));
    }

    #[tokio::test]
    async fn handler_error_bodies_gain_the_correlation_id() {
        let id = Uuid::new_v4();
        let response = ApiError::AuthRejected("nope".to_string()).into_response();
        let stamped = stamp_error_body(response, id).await;

        assert_eq!(stamped.status(), StatusCode::UNAUTHORIZED);
        let bytes = axum::body::to_bytes(stamped.into_body(), ERROR_BODY_LIMIT)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["correlation_id"], serde_json::json!(id));
        assert_eq!(value["code"], "AUTH_REJECTED");
    }

    #[tokio::test]
    async fn an_existing_correlation_id_is_kept() {
        let original = Uuid::new_v4();
        let response = ApiError::TenantSuspended.into_response();
        let stamped = stamp_error_body(response, original).await;
        let restamped = stamp_error_body(stamped, Uuid::new_v4()).await;

        let bytes = axum::body::to_bytes(restamped.into_body(), ERROR_BODY_LIMIT)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["correlation_id"], serde_json::json!(original));
    }

    #[tokio::test]
    async fn non_json_bodies_pass_through_untouched() {
        let response = (StatusCode::NOT_FOUND, "plain nope").into_response();
        let stamped = stamp_error_body(response, Uuid::new_v4()).await;

        let bytes = axum::body::to_bytes(stamped.into_body(), ERROR_BODY_LIMIT)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"plain nope");
    }
}
