//! Tenant-scoped bearer auth for protected routes.
//!
//! Runs after the session bind, so the subject lookup goes through the bound
//! schema: a token issued by another tenant names a key that does not match,
//! and even a forged matching key would resolve the subject against the
//! wrong schema's `users` and fail.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use sqlx::Row;
use uuid::Uuid;

use crate::auth::verify_token;
use crate::error::ApiError;
use crate::state::AppState;
use crate::tenancy::context::{Principal, TenantContext};

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx = request
        .extensions()
        .get::<TenantContext>()
        .cloned()
        .ok_or_else(|| {
            tracing::error!("auth middleware reached without tenant context");
            ApiError::InternalServerError("request escaped the tenant pipeline".to_string())
        })?;

    // Protected routes only exist on tenant hosts; the pipeline rejects them
    // on the public host before auth ever runs.
    let descriptor = ctx.scope.descriptor().ok_or(ApiError::NotForPublic)?;

    let token = bearer_token(request.headers())?;
    let claims = verify_token(&token, &state.config.security.token_secret)
        .map_err(|e| ApiError::AuthRejected(e.to_string()))?;

    if claims.tenant != descriptor.key {
        return Err(ApiError::AuthRejected(
            "token not issued for this tenant".to_string(),
        ));
    }

    // Subject must exist in the bound schema.
    let principal = {
        let mut session = ctx.session.lock().await;
        let row = sqlx::query("SELECT id, email FROM users WHERE id = $1")
            .bind(claims.sub)
            .fetch_optional(session.executor())
            .await
            .map_err(|e| ApiError::InternalServerError(e.to_string()))?;
        let row = row.ok_or_else(|| ApiError::AuthRejected("unknown subject".to_string()))?;
        let user_id: Uuid = row.get("id");
        Principal {
            user_id,
            email: row.get("email"),
        }
    };

    request.extensions_mut().insert(ctx.with_principal(principal));
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get("authorization")
        .ok_or_else(|| ApiError::AuthRejected("missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| ApiError::AuthRejected("malformed Authorization header".to_string()))?;

    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => Err(ApiError::AuthRejected(
            "Authorization header must use the Bearer scheme".to_string(),
        )),
    }
}
