//! Tenant-facing endpoints of the core: `/tenant/info` and signup.

use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::response::{ApiResponse, ApiResult};
use crate::state::AppState;
use crate::tenancy::context::{TenantContext, TenantScope};
use crate::tenancy::lifecycle::CreateTenant;

/// GET /tenant/info: resolved-host introspection. Public on both scopes.
pub async fn info(Extension(ctx): Extension<TenantContext>) -> ApiResult<Value> {
    let body = match &ctx.scope {
        TenantScope::Public => json!({ "type": "public" }),
        TenantScope::Tenant(descriptor) => json!({
            "type": "tenant",
            "data": {
                "name": descriptor.display_name,
                "schema_name": descriptor.key,
                "status": descriptor.status,
                "primary_host": descriptor.primary_host,
            }
        }),
    };
    Ok(ApiResponse::success(body))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub store_name: String,
    pub key: String,
    pub admin: AdminSpec,
}

#[derive(Debug, Deserialize)]
pub struct AdminSpec {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

/// POST /tenant/register: the signup flow. Served only on the public host;
/// provisioning runs the lifecycle saga and the response carries the
/// redirect to the freshly published primary host.
pub async fn register(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<Value> {
    if !ctx.scope.is_public() {
        return Err(ApiError::NotFound("not found".to_string()));
    }

    if body.store_name.trim().is_empty() {
        return Err(ApiError::BadRequest("store_name is required".to_string()));
    }
    if !body.admin.email.contains('@') {
        return Err(ApiError::BadRequest("admin.email is not an email".to_string()));
    }
    if body.admin.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "admin.password must be at least 8 characters".to_string(),
        ));
    }

    let descriptor = state
        .lifecycle
        .create(CreateTenant {
            key: body.key,
            display_name: body.store_name,
            admin_email: body.admin.email,
            admin_password: body.admin.password,
            admin_first_name: body.admin.first_name,
            admin_last_name: body.admin.last_name,
        })
        .await?;

    Ok(ApiResponse::created(json!({
        "message": format!("store {} created", descriptor.display_name),
        "redirect_url": format!("http://{}/login", descriptor.primary_host),
    })))
}
