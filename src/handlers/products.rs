//! Sample tenant-scoped CRUD surface.
//!
//! Products are ordinary business CRUD; they live here because the isolation
//! scenarios need at least one write/read path that exercises the bound
//! session. Every query runs unqualified and resolves through the session's
//! search path, so the same code serves every tenant.

use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::response::{ApiResponse, ApiResult};
use crate::tenancy::context::TenantContext;

#[derive(Debug, Serialize, FromRow)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub sku: String,
    pub price_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProduct {
    pub name: String,
    pub sku: String,
    pub price_cents: i64,
}

/// GET /products
pub async fn list(Extension(ctx): Extension<TenantContext>) -> ApiResult<Vec<Product>> {
    let mut session = ctx.session.lock().await;
    let products = sqlx::query_as::<_, Product>(
        "SELECT id, name, sku, price_cents, created_at FROM products ORDER BY created_at, sku",
    )
    .fetch_all(session.executor())
    .await
    .map_err(|e| ApiError::InternalServerError(e.to_string()))?;

    Ok(ApiResponse::success(products))
}

/// POST /products
pub async fn create(
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<CreateProduct>,
) -> ApiResult<Product> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    if body.sku.trim().is_empty() {
        return Err(ApiError::BadRequest("sku is required".to_string()));
    }
    if body.price_cents < 0 {
        return Err(ApiError::BadRequest("price_cents must be non-negative".to_string()));
    }

    let mut session = ctx.session.lock().await;
    let row = sqlx::query(
        "INSERT INTO products (name, sku, price_cents)
         VALUES ($1, $2, $3)
         RETURNING id, name, sku, price_cents, created_at",
    )
    .bind(body.name.trim())
    .bind(body.sku.trim())
    .bind(body.price_cents)
    .fetch_one(session.executor())
    .await
    .map_err(|e| match e.as_database_error().and_then(|d| d.code()) {
        Some(code) if code == "23505" => {
            ApiError::Conflict("sku already exists".to_string())
        }
        _ => ApiError::InternalServerError(e.to_string()),
    })?;

    Ok(ApiResponse::created(Product {
        id: row.get("id"),
        name: row.get("name"),
        sku: row.get("sku"),
        price_cents: row.get("price_cents"),
        created_at: row.get("created_at"),
    }))
}
