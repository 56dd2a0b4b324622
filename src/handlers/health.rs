//! Liveness and readiness probes. These bypass the tenant pipeline.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// Shallow liveness: never touches the database.
pub async fn healthz() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now(),
    }))
}

/// Deep readiness: shared store reachable and at least one free pool slot.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let now = chrono::Utc::now();

    if !state.sessions.has_free_slot() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "timestamp": now,
                "reason": "connection pool exhausted",
            })),
        );
    }

    match sqlx::query("SELECT 1").execute(state.sessions.pool()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "timestamp": now,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "timestamp": now,
                "reason": e.to_string(),
            })),
        ),
    }
}
