pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod migrate;
pub mod session;
pub mod state;
pub mod tenancy;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{health, products, tenant};
use crate::middleware::{auth_middleware, correlation_middleware, tenant_pipeline};
use crate::state::AppState;

/// Assemble the router. Layer order is load-bearing: correlation runs first,
/// then the tenant pipeline, then per-route auth, then handlers.
pub fn app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/products", get(products::list).post(products::create))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/tenant/info", get(tenant::info))
        .route("/tenant/register", post(tenant::register))
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            tenant_pipeline,
        ))
        .layer(axum::middleware::from_fn(correlation_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
