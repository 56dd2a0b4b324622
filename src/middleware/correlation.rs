//! Correlation id stamping, first stage of the pipeline.

use axum::{extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

/// Request-scoped correlation id, attached before anything else runs.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationId(pub Uuid);

pub async fn correlation_middleware(mut request: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    request.extensions_mut().insert(CorrelationId(id));

    let mut response = next.run(request).await;
    if let Ok(value) = id.to_string().parse() {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}
