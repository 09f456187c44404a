use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Middleware that logs HTTP requests at INFO level.
///
/// Controller traffic (registration, heartbeats, queries) is logged at DEBUG; worker hosts
/// heartbeat often enough to drown everything else.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis();

    if path.starts_with("/api/controller") {
        tracing::debug!(method = %method, path = %path, status, duration_ms, "HTTP request");
    } else {
        tracing::info!(method = %method, path = %path, status, duration_ms, "HTTP request");
    }

    response
}
