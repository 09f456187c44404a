//! Bearer token allow-list for the OpenAI-compatible routes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::AppState;

/// Check the request's bearer token against the configured keys.
pub fn authenticate(headers: &HeaderMap, api_keys: &[String]) -> Result<(), ApiError> {
    if api_keys.is_empty() {
        return Ok(());
    }

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::MissingApiKey)?;

    if api_keys.iter().any(|k| k == token) {
        Ok(())
    } else {
        Err(ApiError::InvalidApiKey)
    }
}

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match authenticate(request.headers(), &state.config.api.api_keys) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
