//! Health check endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let instances = state.manager.local_instances().await;
    let healthy = instances.iter().filter(|i| i.healthy).count();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "workers": instances.len(),
            "healthy_workers": healthy,
        })),
    )
}
