//! Worker lifecycle endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use cluster_common::{
    ApplyOutput, ModelInstance, WorkerApplyOutput, WorkerApplyRequest, WorkerStartupRequest,
};

use crate::error::Result;
use crate::manager::WorkerManager;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/apply", post(apply))
        .route("/models", get(list_models))
        .route("/models/startup", post(startup))
        .route("/models/shutdown", post(shutdown))
}

/// POST /api/worker/apply
async fn apply(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WorkerApplyRequest>,
) -> Result<Json<WorkerApplyOutput>> {
    Ok(Json(state.manager.worker_apply(request).await?))
}

/// GET /api/worker/models - workers hosted here.
async fn list_models(State(state): State<Arc<AppState>>) -> Json<Vec<ModelInstance>> {
    Json(state.manager.local_instances().await)
}

/// POST /api/worker/models/startup
async fn startup(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WorkerStartupRequest>,
) -> Result<Json<ApplyOutput>> {
    tracing::info!(model = %request.model, worker_type = %request.worker_type, "Startup requested");
    Ok(Json(state.manager.model_startup(request).await?))
}

/// POST /api/worker/models/shutdown
async fn shutdown(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WorkerStartupRequest>,
) -> Result<Json<ApplyOutput>> {
    tracing::info!(model = %request.model, worker_type = %request.worker_type, "Shutdown requested");
    Ok(Json(state.manager.model_shutdown(request).await?))
}
