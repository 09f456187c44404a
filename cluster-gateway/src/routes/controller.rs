//! Controller endpoints: the cluster registry served to worker hosts and remote managers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use cluster_common::protocol::{
    InstanceQuery, RegistryAck, CONTROLLER_HEARTBEAT_PATH, CONTROLLER_MODELS_PATH,
};
use cluster_common::{InstanceRef, ModelInstance};
use model_worker::error::{Error, Result};

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            CONTROLLER_MODELS_PATH,
            get(list_instances).post(register).delete(deregister),
        )
        .route(CONTROLLER_HEARTBEAT_PATH, post(heartbeat))
}

/// Malformed payloads get the same structured error body as every other route.
fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| Error::Validation(e.body_text()))
}

/// POST /api/controller/models
async fn register(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ModelInstance>, JsonRejection>,
) -> Result<Json<RegistryAck>> {
    let instance = body(payload)?;
    let success = state.registry.register(instance).await?;
    Ok(Json(RegistryAck { success }))
}

/// DELETE /api/controller/models
async fn deregister(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<InstanceRef>, JsonRejection>,
) -> Result<Json<RegistryAck>> {
    let target = body(payload)?;
    let success = state
        .registry
        .deregister(&target.worker_key, &target.host, target.port)
        .await?;
    Ok(Json(RegistryAck { success }))
}

/// POST /api/controller/heartbeat - `success: false` asks the worker to register again.
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<InstanceRef>, JsonRejection>,
) -> Result<Json<RegistryAck>> {
    let target = body(payload)?;
    let success = state
        .registry
        .heartbeat(&target.worker_key, &target.host, target.port)
        .await?;
    Ok(Json(RegistryAck { success }))
}

/// GET /api/controller/models?worker_key=..&healthy_only=..
async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InstanceQuery>,
) -> Result<Json<Vec<ModelInstance>>> {
    let instances = state
        .registry
        .get_all_instances(query.worker_key.as_deref(), query.healthy_only)
        .await?;
    Ok(Json(instances))
}
