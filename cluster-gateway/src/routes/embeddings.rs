//! OpenAI-compatible /v1/embeddings endpoint.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use cluster_common::chat::{EmbeddingsApiRequest, EmbeddingsApiResponse};
use cluster_common::{EmbeddingsRequest, WorkerType};

use super::check_model;
use crate::error::{ApiError, Result};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/embeddings", post(create_embeddings))
}

/// POST /v1/embeddings
async fn create_embeddings(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<EmbeddingsApiRequest>, JsonRejection>,
) -> Result<Json<EmbeddingsApiResponse>> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let model = request
        .model
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("'model' is a required property".to_string()))?;
    let input = request.input.into_vec();
    if input.is_empty() {
        return Err(ApiError::InvalidRequest("'input' must not be empty".to_string()));
    }
    check_model(&state, &model, &[WorkerType::Embedding]).await?;

    let vectors = state
        .manager
        .embeddings(EmbeddingsRequest::new(model.clone(), input))
        .await?;
    Ok(Json(EmbeddingsApiResponse::new(model, vectors)))
}
