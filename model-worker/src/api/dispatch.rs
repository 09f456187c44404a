//! Model call endpoints.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use cluster_common::protocol::{CountTokenRequest, MetadataRequest, ParameterQuery};
use cluster_common::{EmbeddingsRequest, ModelMetadata, ModelOutput, ParameterDescription, PromptRequest};
use futures_util::StreamExt;

use crate::error::Result;
use crate::manager::WorkerManager;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/generate", post(generate))
        .route("/generate_stream", post(generate_stream))
        .route("/embeddings", post(embeddings))
        .route("/count_token", post(count_token))
        .route("/model_metadata", post(model_metadata))
        .route("/parameter/descriptions", get(parameter_descriptions))
}

/// POST /api/worker/generate
async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PromptRequest>,
) -> Result<Json<ModelOutput>> {
    tracing::debug!(model = %request.model, "Generate request");
    Ok(Json(state.manager.generate(request).await?))
}

/// POST /api/worker/generate_stream - one `ModelOutput` JSON object per line.
///
/// Dropping the connection drops the stream, which releases the worker's permit.
async fn generate_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PromptRequest>,
) -> Result<Response> {
    tracing::debug!(model = %request.model, "Generate stream request");
    let stream = state.manager.generate_stream(request).await?;
    let body = stream.map(|output| {
        serde_json::to_vec(&output).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        })
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response())
}

/// POST /api/worker/embeddings
async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmbeddingsRequest>,
) -> Result<Json<Vec<Vec<f32>>>> {
    Ok(Json(state.manager.embeddings(request).await?))
}

/// POST /api/worker/count_token
async fn count_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CountTokenRequest>,
) -> Result<Json<usize>> {
    Ok(Json(state.manager.count_token(request).await?))
}

/// POST /api/worker/model_metadata
async fn model_metadata(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MetadataRequest>,
) -> Result<Json<ModelMetadata>> {
    Ok(Json(state.manager.get_model_metadata(request).await?))
}

/// GET /api/worker/parameter/descriptions?model=..&worker_type=..
async fn parameter_descriptions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ParameterQuery>,
) -> Result<Json<Vec<ParameterDescription>>> {
    Ok(Json(
        state
            .manager
            .parameter_descriptions(query.worker_type, &query.model)
            .await?,
    ))
}
