//! OpenAI-compatible /v1/models endpoint.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use cluster_common::chat::ModelList;
use cluster_common::WorkerType;

use super::model_names;
use crate::error::Result;
use crate::AppState;

/// GET /v1/models - List models with a healthy LLM or embedding instance
async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelList>> {
    let names = model_names(&state, &[WorkerType::Llm, WorkerType::Embedding]).await?;
    Ok(Json(ModelList::new(names)))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/models", get(list_models))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_response_serialization() {
        let response = ModelList::new(vec!["test-model".to_string()]);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test-model"));
        assert!(json.contains(r#""object":"list""#));
    }
}
