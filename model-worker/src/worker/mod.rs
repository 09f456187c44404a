//! Model worker abstraction layer.
//!
//! A `ModelWorker` is one running model behind a fixed call surface. The manager owns
//! its lifecycle and admission; the worker only knows how to start, stop and serve calls.
//! Backends are picked by `WorkerParams.backend` through a `WorkerFactory`.

mod llama_server;
mod ollama;

pub use llama_server::LlamaServerWorker;
pub use ollama::OllamaWorker;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use cluster_common::{
    EmbeddingsRequest, ModelMetadata, ModelOutput, ParameterDescription, PromptRequest,
    WorkerParams, WorkerType,
};
use futures_util::Stream;

use crate::error::{Error, Result};

/// Stream of cumulative generation outputs. A failed item (`error_code != 0`) is the last one.
pub type ModelOutputStream = Pin<Box<dyn Stream<Item = ModelOutput> + Send>>;

#[async_trait]
pub trait ModelWorker: Send + Sync {
    /// Backend identifier (e.g., "llama_server", "ollama").
    fn backend(&self) -> &'static str;

    fn worker_type(&self) -> WorkerType;

    /// Startup parameters this backend understands.
    fn parameter_descriptions(&self) -> Vec<ParameterDescription>;

    /// Bring the model up. Returns once the worker can serve calls.
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Whether the underlying process or daemon connection is still usable.
    async fn is_alive(&self) -> bool;

    /// Apply new parameters without a restart. `Ok(false)` means the backend cannot, and
    /// the caller should restart the worker instead.
    async fn update_params(&self, _params: &WorkerParams) -> Result<bool> {
        Ok(false)
    }

    async fn generate(&self, request: &PromptRequest) -> Result<ModelOutput>;

    async fn generate_stream(&self, request: PromptRequest) -> Result<ModelOutputStream>;

    /// Embedding vectors, one per input. Rerankers return a single row of scores.
    async fn embeddings(&self, request: &EmbeddingsRequest) -> Result<Vec<Vec<f32>>>;

    async fn count_token(&self, prompt: &str) -> Result<usize>;

    async fn metadata(&self) -> Result<ModelMetadata>;
}

/// Builds workers for startup requests.
pub trait WorkerFactory: Send + Sync {
    fn create(
        &self,
        model_name: &str,
        worker_type: WorkerType,
        params: &WorkerParams,
    ) -> Result<Arc<dyn ModelWorker>>;
}

/// Factory for the built-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultWorkerFactory;

impl WorkerFactory for DefaultWorkerFactory {
    fn create(
        &self,
        model_name: &str,
        worker_type: WorkerType,
        params: &WorkerParams,
    ) -> Result<Arc<dyn ModelWorker>> {
        match params.backend.as_str() {
            "llama_server" => Ok(Arc::new(LlamaServerWorker::new(
                model_name,
                worker_type,
                params.clone(),
            )?)),
            "ollama" => Ok(Arc::new(OllamaWorker::new(
                model_name,
                worker_type,
                params.clone(),
            )?)),
            other => Err(Error::Validation(format!(
                "Unknown worker backend '{}' for model {}",
                other, model_name
            ))),
        }
    }
}

/// Text prepended to generated output when the request asks for echo.
pub(crate) fn echo_prefix(request: &PromptRequest) -> String {
    if request.echo {
        request.prompt_text()
    } else {
        String::new()
    }
}

/// Client for a local backend. Embedding calls may be driven from a blocking bridge on a
/// short-lived runtime, so those workers keep no pooled connections.
pub(crate) fn backend_client(worker_type: WorkerType) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if worker_type.is_embedding_like() {
        builder = builder.pool_max_idle_per_host(0);
    }
    builder
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
}
