//! Worker managers: the single dispatch point for model calls.
//!
//! [`LocalWorkerManager`] hosts workers in this process. [`RemoteWorkerManager`] resolves
//! instances through a registry and calls worker hosts over HTTP. Both implement
//! [`WorkerManager`], so callers never need to know where a model runs.

pub mod bridge;
mod heartbeat;
mod local;
mod remote;
mod run_data;
mod selection;

pub use local::LocalWorkerManager;
pub use remote::RemoteWorkerManager;
pub use run_data::WorkerRunData;
pub use selection::SelectionPolicy;

use async_trait::async_trait;
use cluster_common::protocol::{CountTokenRequest, MetadataRequest};
use cluster_common::{
    ApplyOutput, EmbeddingsRequest, ModelInstance, ModelMetadata, ModelOutput,
    ParameterDescription, PromptRequest, WorkerApplyOutput, WorkerApplyRequest,
    WorkerStartupRequest, WorkerType,
};

use crate::error::Result;
use crate::worker::ModelOutputStream;

#[async_trait]
pub trait WorkerManager: Send + Sync {
    /// Bring up every configured worker.
    async fn start(&self) -> Result<()>;

    /// Tear down every worker. With `ignore_exception`, failures are logged and every
    /// worker is still attempted.
    async fn stop(&self, ignore_exception: bool) -> Result<()>;

    async fn get_all_model_instances(
        &self,
        worker_type: Option<WorkerType>,
        healthy_only: bool,
    ) -> Result<Vec<ModelInstance>>;

    async fn select_one_instance(
        &self,
        worker_type: WorkerType,
        model_name: &str,
        healthy_only: bool,
    ) -> Result<ModelInstance>;

    async fn model_startup(&self, request: WorkerStartupRequest) -> Result<ApplyOutput>;

    /// Idempotent: stopping an absent instance succeeds.
    async fn model_shutdown(&self, request: WorkerStartupRequest) -> Result<ApplyOutput>;

    async fn worker_apply(&self, request: WorkerApplyRequest) -> Result<WorkerApplyOutput>;

    async fn generate(&self, request: PromptRequest) -> Result<ModelOutput>;

    async fn generate_stream(&self, request: PromptRequest) -> Result<ModelOutputStream>;

    /// Embeddings, or rerank scores when `request.query` is set.
    async fn embeddings(&self, request: EmbeddingsRequest) -> Result<Vec<Vec<f32>>>;

    async fn count_token(&self, request: CountTokenRequest) -> Result<usize>;

    async fn get_model_metadata(&self, request: MetadataRequest) -> Result<ModelMetadata>;

    async fn parameter_descriptions(
        &self,
        worker_type: WorkerType,
        model_name: &str,
    ) -> Result<Vec<ParameterDescription>>;

    /// Blocking variant of [`WorkerManager::embeddings`] for synchronous callers.
    fn sync_embeddings(&self, request: EmbeddingsRequest) -> Result<Vec<Vec<f32>>> {
        bridge::block_on(self.embeddings(request))
    }
}

/// Worker type serving an embeddings request.
pub(crate) fn embedding_worker_type(request: &EmbeddingsRequest) -> WorkerType {
    if request.query.is_some() {
        WorkerType::Reranker
    } else {
        WorkerType::Embedding
    }
}
