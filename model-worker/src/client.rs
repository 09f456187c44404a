//! Call surface for code that needs a model but not a deployment.

use std::sync::Arc;

use async_trait::async_trait;
use cluster_common::protocol::{CountTokenRequest, MetadataRequest};
use cluster_common::{ModelMetadata, ModelOutput, PromptRequest, WorkerType};

use crate::error::Result;
use crate::manager::WorkerManager;
use crate::worker::ModelOutputStream;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: PromptRequest) -> Result<ModelOutput>;

    async fn generate_stream(&self, request: PromptRequest) -> Result<ModelOutputStream>;

    /// Metadata of every model with a healthy LLM instance.
    async fn models(&self) -> Result<Vec<ModelMetadata>>;

    async fn count_token(&self, model: &str, prompt: &str) -> Result<usize>;
}

/// [`LlmClient`] over any worker manager, local or remote.
#[derive(Clone)]
pub struct ClusterLlmClient {
    manager: Arc<dyn WorkerManager>,
}

impl ClusterLlmClient {
    pub fn new(manager: Arc<dyn WorkerManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl LlmClient for ClusterLlmClient {
    async fn generate(&self, request: PromptRequest) -> Result<ModelOutput> {
        self.manager.generate(request).await
    }

    async fn generate_stream(&self, request: PromptRequest) -> Result<ModelOutputStream> {
        self.manager.generate_stream(request).await
    }

    async fn models(&self) -> Result<Vec<ModelMetadata>> {
        let instances = self
            .manager
            .get_all_model_instances(Some(WorkerType::Llm), true)
            .await?;
        let mut names: Vec<String> = instances.iter().filter_map(|i| i.model_name()).collect();
        names.sort();
        names.dedup();

        let mut models = Vec::with_capacity(names.len());
        for model in names {
            match self
                .manager
                .get_model_metadata(MetadataRequest {
                    model: model.clone(),
                })
                .await
            {
                Ok(metadata) => models.push(metadata),
                Err(e) => {
                    tracing::warn!(%model, error = %e, "Metadata lookup failed");
                    models.push(ModelMetadata {
                        model,
                        ..Default::default()
                    });
                }
            }
        }
        Ok(models)
    }

    async fn count_token(&self, model: &str, prompt: &str) -> Result<usize> {
        self.manager
            .count_token(CountTokenRequest {
                model: model.to_string(),
                prompt: prompt.to_string(),
            })
            .await
    }
}
