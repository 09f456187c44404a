//! Worker manager that dispatches to worker hosts over HTTP.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use cluster_common::protocol::{
    CountTokenRequest, MetadataRequest, ParameterQuery, WORKER_API_PREFIX,
};
use cluster_common::{
    error_code, ApplyOutput, EmbeddingsRequest, InstanceKey, ModelInstance, ModelMetadata,
    ModelOutput, ParameterDescription, PromptRequest, WorkerApplyOutput, WorkerApplyRequest,
    WorkerStartupRequest, WorkerType,
};
use futures_util::future::join_all;
use futures_util::StreamExt;
use reqwest::Client;

use super::selection::SelectionPolicy;
use super::{bridge, embedding_worker_type, WorkerManager};
use crate::error::{error_from_response, read_json, Error, Result};
use crate::line_stream::lines;
use crate::registry::ModelRegistry;
use crate::retry::RetryPolicy;
use crate::worker::ModelOutputStream;

/// Dispatches every call to a worker host chosen through the registry.
///
/// Idempotent lookups (metadata, token counts, parameter descriptions) are retried with
/// backoff; generation is never retried against another instance once it has started.
/// A saturated instance (429) is skipped in favour of the next candidate.
pub struct RemoteWorkerManager {
    registry: Arc<dyn ModelRegistry>,
    http_client: Client,
    request_timeout: Duration,
    generate_timeout: Duration,
    retry: RetryPolicy,
    policy: SelectionPolicy,
}

impl RemoteWorkerManager {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        request_timeout: Duration,
        generate_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            http_client: build_client()?,
            request_timeout,
            generate_timeout,
            retry,
            policy: SelectionPolicy::new(),
        })
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    /// A manager over fresh connections and a detached registry, for use on another runtime.
    fn detached(&self) -> Result<Self> {
        let registry: Arc<dyn ModelRegistry> = match self.registry.detached() {
            Some(registry) => Arc::from(registry),
            None => self.registry.clone(),
        };
        Self::new(registry, self.request_timeout, self.generate_timeout, self.retry)
    }

    async fn candidates(&self, worker_type: WorkerType, model_name: &str) -> Result<Vec<ModelInstance>> {
        let worker_key = InstanceKey::new(model_name, worker_type).worker_key();
        let instances = self
            .registry
            .get_all_instances(Some(&worker_key), true)
            .await?;
        if instances.is_empty() {
            return Err(Error::NoAvailableWorker(format!(
                "No available worker for {}",
                worker_key
            )));
        }
        Ok(self
            .policy
            .order(instances, |i| (i.host.clone(), i.port), |_| 0))
    }

    /// Run `call` against candidates in order, moving on only when an instance is saturated.
    async fn dispatch<T, F, Fut>(&self, worker_type: WorkerType, model_name: &str, mut call: F) -> Result<T>
    where
        F: FnMut(ModelInstance) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for instance in self.candidates(worker_type, model_name).await? {
            let address = instance.address();
            match call(instance).await {
                Err(Error::WorkerSaturated(message)) => {
                    tracing::debug!(%address, "Instance saturated, trying next");
                    last_error = Some(Error::WorkerSaturated(message));
                }
                other => return other,
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::NoAvailableWorker(format!("No available worker for {}", model_name))
        }))
    }
}

fn build_client() -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(8)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
}

fn worker_url(host: &str, port: u16, path: &str) -> String {
    format!("http://{}:{}{}/{}", host, port, WORKER_API_PREFIX, path)
}

#[async_trait]
impl WorkerManager for RemoteWorkerManager {
    async fn start(&self) -> Result<()> {
        self.registry.init().await
    }

    async fn stop(&self, ignore_exception: bool) -> Result<()> {
        match self.registry.shutdown().await {
            Err(e) if ignore_exception => {
                tracing::warn!(error = %e, "Registry shutdown failed");
                Ok(())
            }
            other => other,
        }
    }

    async fn get_all_model_instances(
        &self,
        worker_type: Option<WorkerType>,
        healthy_only: bool,
    ) -> Result<Vec<ModelInstance>> {
        let instances = self.registry.get_all_instances(None, healthy_only).await?;
        Ok(instances
            .into_iter()
            .filter(|i| match worker_type {
                Some(wt) => i.key().is_some_and(|k| k.worker_type == wt),
                None => true,
            })
            .collect())
    }

    async fn select_one_instance(
        &self,
        worker_type: WorkerType,
        model_name: &str,
        healthy_only: bool,
    ) -> Result<ModelInstance> {
        let worker_key = InstanceKey::new(model_name, worker_type).worker_key();
        let instances = self
            .registry
            .get_all_instances(Some(&worker_key), healthy_only)
            .await?;
        self.policy
            .order(instances, |i| (i.host.clone(), i.port), |_| 0)
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoAvailableWorker(format!("No available worker for {}", worker_key)))
    }

    async fn model_startup(&self, request: WorkerStartupRequest) -> Result<ApplyOutput> {
        let url = worker_url(&request.host, request.port, "models/startup");
        let response = self.http_client.post(&url).json(&request).send().await?;
        read_json(response).await
    }

    async fn model_shutdown(&self, request: WorkerStartupRequest) -> Result<ApplyOutput> {
        let url = worker_url(&request.host, request.port, "models/shutdown");
        let response = self
            .http_client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;
        read_json(response).await
    }

    async fn worker_apply(&self, request: WorkerApplyRequest) -> Result<WorkerApplyOutput> {
        let started = Instant::now();
        let worker_key = InstanceKey::new(request.model.clone(), request.worker_type).worker_key();

        // Hosts serving the model; a stopped model is only known to its host, so START asks
        // every host in the cluster.
        let mut hosts: BTreeMap<String, (String, u16)> = BTreeMap::new();
        for instance in self.registry.get_all_instances(Some(&worker_key), false).await? {
            hosts.insert(instance.address(), (instance.host, instance.port));
        }
        if hosts.is_empty() {
            for instance in self.registry.get_all_instances(None, false).await? {
                hosts.insert(instance.address(), (instance.host, instance.port));
            }
        }

        let request = &request;
        let worker_key = &worker_key;
        let calls = hosts.into_values().map(|(host, port)| async move {
            let one = Instant::now();
            let url = worker_url(&host, port, "apply");
            let result: Result<WorkerApplyOutput> = async {
                let response = self.http_client.post(&url).json(request).send().await?;
                read_json(response).await
            }
            .await;
            result.unwrap_or_else(|e| {
                tracing::warn!(%host, port, error = %e, "Apply failed on worker host");
                let mut results = BTreeMap::new();
                results.insert(
                    format!("{}@{}:{}", worker_key, host, port),
                    ApplyOutput::failed(e.to_string(), one.elapsed().as_secs_f64()),
                );
                WorkerApplyOutput::aggregate(results, one.elapsed().as_secs_f64())
            })
        });

        let outputs: Vec<WorkerApplyOutput> = join_all(calls)
            .await
            .into_iter()
            .filter(|o| !o.results.is_empty())
            .collect();
        Ok(WorkerApplyOutput::merge(
            outputs,
            started.elapsed().as_secs_f64(),
        ))
    }

    async fn generate(&self, request: PromptRequest) -> Result<ModelOutput> {
        let request = &request;
        self.dispatch(WorkerType::Llm, &request.model, |instance| async move {
            let url = worker_url(&instance.host, instance.port, "generate");
            let response = self
                .http_client
                .post(&url)
                .timeout(self.generate_timeout)
                .json(request)
                .send()
                .await?;
            read_json(response).await
        })
        .await
    }

    async fn generate_stream(&self, request: PromptRequest) -> Result<ModelOutputStream> {
        let request = &request;
        let (address, response) = self
            .dispatch(WorkerType::Llm, &request.model, |instance| async move {
                let url = worker_url(&instance.host, instance.port, "generate_stream");
                let response = self.http_client.post(&url).json(request).send().await?;
                if !response.status().is_success() {
                    return Err(error_from_response(response).await);
                }
                Ok((instance.address(), response))
            })
            .await?;

        let mut body = Box::pin(lines(response.bytes_stream()));
        Ok(Box::pin(stream! {
            while let Some(line) = body.next().await {
                let output = match line {
                    Ok(line) => match serde_json::from_str::<ModelOutput>(&line) {
                        Ok(output) => output,
                        Err(e) => ModelOutput::error(
                            error_code::INTERNAL_ERROR,
                            format!("Malformed stream item from {}: {}", address, e),
                        ),
                    },
                    Err(e) => {
                        tracing::warn!(%address, error = %e, "Remote stream interrupted");
                        e.to_output()
                    }
                };
                let failed = output.is_error();
                yield output;
                if failed {
                    break;
                }
            }
        }))
    }

    async fn embeddings(&self, request: EmbeddingsRequest) -> Result<Vec<Vec<f32>>> {
        let request = &request;
        let worker_type = embedding_worker_type(request);
        self.dispatch(worker_type, &request.model, |instance| async move {
            let url = worker_url(&instance.host, instance.port, "embeddings");
            let response = self
                .http_client
                .post(&url)
                .timeout(self.generate_timeout)
                .json(request)
                .send()
                .await?;
            read_json(response).await
        })
        .await
    }

    async fn count_token(&self, request: CountTokenRequest) -> Result<usize> {
        let request = &request;
        self.dispatch(WorkerType::Llm, &request.model, |instance| async move {
            let url = &worker_url(&instance.host, instance.port, "count_token");
            self.retry
                .run("count_token", || async move {
                    let response = self
                        .http_client
                        .post(url)
                        .timeout(self.request_timeout)
                        .json(request)
                        .send()
                        .await?;
                    read_json(response).await
                })
                .await
        })
        .await
    }

    async fn get_model_metadata(&self, request: MetadataRequest) -> Result<ModelMetadata> {
        let request = &request;
        self.dispatch(WorkerType::Llm, &request.model, |instance| async move {
            let url = &worker_url(&instance.host, instance.port, "model_metadata");
            self.retry
                .run("model_metadata", || async move {
                    let response = self
                        .http_client
                        .post(url)
                        .timeout(self.request_timeout)
                        .json(request)
                        .send()
                        .await?;
                    read_json(response).await
                })
                .await
        })
        .await
    }

    async fn parameter_descriptions(
        &self,
        worker_type: WorkerType,
        model_name: &str,
    ) -> Result<Vec<ParameterDescription>> {
        let instance = self.select_one_instance(worker_type, model_name, false).await?;
        let url = &worker_url(&instance.host, instance.port, "parameter/descriptions");
        let query = &ParameterQuery {
            model: model_name.to_string(),
            worker_type,
        };
        self.retry
            .run("parameter_descriptions", || async move {
                let response = self
                    .http_client
                    .get(url)
                    .timeout(self.request_timeout)
                    .query(query)
                    .send()
                    .await?;
                read_json(response).await
            })
            .await
    }

    /// Runs on its own runtime with fresh connections, since pooled connections belong to
    /// the caller's runtime, which is blocked for the duration.
    fn sync_embeddings(&self, request: EmbeddingsRequest) -> Result<Vec<Vec<f32>>> {
        let detached = self.detached()?;
        bridge::block_on(async move { detached.embeddings(request).await })
    }
}
