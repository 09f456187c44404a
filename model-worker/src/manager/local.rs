//! Worker manager for workers hosted in this process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use cluster_common::protocol::{CountTokenRequest, MetadataRequest};
use cluster_common::{
    error_code, ApplyOutput, ApplyType, EmbeddingsRequest, InstanceKey, ModelInstance,
    ModelMetadata, ModelOutput, ParameterDescription, PromptRequest, WorkerApplyOutput,
    WorkerApplyRequest, WorkerStartupRequest, WorkerType,
};
use futures_util::future::select_all;
use futures_util::StreamExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock};

use super::run_data::WorkerRunData;
use super::selection::SelectionPolicy;
use super::{embedding_worker_type, heartbeat, WorkerManager};
use crate::config::{HeartbeatConfig, ManagerConfig};
use crate::error::{Error, Result};
use crate::registry::ModelRegistry;
use crate::worker::{ModelOutputStream, ModelWorker, WorkerFactory};

const HEARTBEAT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type SpecKey = (String, String, u16);

/// Owns the workers running on this host and dispatches calls to them.
///
/// Lifecycle operations (startup, shutdown, stop) are serialized by one lock; calls only
/// take short read locks on the worker map and then go through each worker's semaphore.
pub struct LocalWorkerManager {
    registry: Arc<dyn ModelRegistry>,
    factory: Arc<dyn WorkerFactory>,
    heartbeat: HeartbeatConfig,
    config: ManagerConfig,
    workers: RwLock<HashMap<String, Vec<Arc<WorkerRunData>>>>,
    /// Every startup request seen, so `apply(START)` can bring stopped instances back.
    specs: RwLock<BTreeMap<SpecKey, WorkerStartupRequest>>,
    startup_models: Vec<WorkerStartupRequest>,
    policy: SelectionPolicy,
    lifecycle: Mutex<()>,
}

impl LocalWorkerManager {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        factory: Arc<dyn WorkerFactory>,
        heartbeat: HeartbeatConfig,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            factory,
            heartbeat,
            config,
            workers: RwLock::new(HashMap::new()),
            specs: RwLock::new(BTreeMap::new()),
            startup_models: Vec::new(),
            policy: SelectionPolicy::new(),
            lifecycle: Mutex::new(()),
        }
    }

    /// Workers brought up by [`WorkerManager::start`].
    pub fn with_startup_models(mut self, models: Vec<WorkerStartupRequest>) -> Self {
        self.startup_models = models;
        self
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    /// Snapshot of every worker running here.
    pub async fn local_instances(&self) -> Vec<ModelInstance> {
        let workers = self.workers.read().await;
        let mut instances: Vec<ModelInstance> = workers
            .values()
            .flatten()
            .map(|r| r.to_instance())
            .collect();
        instances.sort_by(|a, b| {
            (&a.worker_key, &a.host, a.port).cmp(&(&b.worker_key, &b.host, b.port))
        });
        instances
    }

    /// Run handles for one model, in start order.
    pub async fn run_data(&self, model_name: &str, worker_type: WorkerType) -> Vec<Arc<WorkerRunData>> {
        let worker_key = InstanceKey::new(model_name, worker_type).worker_key();
        self.workers
            .read()
            .await
            .get(&worker_key)
            .cloned()
            .unwrap_or_default()
    }

    /// The run handle `select_one_instance` would pick.
    pub async fn select_run_data(
        &self,
        worker_type: WorkerType,
        model_name: &str,
        healthy_only: bool,
    ) -> Result<Arc<WorkerRunData>> {
        let worker_key = InstanceKey::new(model_name, worker_type).worker_key();
        self.ordered_candidates(&worker_key, healthy_only)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| no_worker(&worker_key))
    }

    async fn find(&self, worker_key: &str, host: &str, port: u16) -> Option<Arc<WorkerRunData>> {
        self.workers
            .read()
            .await
            .get(worker_key)?
            .iter()
            .find(|r| r.matches(worker_key, host, port))
            .cloned()
    }

    async fn ordered_candidates(&self, worker_key: &str, healthy_only: bool) -> Vec<Arc<WorkerRunData>> {
        let ttl = self.heartbeat.ttl();
        let candidates: Vec<Arc<WorkerRunData>> = self
            .workers
            .read()
            .await
            .get(worker_key)
            .map(|list| {
                list.iter()
                    .filter(|r| {
                        if healthy_only {
                            r.is_selectable(ttl)
                        } else {
                            !r.stop_token.is_cancelled()
                        }
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        self.policy.order(
            candidates,
            |r| (r.host.clone(), r.port),
            |r| r.in_flight(),
        )
    }

    /// Select an instance and take one of its permits.
    ///
    /// Tries every candidate without waiting, then waits up to the acquire timeout for
    /// whichever frees a slot first.
    async fn acquire(
        &self,
        worker_type: WorkerType,
        model_name: &str,
    ) -> Result<(Arc<WorkerRunData>, OwnedSemaphorePermit)> {
        let worker_key = InstanceKey::new(model_name, worker_type).worker_key();
        let candidates = self.ordered_candidates(&worker_key, true).await;
        if candidates.is_empty() {
            return Err(no_worker(&worker_key));
        }

        for run_data in &candidates {
            if let Ok(permit) = run_data.semaphore.clone().try_acquire_owned() {
                return Ok((run_data.clone(), permit));
            }
        }

        let waits = candidates
            .iter()
            .map(|r| Box::pin(r.semaphore.clone().acquire_owned()));
        if let Ok((Ok(permit), index, _)) =
            tokio::time::timeout(self.config.acquire_timeout(), select_all(waits)).await
        {
            return Ok((candidates[index].clone(), permit));
        }

        tracing::warn!(
            worker_key = %worker_key,
            instances = candidates.len(),
            "All instances saturated"
        );
        Err(Error::WorkerSaturated(format!(
            "All {} instance(s) of {} are at their concurrency limit",
            candidates.len(),
            worker_key
        )))
    }

    /// Start a worker with the startup timeout, retrying once if it times out.
    async fn start_worker(&self, worker: &Arc<dyn ModelWorker>, worker_key: &str) -> Result<()> {
        let timeout = self.config.startup_timeout();
        for attempt in 1..=2 {
            match tokio::time::timeout(timeout, worker.start()).await {
                Ok(result) => return result,
                Err(_) => {
                    tracing::warn!(
                        worker_key,
                        attempt,
                        timeout_secs = timeout.as_secs_f64(),
                        "Worker startup timed out"
                    );
                    if let Err(e) = worker.stop().await {
                        tracing::debug!(worker_key, error = %e, "Cleanup after timed-out startup failed");
                    }
                }
            }
        }
        Err(Error::WorkerTimeout(format!(
            "Worker {} did not become ready within {:.1}s",
            worker_key,
            timeout.as_secs_f64()
        )))
    }

    async fn startup_locked(&self, request: WorkerStartupRequest) -> Result<ApplyOutput> {
        let started = Instant::now();
        let worker_key = InstanceKey::new(request.model.clone(), request.worker_type).worker_key();

        if self.find(&worker_key, &request.host, request.port).await.is_some() {
            return Err(Error::Validation(format!(
                "Worker {} is already running on {}:{}",
                worker_key, request.host, request.port
            )));
        }

        self.specs.write().await.insert(
            (worker_key.clone(), request.host.clone(), request.port),
            request.clone(),
        );

        let worker = self
            .factory
            .create(&request.model, request.worker_type, &request.params)?;
        self.start_worker(&worker, &worker_key).await?;

        let run_data = Arc::new(WorkerRunData::new(&request, worker));
        if let Err(e) = self.registry.register(run_data.to_instance()).await {
            tracing::error!(worker_key = %worker_key, error = %e, "Failed to register worker");
            if let Err(stop_err) = run_data.worker.stop().await {
                tracing::warn!(worker_key = %worker_key, error = %stop_err, "Failed to stop unregistered worker");
            }
            return Err(e);
        }
        run_data.mark_heartbeat();

        let handle = heartbeat::spawn(
            run_data.clone(),
            self.registry.clone(),
            self.heartbeat.clone(),
        );
        run_data.set_heartbeat_task(handle).await;

        self.workers
            .write()
            .await
            .entry(worker_key.clone())
            .or_default()
            .push(run_data);

        tracing::info!(
            worker_key = %worker_key,
            host = %request.host,
            port = request.port,
            backend = %request.params.backend,
            concurrency = request.params.concurrency,
            "Worker started"
        );
        Ok(ApplyOutput::ok(
            format!("Started {} on {}:{}", worker_key, request.host, request.port),
            started.elapsed().as_secs_f64(),
        ))
    }

    async fn shutdown_locked(&self, request: &WorkerStartupRequest) -> Result<ApplyOutput> {
        let started = Instant::now();
        let worker_key = InstanceKey::new(request.model.clone(), request.worker_type).worker_key();

        let removed = {
            let mut workers = self.workers.write().await;
            let removed = workers.get_mut(&worker_key).and_then(|list| {
                let index = list
                    .iter()
                    .position(|r| r.matches(&worker_key, &request.host, request.port))?;
                Some(list.remove(index))
            });
            if workers.get(&worker_key).is_some_and(|list| list.is_empty()) {
                workers.remove(&worker_key);
            }
            removed
        };

        let Some(run_data) = removed else {
            self.registry
                .deregister(&worker_key, &request.host, request.port)
                .await?;
            return Ok(ApplyOutput::ok(
                format!("{} on {}:{} is already stopped", worker_key, request.host, request.port),
                started.elapsed().as_secs_f64(),
            ));
        };

        self.teardown(&run_data).await?;
        Ok(ApplyOutput::ok(
            format!("Stopped {} on {}:{}", worker_key, request.host, request.port),
            started.elapsed().as_secs_f64(),
        ))
    }

    /// Stop signal, heartbeat, admission, registry entry, then the worker itself.
    async fn teardown(&self, run_data: &WorkerRunData) -> Result<()> {
        run_data.stop_heartbeat(HEARTBEAT_JOIN_TIMEOUT).await;
        run_data.semaphore.close();

        if let Err(e) = self
            .registry
            .deregister(&run_data.worker_key, &run_data.host, run_data.port)
            .await
        {
            tracing::warn!(
                worker_key = %run_data.worker_key,
                host = %run_data.host,
                port = run_data.port,
                error = %e,
                "Failed to deregister worker"
            );
        }

        run_data.worker.stop().await?;
        tracing::info!(
            worker_key = %run_data.worker_key,
            host = %run_data.host,
            port = run_data.port,
            "Worker stopped"
        );
        Ok(())
    }

    async fn restart(&self, request: WorkerStartupRequest) -> Result<ApplyOutput> {
        let started = Instant::now();
        let _guard = self.lifecycle.lock().await;
        self.shutdown_locked(&request).await?;
        self.startup_locked(request.clone()).await?;
        Ok(ApplyOutput::ok(
            format!("Restarted {} on {}:{}", request.model, request.host, request.port),
            started.elapsed().as_secs_f64(),
        ))
    }

    async fn update_params(
        &self,
        spec: WorkerStartupRequest,
        patch: Option<&serde_json::Value>,
    ) -> Result<ApplyOutput> {
        let started = Instant::now();
        let patch = patch.ok_or_else(|| {
            Error::Validation("params are required for UPDATE_PARAMS".to_string())
        })?;
        let params = spec
            .params
            .merged(patch)
            .map_err(|e| Error::Validation(format!("Invalid params: {}", e)))?;
        let worker_key = InstanceKey::new(spec.model.clone(), spec.worker_type).worker_key();

        let in_place = params.backend == spec.params.backend
            && params.concurrency == spec.params.concurrency;
        if in_place {
            if let Some(run_data) = self.find(&worker_key, &spec.host, spec.port).await {
                if run_data.worker.update_params(&params).await? {
                    let key = (worker_key.clone(), spec.host.clone(), spec.port);
                    if let Some(stored) = self.specs.write().await.get_mut(&key) {
                        stored.params = params;
                    }
                    tracing::info!(worker_key = %worker_key, port = spec.port, "Parameters updated in place");
                    return Ok(ApplyOutput::ok(
                        format!("Updated parameters of {} on {}:{}", worker_key, spec.host, spec.port),
                        started.elapsed().as_secs_f64(),
                    ));
                }
            }
        }

        tracing::info!(worker_key = %worker_key, port = spec.port, "Restarting to apply parameters");
        self.restart(WorkerStartupRequest { params, ..spec }).await
    }

    /// Remembered specs of `worker_key`, split into (running, stopped).
    async fn specs_for(&self, worker_key: &str) -> (Vec<WorkerStartupRequest>, Vec<WorkerStartupRequest>) {
        let specs: Vec<WorkerStartupRequest> = self
            .specs
            .read()
            .await
            .iter()
            .filter(|((key, _, _), _)| key == worker_key)
            .map(|(_, spec)| spec.clone())
            .collect();

        let mut running = Vec::new();
        let mut stopped = Vec::new();
        for spec in specs {
            if self.find(worker_key, &spec.host, spec.port).await.is_some() {
                running.push(spec);
            } else {
                stopped.push(spec);
            }
        }
        (running, stopped)
    }

    async fn with_generate_timeout<T>(
        &self,
        run_data: &WorkerRunData,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.generate_timeout();
        tokio::select! {
            _ = run_data.stop_token.cancelled() => Err(worker_stopped(run_data)),
            result = tokio::time::timeout(timeout, call) => result.map_err(|_| {
                Error::WorkerTimeout(format!(
                    "{} on {}:{} did not answer within {:.1}s",
                    run_data.worker_key,
                    run_data.host,
                    run_data.port,
                    timeout.as_secs_f64()
                ))
            })?,
        }
    }
}

fn no_worker(worker_key: &str) -> Error {
    Error::NoAvailableWorker(format!("No available worker for {}", worker_key))
}

fn worker_stopped(run_data: &WorkerRunData) -> Error {
    Error::WorkerFailure {
        code: error_code::INTERNAL_ERROR,
        message: format!(
            "Worker {} on {}:{} was stopped during the call",
            run_data.worker_key, run_data.host, run_data.port
        ),
    }
}

#[async_trait]
impl WorkerManager for LocalWorkerManager {
    async fn start(&self) -> Result<()> {
        let mut failed = Vec::new();
        for request in self.startup_models.clone() {
            let label = format!("{}@{}", request.model, request.worker_type);
            if let Err(e) = self.model_startup(request).await {
                tracing::error!(worker = %label, error = %e, "Failed to start configured worker");
                failed.push(label);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::StartupFailed(format!(
                "Failed to start: {}",
                failed.join(", ")
            )))
        }
    }

    async fn stop(&self, ignore_exception: bool) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let mut failures = 0;
        loop {
            let next = {
                let mut workers = self.workers.write().await;
                let key = workers.keys().next().cloned();
                key.and_then(|key| {
                    let list = workers.get_mut(&key)?;
                    let run_data = list.pop();
                    if list.is_empty() {
                        workers.remove(&key);
                    }
                    run_data
                })
            };
            let Some(run_data) = next else {
                break;
            };

            if let Err(e) = self.teardown(&run_data).await {
                if !ignore_exception {
                    return Err(e);
                }
                tracing::error!(
                    worker_key = %run_data.worker_key,
                    port = run_data.port,
                    error = %e,
                    "Failed to stop worker, continuing"
                );
                failures += 1;
            }
        }

        if failures > 0 {
            tracing::warn!(failures, "Stopped all workers with errors");
        }
        Ok(())
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
        Ok(self
            .select_run_data(worker_type, model_name, healthy_only)
            .await?
            .to_instance())
    }

    async fn model_startup(&self, request: WorkerStartupRequest) -> Result<ApplyOutput> {
        let _guard = self.lifecycle.lock().await;
        self.startup_locked(request).await
    }

    async fn model_shutdown(&self, request: WorkerStartupRequest) -> Result<ApplyOutput> {
        let _guard = self.lifecycle.lock().await;
        self.shutdown_locked(&request).await
    }

    async fn worker_apply(&self, request: WorkerApplyRequest) -> Result<WorkerApplyOutput> {
        let started = Instant::now();
        let worker_key = InstanceKey::new(request.model.clone(), request.worker_type).worker_key();
        let (running, stopped) = self.specs_for(&worker_key).await;
        let targets = match request.apply_type {
            ApplyType::Start => stopped,
            ApplyType::Stop | ApplyType::Restart | ApplyType::UpdateParams => running,
        };

        tracing::info!(
            worker_key = %worker_key,
            apply_type = %request.apply_type,
            instances = targets.len(),
            "Applying operation"
        );

        let mut results = BTreeMap::new();
        for spec in targets {
            let one = Instant::now();
            let address = format!("{}@{}:{}", worker_key, spec.host, spec.port);
            let outcome = match request.apply_type {
                ApplyType::Start => self.model_startup(spec).await,
                ApplyType::Stop => self.model_shutdown(spec).await,
                ApplyType::Restart => self.restart(spec).await,
                ApplyType::UpdateParams => self.update_params(spec, request.params.as_ref()).await,
            };
            let output = outcome.unwrap_or_else(|e| {
                tracing::warn!(worker_key = %worker_key, %address, error = %e, "Apply failed");
                ApplyOutput::failed(e.to_string(), one.elapsed().as_secs_f64())
            });
            results.insert(address, output);
        }

        Ok(WorkerApplyOutput::aggregate(
            results,
            started.elapsed().as_secs_f64(),
        ))
    }

    async fn generate(&self, request: PromptRequest) -> Result<ModelOutput> {
        let (run_data, _permit) = self.acquire(WorkerType::Llm, &request.model).await?;
        self.with_generate_timeout(&run_data, run_data.worker.generate(&request))
            .await
    }

    async fn generate_stream(&self, request: PromptRequest) -> Result<ModelOutputStream> {
        let (run_data, permit) = self.acquire(WorkerType::Llm, &request.model).await?;
        let mut inner = self
            .with_generate_timeout(&run_data, run_data.worker.generate_stream(request))
            .await?;
        let stop = run_data.stop_token.clone();

        Ok(Box::pin(stream! {
            let _permit = permit;
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => None,
                    item = inner.next() => Some(item),
                };
                match next {
                    None => {
                        tracing::warn!(worker_key = %run_data.worker_key, "Worker stopped mid-stream");
                        yield worker_stopped(&run_data).to_output();
                        break;
                    }
                    Some(None) => break,
                    Some(Some(output)) => {
                        let failed = output.is_error();
                        yield output;
                        if failed {
                            break;
                        }
                    }
                }
            }
        }))
    }

    async fn embeddings(&self, request: EmbeddingsRequest) -> Result<Vec<Vec<f32>>> {
        let worker_type = embedding_worker_type(&request);
        let (run_data, _permit) = self.acquire(worker_type, &request.model).await?;
        self.with_generate_timeout(&run_data, run_data.worker.embeddings(&request))
            .await
    }

    async fn count_token(&self, request: CountTokenRequest) -> Result<usize> {
        let (run_data, _permit) = self.acquire(WorkerType::Llm, &request.model).await?;
        run_data.worker.count_token(&request.prompt).await
    }

    async fn get_model_metadata(&self, request: MetadataRequest) -> Result<ModelMetadata> {
        let (run_data, _permit) = self.acquire(WorkerType::Llm, &request.model).await?;
        run_data.worker.metadata().await
    }

    async fn parameter_descriptions(
        &self,
        worker_type: WorkerType,
        model_name: &str,
    ) -> Result<Vec<ParameterDescription>> {
        let run_data = self
            .select_run_data(worker_type, model_name, false)
            .await?;
        Ok(run_data.worker.parameter_descriptions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EmbeddedRegistry;
    use crate::test_util::{startup_request, EchoWorkerFactory};

    fn manager(factory: Arc<EchoWorkerFactory>) -> LocalWorkerManager {
        let registry = Arc::new(EmbeddedRegistry::new(
            chrono::Duration::seconds(60),
            Duration::from_secs(60),
        ));
        let manager_config = ManagerConfig {
            startup_timeout_secs: 0.2,
            acquire_timeout_ms: 50,
            generate_timeout_secs: 5.0,
        };
        LocalWorkerManager::new(registry, factory, HeartbeatConfig::default(), manager_config)
    }

    #[tokio::test]
    async fn test_startup_registers_and_generates() {
        let manager = manager(Arc::new(EchoWorkerFactory::new()));
        manager.model_startup(startup_request("m1", 8001, 2)).await.unwrap();

        let instances = manager.registry().get_all_instances(Some("m1@llm"), true).await.unwrap();
        assert_eq!(instances.len(), 1);

        let request = PromptRequest::new("m1", vec![cluster_common::ModelMessage::user("hi")]);
        let output = manager.generate(request).await.unwrap();
        assert_eq!(output.error_code, 0);
    }

    #[tokio::test]
    async fn test_duplicate_startup_rejected() {
        let manager = manager(Arc::new(EchoWorkerFactory::new()));
        manager.model_startup(startup_request("m1", 8001, 1)).await.unwrap();
        let result = manager.model_startup(startup_request("m1", 8001, 1)).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_startup_timeout_retried_once() {
        let factory = Arc::new(EchoWorkerFactory::new().with_startup_delay(Duration::from_secs(5)));
        let manager = manager(factory.clone());
        let result = manager.model_startup(startup_request("m1", 8001, 1)).await;
        assert!(matches!(result, Err(Error::WorkerTimeout(_))));
        assert_eq!(factory.workers()[0].start_calls(), 2);
        assert!(manager.run_data("m1", WorkerType::Llm).await.is_empty());
    }

    #[tokio::test]
    async fn test_saturated_instance_fails_fast() {
        let factory = Arc::new(EchoWorkerFactory::new());
        let manager = manager(factory);
        manager.model_startup(startup_request("m1", 8001, 1)).await.unwrap();

        let run_data = manager.run_data("m1", WorkerType::Llm).await;
        let _held = run_data[0].semaphore.clone().try_acquire_owned().unwrap();

        let request = PromptRequest::new("m1", vec![cluster_common::ModelMessage::user("hi")]);
        let result = manager.generate(request).await;
        assert!(matches!(result, Err(Error::WorkerSaturated(_))));
    }

    #[tokio::test]
    async fn test_unknown_model_has_no_worker() {
        let manager = manager(Arc::new(EchoWorkerFactory::new()));
        let result = manager.select_one_instance(WorkerType::Llm, "nope", true).await;
        assert!(matches!(result, Err(Error::NoAvailableWorker(_))));
    }

    #[tokio::test]
    async fn test_stop_continues_past_failures() {
        let factory = Arc::new(EchoWorkerFactory::new());
        let manager = manager(factory.clone());
        manager.model_startup(startup_request("m1", 8001, 1)).await.unwrap();
        manager.model_startup(startup_request("m2", 8001, 1)).await.unwrap();
        for worker in factory.workers() {
            worker.fail_stop(true);
        }

        manager.stop(true).await.unwrap();
        assert!(manager.local_instances().await.is_empty());
        assert!(factory.workers().iter().all(|w| w.stop_calls() == 1));
    }

    #[tokio::test]
    async fn test_apply_start_restores_stopped_instance() {
        let manager = manager(Arc::new(EchoWorkerFactory::new()));
        manager.model_startup(startup_request("m1", 8001, 1)).await.unwrap();

        let stop = WorkerApplyRequest {
            model: "m1".to_string(),
            apply_type: ApplyType::Stop,
            worker_type: WorkerType::Llm,
            params: None,
        };
        assert!(manager.worker_apply(stop.clone()).await.unwrap().success);
        assert!(manager.local_instances().await.is_empty());

        let start = WorkerApplyRequest {
            apply_type: ApplyType::Start,
            ..stop
        };
        let output = manager.worker_apply(start).await.unwrap();
        assert!(output.success);
        assert!(output.results.contains_key("m1@llm@127.0.0.1:8001"));
        assert_eq!(manager.local_instances().await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_params_restarts_when_not_in_place() {
        let factory = Arc::new(EchoWorkerFactory::new());
        let manager = manager(factory.clone());
        manager.model_startup(startup_request("m1", 8001, 1)).await.unwrap();

        let apply = WorkerApplyRequest {
            model: "m1".to_string(),
            apply_type: ApplyType::UpdateParams,
            worker_type: WorkerType::Llm,
            params: Some(serde_json::json!({"concurrency": 3})),
        };
        let output = manager.worker_apply(apply).await.unwrap();
        assert!(output.success, "{:?}", output);

        let run_data = manager.run_data("m1", WorkerType::Llm).await;
        assert_eq!(run_data[0].limit, 3);
        assert_eq!(factory.workers().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_without_instances_fails() {
        let manager = manager(Arc::new(EchoWorkerFactory::new()));
        let apply = WorkerApplyRequest {
            model: "ghost".to_string(),
            apply_type: ApplyType::Restart,
            worker_type: WorkerType::Llm,
            params: None,
        };
        let output = manager.worker_apply(apply).await.unwrap();
        assert!(!output.success);
    }
}
