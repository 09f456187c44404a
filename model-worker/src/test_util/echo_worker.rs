//! Scriptable in-process worker.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use cluster_common::{
    error_code, EmbeddingsRequest, FinishReason, ModelMetadata, ModelOutput, ModelUsage,
    ParameterDescription, PromptRequest, WorkerParams, WorkerType,
};
use serde_json::json;

use crate::error::{Error, Result};
use crate::worker::{ModelOutputStream, ModelWorker, WorkerFactory};

/// Replies with the last message. Streams grow one word per chunk and finish with a
/// chunk that repeats the full text with `finish_reason: stop`.
pub struct EchoWorker {
    model_name: String,
    worker_type: WorkerType,
    delay: Duration,
    startup_delay: Duration,
    in_place_updates: bool,
    alive: AtomicBool,
    fail_generation: AtomicBool,
    fail_stop: AtomicBool,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl EchoWorker {
    pub fn new(model_name: &str, worker_type: WorkerType) -> Self {
        Self {
            model_name: model_name.to_string(),
            worker_type,
            delay: Duration::ZERO,
            startup_delay: Duration::ZERO,
            in_place_updates: false,
            alive: AtomicBool::new(false),
            fail_generation: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pause before each reply and between stream chunks.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn with_in_place_updates(mut self) -> Self {
        self.in_place_updates = true;
        self
    }

    /// Simulate the process dying: `is_alive` turns false and calls fail.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn revive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn fail_generation(&self, fail: bool) {
        self.fail_generation.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Generation calls served.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Most calls ever in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Internal(format!("Echo worker {} is down", self.model_name)))
        }
    }

    fn enter(&self) -> InFlightGuard {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard {
            counter: self.in_flight.clone(),
        }
    }
}

struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn reply_text(request: &PromptRequest) -> String {
    request
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[async_trait]
impl ModelWorker for EchoWorker {
    fn backend(&self) -> &'static str {
        "echo"
    }

    fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    fn parameter_descriptions(&self) -> Vec<ParameterDescription> {
        vec![ParameterDescription::new(
            "concurrency",
            "integer",
            Some(json!(5)),
            "Concurrent calls admitted",
        )]
    }

    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.startup_delay).await;
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "Echo worker {} refused to stop",
                self.model_name
            )));
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn update_params(&self, _params: &WorkerParams) -> Result<bool> {
        Ok(self.in_place_updates)
    }

    async fn generate(&self, request: &PromptRequest) -> Result<ModelOutput> {
        self.ensure_alive()?;
        let _guard = self.enter();
        tokio::time::sleep(self.delay).await;

        if self.fail_generation.load(Ordering::SeqCst) {
            return Ok(ModelOutput::error(
                error_code::INTERNAL_ERROR,
                "echo worker failure",
            ));
        }
        let text = reply_text(request);
        let usage = ModelUsage::new(word_count(&request.prompt_text()), word_count(&text));
        Ok(ModelOutput::text(text)
            .with_finish_reason(FinishReason::Stop)
            .with_usage(usage))
    }

    async fn generate_stream(&self, request: PromptRequest) -> Result<ModelOutputStream> {
        self.ensure_alive()?;
        let guard = self.enter();
        let delay = self.delay;
        let fail = self.fail_generation.load(Ordering::SeqCst);
        let text = reply_text(&request);
        let usage = ModelUsage::new(word_count(&request.prompt_text()), word_count(&text));

        Ok(Box::pin(stream! {
            let _guard = guard;
            let mut current = String::new();
            for (i, word) in text.split_whitespace().enumerate() {
                tokio::time::sleep(delay).await;
                if i > 0 {
                    current.push(' ');
                }
                current.push_str(word);
                yield ModelOutput::text(current.clone());
                if fail {
                    yield ModelOutput::error(error_code::INTERNAL_ERROR, "echo worker failure");
                    return;
                }
            }
            yield ModelOutput::text(current)
                .with_finish_reason(FinishReason::Stop)
                .with_usage(usage);
        }))
    }

    async fn embeddings(&self, request: &EmbeddingsRequest) -> Result<Vec<Vec<f32>>> {
        self.ensure_alive()?;
        let _guard = self.enter();
        tokio::time::sleep(self.delay).await;
        match (self.worker_type, &request.query) {
            (WorkerType::Reranker, Some(query)) => Ok(vec![request
                .input
                .iter()
                .map(|doc| if doc.contains(query.as_str()) { 1.0 } else { 0.0 })
                .collect()]),
            (WorkerType::Embedding, None) => Ok(request
                .input
                .iter()
                .map(|text| vec![text.chars().count() as f32, word_count(text) as f32])
                .collect()),
            _ => Err(Error::Unsupported(format!(
                "Echo worker {} cannot serve this request",
                self.model_name
            ))),
        }
    }

    async fn count_token(&self, prompt: &str) -> Result<usize> {
        self.ensure_alive()?;
        Ok(word_count(prompt) as usize)
    }

    async fn metadata(&self) -> Result<ModelMetadata> {
        self.ensure_alive()?;
        Ok(ModelMetadata {
            model: self.model_name.clone(),
            backend: Some("echo".to_string()),
            context_length: Some(2048),
            ..Default::default()
        })
    }
}

/// Builds [`EchoWorker`]s and keeps a handle to each for inspection.
#[derive(Default)]
pub struct EchoWorkerFactory {
    delay: Duration,
    startup_delay: Duration,
    in_place_updates: bool,
    workers: Mutex<Vec<Arc<EchoWorker>>>,
}

impl EchoWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn with_in_place_updates(mut self) -> Self {
        self.in_place_updates = true;
        self
    }

    /// Every worker created so far, in creation order.
    pub fn workers(&self) -> Vec<Arc<EchoWorker>> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Workers created for one model.
    pub fn workers_for(&self, model_name: &str) -> Vec<Arc<EchoWorker>> {
        self.workers()
            .into_iter()
            .filter(|w| w.model_name == model_name)
            .collect()
    }
}

impl WorkerFactory for EchoWorkerFactory {
    fn create(
        &self,
        model_name: &str,
        worker_type: WorkerType,
        _params: &WorkerParams,
    ) -> Result<Arc<dyn ModelWorker>> {
        let mut worker = EchoWorker::new(model_name, worker_type)
            .with_delay(self.delay)
            .with_startup_delay(self.startup_delay);
        if self.in_place_updates {
            worker = worker.with_in_place_updates();
        }
        let worker = Arc::new(worker);
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker.clone());
        Ok(worker)
    }
}
