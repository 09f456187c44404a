//! Runtime state of one started worker.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use cluster_common::{InstanceKey, ModelInstance, WorkerParams, WorkerStartupRequest, WorkerType};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::worker::ModelWorker;

/// Local handle to a running worker. Never serialized.
///
/// The semaphore is the only admission path to the worker. At most one heartbeat task is
/// attached at a time, and it never outlives `stop_token`.
pub struct WorkerRunData {
    pub host: String,
    pub port: u16,
    pub worker_type: WorkerType,
    pub worker_key: String,
    pub model_name: String,
    pub worker: Arc<dyn ModelWorker>,
    pub params: WorkerParams,
    pub stop_token: CancellationToken,
    pub semaphore: Arc<Semaphore>,
    pub limit: usize,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    last_heartbeat_ms: AtomicI64,
    healthy: AtomicBool,
}

impl WorkerRunData {
    pub fn new(request: &WorkerStartupRequest, worker: Arc<dyn ModelWorker>) -> Self {
        let key = InstanceKey::new(request.model.clone(), request.worker_type);
        let limit = request.params.concurrency.max(1);
        Self {
            host: request.host.clone(),
            port: request.port,
            worker_type: request.worker_type,
            worker_key: key.worker_key(),
            model_name: request.model.clone(),
            worker,
            params: request.params.clone(),
            stop_token: CancellationToken::new(),
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            heartbeat_task: Mutex::new(None),
            last_heartbeat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Returns whether the flag changed.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::SeqCst) != healthy
    }

    pub fn mark_heartbeat(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_heartbeat(&self) -> chrono::DateTime<Utc> {
        let millis = self.last_heartbeat_ms.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Healthy, heartbeat within `ttl`, and not being stopped.
    pub fn is_selectable(&self, ttl: chrono::Duration) -> bool {
        self.is_healthy()
            && !self.stop_token.is_cancelled()
            && Utc::now() - self.last_heartbeat() <= ttl
    }

    pub fn matches(&self, worker_key: &str, host: &str, port: u16) -> bool {
        self.worker_key == worker_key && self.host == host && self.port == port
    }

    pub fn to_instance(&self) -> ModelInstance {
        let key = InstanceKey::new(self.model_name.clone(), self.worker_type);
        let mut instance = ModelInstance::new(&key, self.host.clone(), self.port);
        instance.healthy = self.is_healthy();
        instance.prompt_template = self.params.prompt_template.clone();
        instance.last_heartbeat = self.last_heartbeat();
        instance
    }

    pub fn startup_request(&self) -> WorkerStartupRequest {
        WorkerStartupRequest {
            host: self.host.clone(),
            port: self.port,
            model: self.model_name.clone(),
            worker_type: self.worker_type,
            params: self.params.clone(),
        }
    }

    /// Attach the heartbeat task, aborting any previous one.
    pub async fn set_heartbeat_task(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.heartbeat_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Wait for the heartbeat task to observe `stop_token`, aborting it after `timeout`.
    pub async fn stop_heartbeat(&self, timeout: Duration) {
        self.stop_token.cancel();
        let handle = self.heartbeat_task.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                tracing::warn!(
                    worker_key = %self.worker_key,
                    host = %self.host,
                    port = self.port,
                    "Heartbeat task did not stop in time, aborting"
                );
                handle.abort();
            }
        }
    }

    pub async fn has_heartbeat_task(&self) -> bool {
        self.heartbeat_task.lock().await.is_some()
    }
}
