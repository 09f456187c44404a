//! In-process registry with TTL health tracking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cluster_common::ModelInstance;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ModelRegistry;
use crate::error::Result;

type InstanceMap = HashMap<String, Vec<ModelInstance>>;

/// Registry held in memory.
///
/// Every mutation goes through the single write lock. Reads that may observe expired
/// instances take the write lock too and mark them unhealthy before answering, so a
/// reader never sees a stale instance that still claims to be healthy. A background
/// sweep started by [`ModelRegistry::init`] does the same marking periodically.
pub struct EmbeddedRegistry {
    instances: Arc<RwLock<InstanceMap>>,
    ttl: chrono::Duration,
    sweep_interval: Duration,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddedRegistry {
    pub fn new(ttl: chrono::Duration, sweep_interval: Duration) -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            sweep_interval,
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Mark instances whose heartbeat is older than the TTL. Returns how many flipped.
    pub async fn sweep(&self) -> usize {
        mark_expired(&mut *self.instances.write().await, self.ttl)
    }
}

fn mark_expired(instances: &mut InstanceMap, ttl: chrono::Duration) -> usize {
    let now = Utc::now();
    let mut flipped = 0;
    for instance in instances.values_mut().flatten() {
        if instance.healthy && instance.is_expired(now, ttl) {
            instance.healthy = false;
            flipped += 1;
            tracing::warn!(
                worker_key = %instance.worker_key,
                host = %instance.host,
                port = instance.port,
                age_secs = (now - instance.last_heartbeat).num_seconds(),
                "Instance missed heartbeats, marking unhealthy"
            );
        }
    }
    flipped
}

#[async_trait]
impl ModelRegistry for EmbeddedRegistry {
    async fn init(&self) -> Result<()> {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return Ok(());
        }

        let instances = self.instances.clone();
        let ttl = self.ttl;
        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        *sweeper = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        mark_expired(&mut *instances.write().await, ttl);
                    }
                }
            }
            tracing::debug!("Registry sweep stopped");
        }));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn register(&self, mut instance: ModelInstance) -> Result<bool> {
        instance.healthy = true;
        instance.last_heartbeat = Utc::now();

        let mut instances = self.instances.write().await;
        let entries = instances.entry(instance.worker_key.clone()).or_default();
        match entries
            .iter_mut()
            .find(|i| i.host == instance.host && i.port == instance.port)
        {
            Some(existing) => {
                tracing::debug!(
                    worker_key = %instance.worker_key,
                    host = %instance.host,
                    port = instance.port,
                    "Refreshing registered instance"
                );
                *existing = instance;
            }
            None => {
                tracing::info!(
                    worker_key = %instance.worker_key,
                    host = %instance.host,
                    port = instance.port,
                    "Registered instance"
                );
                entries.push(instance);
            }
        }
        Ok(true)
    }

    async fn deregister(&self, worker_key: &str, host: &str, port: u16) -> Result<bool> {
        let mut instances = self.instances.write().await;
        let Some(entries) = instances.get_mut(worker_key) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|i| !i.matches(worker_key, host, port));
        let removed = entries.len() < before;
        if entries.is_empty() {
            instances.remove(worker_key);
        }
        if removed {
            tracing::info!(worker_key, host, port, "Deregistered instance");
        }
        Ok(removed)
    }

    async fn heartbeat(&self, worker_key: &str, host: &str, port: u16) -> Result<bool> {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances
            .get_mut(worker_key)
            .and_then(|entries| entries.iter_mut().find(|i| i.matches(worker_key, host, port)))
        else {
            tracing::debug!(worker_key, host, port, "Heartbeat from unknown instance");
            return Ok(false);
        };

        if !instance.healthy {
            tracing::info!(worker_key, host, port, "Instance recovered");
        }
        instance.healthy = true;
        instance.last_heartbeat = Utc::now();
        Ok(true)
    }

    async fn get_all_instances(
        &self,
        worker_key: Option<&str>,
        healthy_only: bool,
    ) -> Result<Vec<ModelInstance>> {
        let mut instances = self.instances.write().await;
        mark_expired(&mut instances, self.ttl);

        let selected = match worker_key {
            Some(key) => instances.get(key).cloned().unwrap_or_default(),
            None => instances.values().flatten().cloned().collect(),
        };
        Ok(selected
            .into_iter()
            .filter(|i| !healthy_only || (i.healthy && i.enabled))
            .collect())
    }
}

impl Drop for EmbeddedRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_common::{InstanceKey, WorkerType};

    fn registry(ttl_ms: i64) -> EmbeddedRegistry {
        EmbeddedRegistry::new(
            chrono::Duration::milliseconds(ttl_ms),
            Duration::from_millis(20),
        )
    }

    fn instance(port: u16) -> ModelInstance {
        ModelInstance::new(&InstanceKey::new("m1", WorkerType::Llm), "127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_register_heartbeat_query() {
        let registry = registry(60_000);
        assert!(registry.register(instance(8001)).await.unwrap());
        assert!(registry.heartbeat("m1@llm", "127.0.0.1", 8001).await.unwrap());

        let found = registry
            .get_all_instances(Some("m1@llm"), true)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].healthy);
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_address() {
        let registry = registry(60_000);
        registry.register(instance(8001)).await.unwrap();
        registry.register(instance(8001)).await.unwrap();
        registry.register(instance(8002)).await.unwrap();

        let all = registry.get_all_instances(None, false).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_instance_returns_false() {
        let registry = registry(60_000);
        assert!(!registry.heartbeat("m1@llm", "127.0.0.1", 8001).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_instance_excluded_on_read() {
        let registry = registry(100);
        registry.register(instance(8001)).await.unwrap();
        registry.register(instance(8002)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.heartbeat("m1@llm", "127.0.0.1", 8002).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let healthy = registry.get_all_instances(Some("m1@llm"), true).await.unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].port, 8002);

        let all = registry.get_all_instances(Some("m1@llm"), false).await.unwrap();
        let stale = all.iter().find(|i| i.port == 8001).unwrap();
        assert!(!stale.healthy);
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_unhealthy_instance() {
        let registry = registry(50);
        registry.register(instance(8001)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(registry.sweep().await, 1);

        assert!(registry.heartbeat("m1@llm", "127.0.0.1", 8001).await.unwrap());
        let healthy = registry.get_all_instances(Some("m1@llm"), true).await.unwrap();
        assert_eq!(healthy.len(), 1);
    }

    #[tokio::test]
    async fn test_background_sweep_marks_unhealthy() {
        let registry = registry(30);
        registry.init().await.unwrap();
        registry.register(instance(8001)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let snapshot = registry.instances.read().await.clone();
        assert!(!snapshot["m1@llm"][0].healthy);
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unchecked_instance_never_expires() {
        let registry = registry(20);
        let mut unchecked = instance(8001);
        unchecked.check_healthy = false;
        registry.register(unchecked).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let healthy = registry.get_all_instances(None, true).await.unwrap();
        assert_eq!(healthy.len(), 1);
    }

    #[tokio::test]
    async fn test_deregister() {
        let registry = registry(60_000);
        registry.register(instance(8001)).await.unwrap();
        assert!(registry.deregister("m1@llm", "127.0.0.1", 8001).await.unwrap());
        assert!(!registry.deregister("m1@llm", "127.0.0.1", 8001).await.unwrap());
        assert!(registry.get_all_instances(None, false).await.unwrap().is_empty());
    }
}
