//! Per-worker heartbeat loop.

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::run_data::WorkerRunData;
use crate::config::HeartbeatConfig;
use crate::error::{Error, Result};
use crate::registry::ModelRegistry;
use crate::retry::RetryPolicy;

/// Spawn the heartbeat loop for `run_data`. The loop exits once `run_data.stop_token` is
/// cancelled; beats are strictly sequential.
pub fn spawn(
    run_data: Arc<WorkerRunData>,
    registry: Arc<dyn ModelRegistry>,
    config: HeartbeatConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move { run(run_data, registry, config).await })
}

async fn run(run_data: Arc<WorkerRunData>, registry: Arc<dyn ModelRegistry>, config: HeartbeatConfig) {
    let token = run_data.stop_token.clone();
    let retry = RetryPolicy::new(config.retries, config.retry_backoff());
    let mut delay = config.interval();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if !run_data.worker.is_alive().await {
            if run_data.set_healthy(false) {
                tracing::warn!(
                    worker_key = %run_data.worker_key,
                    host = %run_data.host,
                    port = run_data.port,
                    "Worker is not alive, withholding heartbeats"
                );
            }
            delay = config.interval();
            continue;
        }

        match beat_with_retries(&run_data, registry.as_ref(), retry).await {
            Some(Ok(())) => {
                run_data.mark_heartbeat();
                if run_data.set_healthy(true) {
                    tracing::info!(
                        worker_key = %run_data.worker_key,
                        host = %run_data.host,
                        port = run_data.port,
                        "Heartbeat recovered"
                    );
                }
                delay = config.interval();
            }
            Some(Err(e)) => {
                if run_data.set_healthy(false) {
                    tracing::warn!(
                        worker_key = %run_data.worker_key,
                        host = %run_data.host,
                        port = run_data.port,
                        error = %e,
                        "Heartbeat retries exhausted, marking unhealthy"
                    );
                }
                delay = config.slow_interval();
            }
            None => break,
        }
    }

    tracing::debug!(worker_key = %run_data.worker_key, port = run_data.port, "Heartbeat loop stopped");
}

/// `None` when cancelled while backing off.
async fn beat_with_retries(
    run_data: &WorkerRunData,
    registry: &dyn ModelRegistry,
    retry: RetryPolicy,
) -> Option<Result<()>> {
    let mut attempt = 0;
    loop {
        match beat_once(run_data, registry).await {
            Ok(()) => return Some(Ok(())),
            Err(e) if attempt < retry.retries => {
                let delay = retry.delay(attempt);
                tracing::debug!(
                    worker_key = %run_data.worker_key,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Heartbeat failed, retrying"
                );
                tokio::select! {
                    _ = run_data.stop_token.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Some(Err(e)),
        }
    }
}

/// One heartbeat, re-registering if the registry no longer knows the instance.
async fn beat_once(run_data: &WorkerRunData, registry: &dyn ModelRegistry) -> Result<()> {
    if registry
        .heartbeat(&run_data.worker_key, &run_data.host, run_data.port)
        .await?
    {
        return Ok(());
    }

    tracing::info!(
        worker_key = %run_data.worker_key,
        host = %run_data.host,
        port = run_data.port,
        "Registry lost the instance, re-registering"
    );
    let mut instance = run_data.to_instance();
    instance.healthy = true;
    instance.last_heartbeat = chrono::Utc::now();
    if registry.register(instance).await? {
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Registry refused {} at {}:{}",
            run_data.worker_key, run_data.host, run_data.port
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EmbeddedRegistry;
    use crate::test_util::EchoWorker;
    use cluster_common::{WorkerParams, WorkerStartupRequest, WorkerType};
    use std::time::Duration;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval_secs: 0.02,
            ttl_secs: 1.0,
            retries: 1,
            retry_backoff_ms: 1,
            slow_interval_secs: 0.05,
        }
    }

    fn run_data(worker: Arc<EchoWorker>) -> Arc<WorkerRunData> {
        let request = WorkerStartupRequest {
            host: "127.0.0.1".to_string(),
            port: 8001,
            model: "m1".to_string(),
            worker_type: WorkerType::Llm,
            params: WorkerParams::with_backend("echo"),
        };
        Arc::new(WorkerRunData::new(&request, worker))
    }

    #[tokio::test]
    async fn test_heartbeat_reregisters_unknown_instance() {
        let registry: Arc<dyn ModelRegistry> = Arc::new(EmbeddedRegistry::new(
            chrono::Duration::seconds(1),
            Duration::from_secs(60),
        ));
        let worker = Arc::new(EchoWorker::new("m1", WorkerType::Llm));
        worker.revive();
        let run_data = run_data(worker);
        let handle = spawn(run_data.clone(), registry.clone(), config());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let instances = registry.get_all_instances(Some("m1@llm"), true).await.unwrap();
        assert_eq!(instances.len(), 1);

        run_data.stop_token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dead_worker_is_marked_unhealthy() {
        let registry: Arc<dyn ModelRegistry> = Arc::new(EmbeddedRegistry::new(
            chrono::Duration::seconds(1),
            Duration::from_secs(60),
        ));
        let worker = Arc::new(EchoWorker::new("m1", WorkerType::Llm));
        worker.revive();
        let run_data = run_data(worker.clone());
        let _handle = spawn(run_data.clone(), registry, config());

        worker.kill();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!run_data.is_healthy());

        worker.revive();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(run_data.is_healthy());
        run_data.stop_token.cancel();
    }
}
