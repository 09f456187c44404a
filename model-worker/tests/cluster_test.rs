//! End-to-end tests across registry, heartbeat, local and remote managers.

use std::sync::Arc;
use std::time::Duration;

use cluster_common::{
    ApplyType, EmbeddingsRequest, ModelMessage, PromptRequest, WorkerApplyRequest, WorkerType,
};
use futures_util::StreamExt;
use model_worker::config::{Config, HeartbeatConfig, ManagerConfig};
use model_worker::manager::{LocalWorkerManager, RemoteWorkerManager, WorkerManager};
use model_worker::registry::{EmbeddedRegistry, ModelRegistry};
use model_worker::retry::RetryPolicy;
use model_worker::test_util::{startup_request, typed_startup_request, EchoWorkerFactory};
use model_worker::{build_router, AppState, Error};
use tokio::net::TcpListener;

fn fast_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        interval_secs: 0.05,
        ttl_secs: 0.3,
        retries: 1,
        retry_backoff_ms: 10,
        slow_interval_secs: 0.1,
    }
}

fn cluster(
    factory: Arc<EchoWorkerFactory>,
    heartbeat: HeartbeatConfig,
) -> (Arc<EmbeddedRegistry>, Arc<LocalWorkerManager>) {
    let registry = Arc::new(EmbeddedRegistry::new(heartbeat.ttl(), Duration::from_secs(60)));
    let manager = Arc::new(LocalWorkerManager::new(
        registry.clone(),
        factory,
        heartbeat,
        ManagerConfig::default(),
    ));
    (registry, manager)
}

fn prompt(model: &str, text: &str) -> PromptRequest {
    PromptRequest::new(model, vec![ModelMessage::user(text)])
}

#[tokio::test]
async fn test_single_worker_generate() {
    let (registry, manager) = cluster(Arc::new(EchoWorkerFactory::new()), fast_heartbeat());
    manager.model_startup(startup_request("m1", 8001, 2)).await.unwrap();

    let output = manager.generate(prompt("m1", "hello cluster")).await.unwrap();
    assert_eq!(output.error_code, 0);
    assert_eq!(output.text, "hello cluster");

    let instances = registry.get_all_instances(Some("m1@llm"), true).await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].port, 8001);
}

#[tokio::test]
async fn test_dead_worker_is_excluded_from_selection() {
    let factory = Arc::new(EchoWorkerFactory::new());
    let (registry, manager) = cluster(factory.clone(), fast_heartbeat());
    manager.model_startup(startup_request("m1", 8001, 2)).await.unwrap();
    manager.model_startup(startup_request("m1", 8002, 2)).await.unwrap();

    let workers = factory.workers_for("m1");
    assert_eq!(workers.len(), 2);
    workers[0].kill();

    tokio::time::sleep(Duration::from_millis(500)).await;

    for _ in 0..6 {
        let instance = manager
            .select_one_instance(WorkerType::Llm, "m1", true)
            .await
            .unwrap();
        assert_eq!(instance.port, 8002);
    }

    let healthy = registry.get_all_instances(Some("m1@llm"), true).await.unwrap();
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0].port, 8002);

    // Still listed when not filtering on health.
    let all = manager.get_all_model_instances(Some(WorkerType::Llm), false).await.unwrap();
    assert_eq!(all.len(), 2);

    manager.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_restart_gives_fresh_capacity_and_registration() {
    let factory = Arc::new(EchoWorkerFactory::new().with_delay(Duration::from_millis(200)));
    let (registry, manager) = cluster(factory.clone(), HeartbeatConfig::default());
    manager.model_startup(startup_request("m1", 8001, 2)).await.unwrap();

    let before = manager.run_data("m1", WorkerType::Llm).await;
    let old = before[0].clone();
    let registered_before = registry.get_all_instances(Some("m1@llm"), false).await.unwrap()[0]
        .last_heartbeat;

    // Hold a permit on the old worker while restarting.
    let busy = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.generate(prompt("m1", "slow call")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(old.in_flight(), 1);

    let output = manager
        .worker_apply(WorkerApplyRequest {
            model: "m1".to_string(),
            apply_type: ApplyType::Restart,
            worker_type: WorkerType::Llm,
            params: None,
        })
        .await
        .unwrap();
    assert!(output.success);

    let after = manager.run_data("m1", WorkerType::Llm).await;
    assert_eq!(after.len(), 1);
    let fresh = &after[0];
    assert!(!Arc::ptr_eq(&old, fresh));
    assert_eq!(fresh.semaphore.available_permits(), 2);
    assert!(fresh.has_heartbeat_task().await);

    let registered_after = registry.get_all_instances(Some("m1@llm"), false).await.unwrap();
    assert_eq!(registered_after.len(), 1);
    assert!(registered_after[0].last_heartbeat > registered_before);
    assert_eq!(factory.workers_for("m1").len(), 2);

    let _ = busy.await.unwrap();
}

#[tokio::test]
async fn test_calls_spread_across_instances_within_limits() {
    let factory = Arc::new(EchoWorkerFactory::new().with_delay(Duration::from_millis(40)));
    let (_registry, manager) = cluster(factory.clone(), HeartbeatConfig::default());
    manager.model_startup(startup_request("m1", 8001, 2)).await.unwrap();
    manager.model_startup(startup_request("m1", 8002, 2)).await.unwrap();

    let calls = (0..8).map(|i| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.generate(prompt("m1", &format!("call {}", i))).await })
    });
    for call in futures_util::future::join_all(calls).await {
        assert_eq!(call.unwrap().unwrap().error_code, 0);
    }

    let workers = factory.workers_for("m1");
    assert_eq!(workers.iter().map(|w| w.calls()).sum::<usize>(), 8);
    for worker in &workers {
        assert!(worker.calls() >= 1);
        assert!(worker.peak_in_flight() <= 2);
    }
}

#[tokio::test]
async fn test_saturated_instance_rejects_after_acquire_timeout() {
    let factory = Arc::new(EchoWorkerFactory::new().with_delay(Duration::from_millis(300)));
    let registry = Arc::new(EmbeddedRegistry::new(
        chrono::Duration::seconds(60),
        Duration::from_secs(60),
    ));
    let manager = Arc::new(LocalWorkerManager::new(
        registry,
        factory,
        HeartbeatConfig::default(),
        ManagerConfig {
            acquire_timeout_ms: 50,
            ..ManagerConfig::default()
        },
    ));
    manager.model_startup(startup_request("m1", 8001, 1)).await.unwrap();

    let busy = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.generate(prompt("m1", "first")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = manager.generate(prompt("m1", "second")).await.unwrap_err();
    assert!(matches!(err, Error::WorkerSaturated(_)));
    assert_eq!(err.code(), 42903);

    assert_eq!(busy.await.unwrap().unwrap().text, "first");
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_deregisters() {
    let factory = Arc::new(EchoWorkerFactory::new());
    let (registry, manager) = cluster(factory.clone(), HeartbeatConfig::default());
    let request = startup_request("m1", 8001, 1);
    manager.model_startup(request.clone()).await.unwrap();

    let first = manager.model_shutdown(request.clone()).await.unwrap();
    assert!(first.success);
    let second = manager.model_shutdown(request).await.unwrap();
    assert!(second.success);

    assert!(registry.get_all_instances(None, false).await.unwrap().is_empty());
    assert!(manager.local_instances().await.is_empty());
    assert_eq!(factory.workers_for("m1")[0].stop_calls(), 1);

    let err = manager.generate(prompt("m1", "anyone")).await.unwrap_err();
    assert!(matches!(err, Error::NoAvailableWorker(_)));
}

#[tokio::test]
async fn test_embedded_registry_hides_expired_instances() {
    let registry = EmbeddedRegistry::new(chrono::Duration::milliseconds(100), Duration::from_secs(60));
    let key = cluster_common::InstanceKey::new("m1", WorkerType::Llm);
    registry
        .register(cluster_common::ModelInstance::new(&key, "10.0.0.1", 8001))
        .await
        .unwrap();
    registry
        .register(cluster_common::ModelInstance::new(&key, "10.0.0.2", 8001))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(registry
        .heartbeat("m1@llm", "10.0.0.2", 8001)
        .await
        .unwrap());

    assert_eq!(registry.sweep().await, 1);

    let healthy = registry.get_all_instances(Some("m1@llm"), true).await.unwrap();
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0].host, "10.0.0.2");

    // Expired instances stay listed, marked unhealthy, until deregistered.
    let all = registry.get_all_instances(None, false).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all.iter().filter(|i| !i.healthy).count(), 1);
}

#[tokio::test]
async fn test_sync_embeddings_from_async_context() {
    let (_registry, manager) = cluster(Arc::new(EchoWorkerFactory::new()), HeartbeatConfig::default());
    manager
        .model_startup(typed_startup_request("e1", WorkerType::Embedding, 8001, 1))
        .await
        .unwrap();

    let vectors = manager
        .sync_embeddings(EmbeddingsRequest::new("e1", vec!["ab cd".to_string()]))
        .unwrap();
    assert_eq!(vectors, vec![vec![5.0, 2.0]]);
}

#[tokio::test]
async fn test_dropped_stream_releases_permit() {
    let factory = Arc::new(EchoWorkerFactory::new().with_delay(Duration::from_millis(20)));
    let (_registry, manager) = cluster(factory, HeartbeatConfig::default());
    manager.model_startup(startup_request("m1", 8001, 1)).await.unwrap();
    let run_data = manager.run_data("m1", WorkerType::Llm).await[0].clone();

    let mut stream = manager
        .generate_stream(prompt("m1", "one two three four"))
        .await
        .unwrap();
    let first = stream.next().await.unwrap();
    assert_eq!(first.text, "one");
    assert_eq!(run_data.in_flight(), 1);

    drop(stream);
    assert_eq!(run_data.in_flight(), 0);

    let output = manager.generate(prompt("m1", "after")).await.unwrap();
    assert_eq!(output.text, "after");
}

#[tokio::test]
async fn test_remote_manager_reaches_served_worker_host() {
    let factory = Arc::new(EchoWorkerFactory::new());
    let registry = Arc::new(EmbeddedRegistry::new(
        chrono::Duration::seconds(60),
        Duration::from_secs(60),
    ));
    let local = Arc::new(LocalWorkerManager::new(
        registry.clone(),
        factory,
        HeartbeatConfig::default(),
        ManagerConfig::default(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    local.model_startup(startup_request("m1", port, 2)).await.unwrap();
    local
        .model_startup(typed_startup_request("e1", WorkerType::Embedding, port, 2))
        .await
        .unwrap();

    let config: Config = serde_json::from_value(serde_json::json!({})).unwrap();
    let app = build_router(Arc::new(AppState::new(config, local.clone())));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let remote = RemoteWorkerManager::new(
        registry,
        Duration::from_secs(5),
        Duration::from_secs(5),
        RetryPolicy::none(),
    )
    .unwrap();

    let output = remote.generate(prompt("m1", "over the wire")).await.unwrap();
    assert_eq!(output.text, "over the wire");

    let chunks: Vec<_> = remote
        .generate_stream(prompt("m1", "x y"))
        .await
        .unwrap()
        .collect()
        .await;
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["x", "x y", "x y"]);

    let vectors = remote
        .embeddings(EmbeddingsRequest::new("e1", vec!["abc".to_string()]))
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![3.0, 1.0]]);

    let err = remote.generate(prompt("missing", "hi")).await.unwrap_err();
    assert!(matches!(err, Error::NoAvailableWorker(_)));

    let output = remote
        .worker_apply(WorkerApplyRequest {
            model: "m1".to_string(),
            apply_type: ApplyType::Stop,
            worker_type: WorkerType::Llm,
            params: None,
        })
        .await
        .unwrap();
    assert!(output.success);
    assert!(local.run_data("m1", WorkerType::Llm).await.is_empty());
}
