//! Test helpers shared by unit and integration tests.

mod echo_worker;

pub use echo_worker::{EchoWorker, EchoWorkerFactory};

use cluster_common::{WorkerParams, WorkerStartupRequest, WorkerType};

/// Startup request for an echo-backed LLM worker on 127.0.0.1.
pub fn startup_request(model: &str, port: u16, concurrency: usize) -> WorkerStartupRequest {
    typed_startup_request(model, WorkerType::Llm, port, concurrency)
}

pub fn typed_startup_request(
    model: &str,
    worker_type: WorkerType,
    port: u16,
    concurrency: usize,
) -> WorkerStartupRequest {
    let mut params = WorkerParams::with_backend("echo");
    params.concurrency = concurrency;
    WorkerStartupRequest {
        host: "127.0.0.1".to_string(),
        port,
        model: model.to_string(),
        worker_type,
        params,
    }
}
