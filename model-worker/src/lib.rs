//! Model worker host.
//!
//! Runs model workers, keeps them registered and heartbeating, and exposes them to the
//! rest of the cluster. The manager layer is also used in-process by the API gateway.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod line_stream;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod state;
pub mod test_util;
pub mod worker;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use client::{ClusterLlmClient, LlmClient};
pub use error::{Error, Result};
pub use manager::{LocalWorkerManager, RemoteWorkerManager, WorkerManager};
pub use registry::{EmbeddedRegistry, ModelRegistry, RegistryClient};
pub use state::AppState;

/// Worker host router with CORS and request tracing.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
