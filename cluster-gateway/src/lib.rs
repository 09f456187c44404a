//! Cluster gateway: the OpenAI-compatible API plus the controller registry worker hosts
//! register with.

pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod routes;
pub mod stream;
pub mod validation;

pub use config::{Config, ManagerMode};
pub use error::ApiError;

use std::sync::Arc;

use axum::{middleware, Router};
use model_worker::manager::WorkerManager;
use model_worker::registry::ModelRegistry;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Dispatches generation and embedding calls, locally or to remote worker hosts.
    pub manager: Arc<dyn WorkerManager>,
    /// Registry served under `/api/controller`.
    pub registry: Arc<dyn ModelRegistry>,
}

impl AppState {
    pub fn new(
        config: Config,
        manager: Arc<dyn WorkerManager>,
        registry: Arc<dyn ModelRegistry>,
    ) -> Self {
        Self {
            config,
            manager,
            registry,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut app = Router::new().merge(routes::health::router());

    if state.config.controller.enabled {
        app = app.merge(routes::controller::router());
    }

    if state.config.api.enabled {
        let api = Router::new()
            .merge(routes::chat::router())
            .merge(routes::models::router())
            .merge(routes::embeddings::router())
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                auth::require_api_key,
            ));
        app = app.nest("/v1", api);
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    app.layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
