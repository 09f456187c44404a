//! Worker host HTTP API, called by remote worker managers.

pub mod dispatch;
pub mod health;
pub mod lifecycle;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use cluster_common::protocol::WORKER_API_PREFIX;

use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .nest(
            WORKER_API_PREFIX,
            Router::new()
                .merge(dispatch::router())
                .merge(lifecycle::router()),
        )
        .route("/health", get(health::health))
}
