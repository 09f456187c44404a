//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::manager::LocalWorkerManager;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub manager: Arc<LocalWorkerManager>,
}

impl AppState {
    pub fn new(config: Config, manager: Arc<LocalWorkerManager>) -> Self {
        Self { config, manager }
    }
}
