pub mod chat;
pub mod controller;
pub mod embeddings;
pub mod health;
pub mod models;

use std::collections::BTreeSet;

use cluster_common::WorkerType;

use crate::error::{ApiError, Result};
use crate::AppState;

/// Names of models with at least one healthy instance of the given types.
pub(crate) async fn model_names(
    state: &AppState,
    worker_types: &[WorkerType],
) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for worker_type in worker_types {
        let instances = state
            .manager
            .get_all_model_instances(Some(*worker_type), true)
            .await?;
        names.extend(instances.iter().filter_map(|i| i.model_name()));
    }
    Ok(names)
}

/// Reject requests for models nothing is serving before dispatching them.
pub(crate) async fn check_model(
    state: &AppState,
    model: &str,
    worker_types: &[WorkerType],
) -> Result<()> {
    let names = model_names(state, worker_types).await?;
    if names.contains(model) {
        return Ok(());
    }
    Err(ApiError::InvalidModel {
        model: model.to_string(),
        available: names.into_iter().collect::<Vec<_>>().join("&&"),
    })
}
