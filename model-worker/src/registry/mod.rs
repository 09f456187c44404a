//! Model registry: the directory of worker instances and their health.
//!
//! Instances are keyed by `"{model_name}@{worker_type}"`. Two implementations share the
//! contract: [`EmbeddedRegistry`] keeps the directory in process (standalone hosts and the
//! controller service itself), [`RegistryClient`] talks to a remote controller.

mod client;
mod embedded;

pub use client::RegistryClient;
pub use embedded::EmbeddedRegistry;

use async_trait::async_trait;
use cluster_common::ModelInstance;

use crate::error::Result;

#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Start background work (the TTL sweep for the embedded store).
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Insert or refresh an instance. Repeated registration from the same host/port
    /// updates the existing record.
    async fn register(&self, instance: ModelInstance) -> Result<bool>;

    async fn deregister(&self, worker_key: &str, host: &str, port: u16) -> Result<bool>;

    /// Refresh `last_heartbeat`. `Ok(false)` means the instance is unknown and must
    /// register again.
    async fn heartbeat(&self, worker_key: &str, host: &str, port: u16) -> Result<bool>;

    /// All instances, or those of one key. With `healthy_only`, instances whose heartbeat
    /// is older than the TTL are never returned.
    async fn get_all_instances(
        &self,
        worker_key: Option<&str>,
        healthy_only: bool,
    ) -> Result<Vec<ModelInstance>>;

    /// A copy owning fresh connections, for calls driven from another runtime.
    /// `None` when the registry holds no connections.
    fn detached(&self) -> Option<Box<dyn ModelRegistry>> {
        None
    }
}
