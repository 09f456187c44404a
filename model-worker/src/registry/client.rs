//! HTTP client for a remote controller.

use std::time::Duration;

use async_trait::async_trait;
use cluster_common::protocol::{
    InstanceQuery, InstanceRef, RegistryAck, CONTROLLER_HEARTBEAT_PATH, CONTROLLER_MODELS_PATH,
};
use cluster_common::ModelInstance;
use reqwest::Client;

use super::ModelRegistry;
use crate::config::ControllerConfig;
use crate::error::{read_json, Error, Result};
use crate::retry::RetryPolicy;

/// Registry backed by a controller over HTTP. Every call is idempotent and retried with
/// bounded backoff on transport failures.
pub struct RegistryClient {
    base_url: String,
    timeout: Duration,
    http_client: Client,
    retry: RetryPolicy,
}

impl RegistryClient {
    pub fn new(config: &ControllerConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout,
            http_client: build_client(timeout)?,
            retry: RetryPolicy::new(
                config.retries,
                Duration::from_millis(config.retry_backoff_ms),
            ),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
}

#[async_trait]
impl ModelRegistry for RegistryClient {
    async fn register(&self, instance: ModelInstance) -> Result<bool> {
        let url = &self.url(CONTROLLER_MODELS_PATH);
        let instance = &instance;
        self.retry
            .run("register", || async move {
                let response = self.http_client.post(url).json(instance).send().await?;
                let ack: RegistryAck = read_json(response).await?;
                Ok(ack.success)
            })
            .await
    }

    async fn deregister(&self, worker_key: &str, host: &str, port: u16) -> Result<bool> {
        let url = &self.url(CONTROLLER_MODELS_PATH);
        let body = &InstanceRef {
            worker_key: worker_key.to_string(),
            host: host.to_string(),
            port,
        };
        self.retry
            .run("deregister", || async move {
                let response = self.http_client.delete(url).json(body).send().await?;
                let ack: RegistryAck = read_json(response).await?;
                Ok(ack.success)
            })
            .await
    }

    async fn heartbeat(&self, worker_key: &str, host: &str, port: u16) -> Result<bool> {
        let url = self.url(CONTROLLER_HEARTBEAT_PATH);
        let body = InstanceRef {
            worker_key: worker_key.to_string(),
            host: host.to_string(),
            port,
        };
        let response = self.http_client.post(&url).json(&body).send().await?;
        let ack: RegistryAck = read_json(response).await?;
        Ok(ack.success)
    }

    async fn get_all_instances(
        &self,
        worker_key: Option<&str>,
        healthy_only: bool,
    ) -> Result<Vec<ModelInstance>> {
        let url = &self.url(CONTROLLER_MODELS_PATH);
        let query = &InstanceQuery {
            worker_key: worker_key.map(str::to_string),
            healthy_only,
        };
        let instances: Vec<ModelInstance> = self
            .retry
            .run("get_all_instances", || async move {
                let response = self.http_client.get(url).query(query).send().await?;
                read_json(response).await
            })
            .await?;

        // The controller applies the TTL; re-check in case its clock disagrees with ours.
        Ok(instances
            .into_iter()
            .filter(|i| !healthy_only || (i.healthy && i.enabled))
            .collect())
    }

    fn detached(&self) -> Option<Box<dyn ModelRegistry>> {
        let http_client = build_client(self.timeout).ok()?;
        Some(Box::new(RegistryClient {
            base_url: self.base_url.clone(),
            timeout: self.timeout,
            http_client,
            retry: self.retry,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_common::{InstanceKey, WorkerType};
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RegistryClient {
        let mut config = ControllerConfig::new(server.uri());
        config.retries = 2;
        config.retry_backoff_ms = 1;
        RegistryClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_register_posts_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/controller/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(RegistryAck { success: true }))
            .expect(1)
            .mount(&server)
            .await;

        let instance =
            ModelInstance::new(&InstanceKey::new("m1", WorkerType::Llm), "10.0.0.2", 8001);
        assert!(client(&server).register(instance).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/controller/heartbeat"))
            .and(body_json(serde_json::json!({
                "worker_key": "m1@llm", "host": "10.0.0.2", "port": 8001
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(RegistryAck { success: false }))
            .mount(&server)
            .await;

        let alive = client(&server)
            .heartbeat("m1@llm", "10.0.0.2", 8001)
            .await
            .unwrap();
        assert!(!alive);
    }

    #[tokio::test]
    async fn test_query_filters_and_passes_params() {
        let server = MockServer::start().await;
        let key = InstanceKey::new("m1", WorkerType::Llm);
        let healthy = ModelInstance::new(&key, "10.0.0.2", 8001);
        let mut sick = ModelInstance::new(&key, "10.0.0.3", 8001);
        sick.healthy = false;

        Mock::given(method("GET"))
            .and(path("/api/controller/models"))
            .and(query_param("worker_key", "m1@llm"))
            .and(query_param("healthy_only", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![healthy, sick]))
            .mount(&server)
            .await;

        let found = client(&server)
            .get_all_instances(Some("m1@llm"), true)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_register_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/controller/models"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/controller/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(RegistryAck { success: true }))
            .mount(&server)
            .await;

        let instance =
            ModelInstance::new(&InstanceKey::new("m1", WorkerType::Llm), "10.0.0.2", 8001);
        assert!(client(&server).register(instance).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_transport_error() {
        let config = ControllerConfig {
            url: "http://127.0.0.1:1".to_string(),
            request_timeout_secs: 1,
            retries: 0,
            retry_backoff_ms: 1,
        };
        let client = RegistryClient::new(&config).unwrap();
        let result = client.heartbeat("m1@llm", "10.0.0.2", 8001).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
