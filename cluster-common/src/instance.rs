//! Worker types, instance keys and registry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a worker performs.
///
/// The serialized names are part of the registry key format
/// (`"{model_name}@{worker_type}"`) and must stay stable.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum WorkerType {
    /// Text generation (chat / completion).
    #[default]
    #[serde(rename = "llm")]
    Llm,
    /// Vector embeddings.
    #[serde(rename = "text2vec")]
    Embedding,
    /// Query/document relevance scoring.
    #[serde(rename = "reranker")]
    Reranker,
}

impl WorkerType {
    /// All worker type variants for iteration.
    pub const ALL: [WorkerType; 3] = [WorkerType::Llm, WorkerType::Embedding, WorkerType::Reranker];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Llm => "llm",
            WorkerType::Embedding => "text2vec",
            WorkerType::Reranker => "reranker",
        }
    }

    /// Parse the wire name of a worker type.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    /// Whether this worker type serves embedding-style calls.
    pub fn is_embedding_like(&self) -> bool {
        matches!(self, WorkerType::Embedding | WorkerType::Reranker)
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical identity of a model deployment: one model served by one worker type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub model_name: String,
    pub worker_type: WorkerType,
}

impl InstanceKey {
    pub fn new(model_name: impl Into<String>, worker_type: WorkerType) -> Self {
        Self {
            model_name: model_name.into(),
            worker_type,
        }
    }

    /// Composite registry key, e.g. `"vicuna-13b@llm"`.
    pub fn worker_key(&self) -> String {
        format!("{}@{}", self.model_name, self.worker_type)
    }

    /// Parse a composite registry key. Model names may themselves contain `@`.
    pub fn parse(worker_key: &str) -> Option<Self> {
        let (model_name, worker_type) = worker_key.rsplit_once('@')?;
        if model_name.is_empty() {
            return None;
        }
        Some(Self::new(model_name, WorkerType::parse(worker_type)?))
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.model_name, self.worker_type)
    }
}

/// One running worker as seen by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstance {
    pub host: String,
    pub port: u16,
    /// Composite `"{model_name}@{worker_type}"` key.
    pub worker_key: String,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Instances with `check_healthy = false` never expire.
    #[serde(default = "default_true")]
    pub check_healthy: bool,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl ModelInstance {
    pub fn new(key: &InstanceKey, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            worker_key: key.worker_key(),
            healthy: true,
            enabled: true,
            check_healthy: true,
            prompt_template: None,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn key(&self) -> Option<InstanceKey> {
        InstanceKey::parse(&self.worker_key)
    }

    pub fn model_name(&self) -> Option<String> {
        self.key().map(|k| k.model_name)
    }

    /// `host:port` of the worker host serving this instance.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this record identifies the same worker as `(worker_key, host, port)`.
    pub fn matches(&self, worker_key: &str, host: &str, port: u16) -> bool {
        self.worker_key == worker_key && self.host == host && self.port == port
    }

    /// Whether the heartbeat is older than `ttl` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.check_healthy && now - self.last_heartbeat > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_type_serialization() {
        let json = serde_json::to_string(&WorkerType::Embedding).unwrap();
        assert_eq!(json, r#""text2vec""#);

        let parsed: WorkerType = serde_json::from_str(r#""reranker""#).unwrap();
        assert_eq!(parsed, WorkerType::Reranker);
    }

    #[test]
    fn test_worker_key_format() {
        let key = InstanceKey::new("vicuna-13b", WorkerType::Llm);
        assert_eq!(key.worker_key(), "vicuna-13b@llm");
        assert_eq!(key.to_string(), "vicuna-13b@llm");
    }

    #[test]
    fn test_parse_worker_key_with_at_in_model_name() {
        let key = InstanceKey::parse("org@bge-large@text2vec").unwrap();
        assert_eq!(key.model_name, "org@bge-large");
        assert_eq!(key.worker_type, WorkerType::Embedding);
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(InstanceKey::parse("model@gpu").is_none());
        assert!(InstanceKey::parse("no-type").is_none());
        assert!(InstanceKey::parse("@llm").is_none());
    }

    #[test]
    fn test_instance_expiry() {
        let key = InstanceKey::new("m1", WorkerType::Llm);
        let mut instance = ModelInstance::new(&key, "127.0.0.1", 8001);
        let ttl = chrono::Duration::seconds(30);
        let later = instance.last_heartbeat + chrono::Duration::seconds(31);

        assert!(!instance.is_expired(instance.last_heartbeat, ttl));
        assert!(instance.is_expired(later, ttl));

        instance.check_healthy = false;
        assert!(!instance.is_expired(later, ttl));
    }

    #[test]
    fn test_instance_defaults_on_deserialize() {
        let json = r#"{"host": "10.0.0.2", "port": 8001, "worker_key": "m1@llm"}"#;
        let instance: ModelInstance = serde_json::from_str(json).unwrap();
        assert!(instance.healthy);
        assert!(instance.enabled);
        assert!(instance.check_healthy);
        assert_eq!(instance.model_name().as_deref(), Some("m1"));
    }
}
