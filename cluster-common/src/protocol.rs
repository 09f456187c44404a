//! HTTP envelopes exchanged inside the cluster.
//!
//! Two internal surfaces share these types:
//!
//! ## Worker host API (`/api/worker/...`)
//!
//! Every process hosting workers exposes the same fixed RPC contract. Remote managers
//! select an instance through the controller, then call the host at `host:port`:
//!
//! 1. `generate` / `generate_stream` take a [`PromptRequest`]. The stream variant answers
//!    with newline-delimited JSON, one `ModelOutput` per line.
//! 2. `embeddings` takes an [`EmbeddingsRequest`].
//! 3. `models/startup`, `models/shutdown` and `apply` take [`WorkerStartupRequest`] and
//!    [`WorkerApplyRequest`] and return [`ApplyOutput`] / [`WorkerApplyOutput`].
//!
//! ## Controller API (`/api/controller/...`)
//!
//! Workers push registrations and heartbeats; managers query instances. Heartbeats for an
//! unknown instance are acknowledged with `success = false`, which tells the worker to
//! register again.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::instance::WorkerType;

pub const WORKER_API_PREFIX: &str = "/api/worker";
pub const CONTROLLER_MODELS_PATH: &str = "/api/controller/models";
pub const CONTROLLER_HEARTBEAT_PATH: &str = "/api/controller/heartbeat";

/// One message of a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: String,
    pub content: String,
}

impl ModelMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// Generation call parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub messages: Vec<ModelMessage>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Prepend the prompt to the generated text.
    #[serde(default)]
    pub echo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl PromptRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ModelMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Plain-text rendering of the conversation, used for echo and token counting.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Embedding or rerank call parameters.
///
/// For a reranker `query` is set and `input` holds the candidate documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl EmbeddingsRequest {
    pub fn new(model: impl Into<String>, input: Vec<String>) -> Self {
        Self {
            model: model.into(),
            input,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountTokenRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRequest {
    pub model: String,
}

/// Administrative action applied to every instance of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyType {
    Start,
    Stop,
    Restart,
    UpdateParams,
}

impl std::fmt::Display for ApplyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplyType::Start => "START",
            ApplyType::Stop => "STOP",
            ApplyType::Restart => "RESTART",
            ApplyType::UpdateParams => "UPDATE_PARAMS",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerApplyRequest {
    pub model: String,
    pub apply_type: ApplyType,
    #[serde(default)]
    pub worker_type: WorkerType,
    /// Partial `WorkerParams` merged into the current ones for `UPDATE_PARAMS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Startup parameters of one worker. `backend` picks the implementation; the remaining
/// fields are read by whichever backend needs them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerParams {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// GGUF file for `llama_server`.
    #[serde(default)]
    pub model_path: Option<String>,
    /// Daemon URL for `ollama`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub server_binary: Option<String>,
    /// Arguments placed before the model flags, for wrapper commands.
    #[serde(default)]
    pub server_args: Vec<String>,
    /// Arguments appended after the standard flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub gpu_layers: Option<i32>,
    #[serde(default)]
    pub context_size: Option<u32>,
    /// Max concurrent calls admitted to this worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub log_server_output: bool,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub keep_alive: Option<String>,
    #[serde(default)]
    pub num_ctx: Option<u32>,
}

fn default_backend() -> String {
    "llama_server".to_string()
}

fn default_concurrency() -> usize {
    5
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for WorkerParams {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model_path: None,
            base_url: None,
            server_binary: None,
            server_args: Vec::new(),
            extra_args: Vec::new(),
            gpu_layers: None,
            context_size: None,
            concurrency: default_concurrency(),
            prompt_template: None,
            log_server_output: false,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            keep_alive: None,
            num_ctx: None,
        }
    }
}

impl WorkerParams {
    pub fn with_backend(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Default::default()
        }
    }

    /// Apply a partial JSON object on top of these params. `null` resets a field to its
    /// default.
    pub fn merged(&self, patch: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut current = serde_json::to_value(self)?;
        if let (Some(target), Some(source)) = (current.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                if value.is_null() {
                    target.remove(key);
                } else {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        serde_json::from_value(current)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStartupRequest {
    pub host: String,
    pub port: u16,
    pub model: String,
    #[serde(default)]
    pub worker_type: WorkerType,
    #[serde(default)]
    pub params: WorkerParams,
}

/// Result of one lifecycle operation on one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutput {
    pub message: String,
    pub success: bool,
    /// Seconds spent.
    #[serde(default)]
    pub timecost: f64,
}

impl ApplyOutput {
    pub fn ok(message: impl Into<String>, timecost: f64) -> Self {
        Self {
            message: message.into(),
            success: true,
            timecost,
        }
    }

    pub fn failed(message: impl Into<String>, timecost: f64) -> Self {
        Self {
            message: message.into(),
            success: false,
            timecost,
        }
    }
}

/// Aggregated result of an apply, keyed by `"{worker_key}@{host}:{port}"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerApplyOutput {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub timecost: f64,
    #[serde(default)]
    pub results: BTreeMap<String, ApplyOutput>,
}

impl WorkerApplyOutput {
    /// Build from per-instance results. Succeeds only if every instance succeeded.
    pub fn aggregate(results: BTreeMap<String, ApplyOutput>, timecost: f64) -> Self {
        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, r)| !r.success)
            .map(|(k, _)| k.as_str())
            .collect();
        let success = failed.is_empty();
        let message = if results.is_empty() {
            "no matching instance".to_string()
        } else if success {
            format!("{} instance(s) applied", results.len())
        } else {
            format!("failed: {}", failed.join(", "))
        };
        Self {
            success: success && !results.is_empty(),
            message,
            timecost,
            results,
        }
    }

    /// Merge results from another host into this one.
    pub fn merge(outputs: Vec<WorkerApplyOutput>, timecost: f64) -> Self {
        let results = outputs.into_iter().flat_map(|o| o.results).collect();
        Self::aggregate(results, timecost)
    }
}

/// Identifies one instance in heartbeat and deregistration calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub worker_key: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAck {
    pub success: bool,
}

/// Query string of `GET /api/controller/models`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_key: Option<String>,
    #[serde(default)]
    pub healthy_only: bool,
}

/// Query string of `GET /api/worker/parameter/descriptions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterQuery {
    pub model: String,
    #[serde(default)]
    pub worker_type: WorkerType,
}
