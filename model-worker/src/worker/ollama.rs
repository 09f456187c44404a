//! Ollama worker backend.
//!
//! The model lives inside an Ollama daemon. Starting a worker checks the model exists and
//! preloads it with `keep_alive`; stopping unloads it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use cluster_common::{
    error_code, EmbeddingsRequest, FinishReason, ModelMetadata, ModelOutput, ModelUsage,
    ParameterDescription, PromptRequest, WorkerParams, WorkerType,
};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use super::{backend_client, echo_prefix, ModelOutputStream, ModelWorker};
use crate::error::{error_from_response, read_json, Error, Result};
use crate::line_stream::lines;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker backed by a model inside an Ollama daemon.
pub struct OllamaWorker {
    model_name: String,
    worker_type: WorkerType,
    base_url: String,
    http_client: Client,
    params: RwLock<WorkerParams>,
    running: AtomicBool,
}

impl OllamaWorker {
    pub fn new(model_name: &str, worker_type: WorkerType, params: WorkerParams) -> Result<Self> {
        let base_url = params
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            model_name: model_name.to_string(),
            worker_type,
            base_url,
            http_client: backend_client(worker_type)?,
            params: RwLock::new(params),
            running: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "Ollama worker for {} is not running",
                self.model_name
            )))
        }
    }

    async fn show(&self) -> Result<OllamaShowResponse> {
        let response = self
            .http_client
            .post(self.url("/api/show"))
            .json(&json!({ "model": self.model_name }))
            .send()
            .await?;
        read_json(response).await
    }

    /// Load or unload the model via an empty generate call.
    async fn set_keep_alive(&self, keep_alive: &str) -> Result<()> {
        let request = OllamaGenerateRequest {
            model: self.model_name.clone(),
            prompt: String::new(),
            stream: false,
            keep_alive: Some(keep_alive.to_string()),
        };
        let response = self
            .http_client
            .post(self.url("/api/generate"))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }

    async fn chat_request(&self, request: &PromptRequest, stream: bool) -> OllamaChatRequest {
        let params = self.params.read().await;
        OllamaChatRequest {
            model: self.model_name.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| OllamaMessage {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            stream,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_new_tokens,
                top_p: request.top_p,
                top_k: request.top_k,
                stop: request.stop.clone(),
                num_ctx: params.num_ctx,
            },
            keep_alive: params.keep_alive.clone(),
        }
    }
}

fn finish_reason(done_reason: Option<&str>) -> FinishReason {
    match done_reason {
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

fn usage(prompt_eval_count: Option<u32>, eval_count: Option<u32>) -> Option<ModelUsage> {
    match (prompt_eval_count, eval_count) {
        (None, None) => None,
        (p, c) => Some(ModelUsage::new(p.unwrap_or(0), c.unwrap_or(0))),
    }
}

// ============================================================================
// Ollama API types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaShowResponse {
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    details: Option<serde_json::Value>,
    #[serde(default)]
    model_info: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

// ============================================================================
// ModelWorker implementation
// ============================================================================

#[async_trait]
impl ModelWorker for OllamaWorker {
    fn backend(&self) -> &'static str {
        "ollama"
    }

    fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    fn parameter_descriptions(&self) -> Vec<ParameterDescription> {
        vec![
            ParameterDescription::new(
                "base_url",
                "string",
                Some(json!(DEFAULT_BASE_URL)),
                "Ollama daemon URL",
            ),
            ParameterDescription::new(
                "keep_alive",
                "string",
                Some(json!(null)),
                "How long Ollama keeps the model loaded (e.g. \"30m\", \"-1\")",
            ),
            ParameterDescription::new(
                "num_ctx",
                "integer",
                Some(json!(null)),
                "Context window size",
            ),
            ParameterDescription::new(
                "concurrency",
                "integer",
                Some(json!(5)),
                "Concurrent calls admitted",
            ),
        ]
    }

    async fn start(&self) -> Result<()> {
        self.show().await.map_err(|e| {
            Error::StartupFailed(format!(
                "Model {} is not available in Ollama at {}: {}",
                self.model_name, self.base_url, e
            ))
        })?;

        if self.worker_type == WorkerType::Llm {
            let keep_alive = self.params.read().await.keep_alive.clone();
            if let Some(keep_alive) = keep_alive {
                self.set_keep_alive(&keep_alive).await.map_err(|e| {
                    Error::StartupFailed(format!("Failed to preload {}: {}", self.model_name, e))
                })?;
            }
        }

        self.running.store(true, Ordering::SeqCst);
        tracing::info!(model = %self.model_name, base_url = %self.base_url, "Ollama model ready");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if self.worker_type == WorkerType::Llm {
            if let Err(e) = self.set_keep_alive("0").await {
                tracing::warn!(model = %self.model_name, error = %e, "Failed to unload model");
            }
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        match self
            .http_client
            .get(self.url("/api/tags"))
            .timeout(PING_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn update_params(&self, params: &WorkerParams) -> Result<bool> {
        let mut current = self.params.write().await;
        let base_url = params
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        if base_url != self.base_url {
            return Ok(false);
        }
        *current = params.clone();
        tracing::info!(
            model = %self.model_name,
            keep_alive = ?current.keep_alive,
            num_ctx = ?current.num_ctx,
            "Updated Ollama parameters in place"
        );
        Ok(true)
    }

    async fn generate(&self, request: &PromptRequest) -> Result<ModelOutput> {
        self.ensure_running()?;
        let body = self.chat_request(request, false).await;
        let response = self
            .http_client
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await?;
        let chat: OllamaChatResponse = read_json(response).await?;
        if let Some(error) = chat.error {
            return Err(Error::WorkerFailure {
                code: error_code::INTERNAL_ERROR,
                message: error,
            });
        }

        let content = chat.message.map(|m| m.content).unwrap_or_default();
        let mut output = ModelOutput::text(echo_prefix(request) + &content)
            .with_finish_reason(finish_reason(chat.done_reason.as_deref()));
        output.usage = usage(chat.prompt_eval_count, chat.eval_count);
        Ok(output)
    }

    async fn generate_stream(&self, request: PromptRequest) -> Result<ModelOutputStream> {
        self.ensure_running()?;
        let body = self.chat_request(&request, true).await;
        let response = self
            .http_client
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let mut text = echo_prefix(&request);
        let mut body = Box::pin(lines(response.bytes_stream()));

        Ok(Box::pin(stream! {
            while let Some(line) = body.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        yield e.to_output();
                        return;
                    }
                };
                let chunk: OllamaChatResponse = match serde_json::from_str(&line) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield ModelOutput::error(
                            error_code::INTERNAL_ERROR,
                            format!("Malformed Ollama chunk: {}", e),
                        );
                        return;
                    }
                };
                if let Some(error) = chunk.error {
                    yield ModelOutput::error(error_code::INTERNAL_ERROR, error);
                    return;
                }
                if let Some(message) = chunk.message {
                    text.push_str(&message.content);
                }
                let mut output = ModelOutput::text(text.clone());
                if chunk.done {
                    output.finish_reason = Some(finish_reason(chunk.done_reason.as_deref()));
                    output.usage = usage(chunk.prompt_eval_count, chunk.eval_count);
                    yield output;
                    break;
                }
                yield output;
            }
        }))
    }

    async fn embeddings(&self, request: &EmbeddingsRequest) -> Result<Vec<Vec<f32>>> {
        self.ensure_running()?;
        if self.worker_type != WorkerType::Embedding {
            return Err(Error::Unsupported(format!(
                "Ollama worker {} does not serve embeddings",
                self.model_name
            )));
        }
        let keep_alive = self.params.read().await.keep_alive.clone();
        let mut body = json!({ "model": self.model_name, "input": request.input });
        if let Some(keep_alive) = keep_alive {
            body["keep_alive"] = json!(keep_alive);
        }
        let response = self
            .http_client
            .post(self.url("/api/embed"))
            .json(&body)
            .send()
            .await?;
        let parsed: OllamaEmbedResponse = read_json(response).await?;
        Ok(parsed.embeddings)
    }

    async fn count_token(&self, _prompt: &str) -> Result<usize> {
        Err(Error::Unsupported(
            "Ollama does not expose a tokenizer endpoint".to_string(),
        ))
    }

    async fn metadata(&self) -> Result<ModelMetadata> {
        self.ensure_running()?;
        let show = self.show().await?;
        let context_length = show
            .model_info
            .iter()
            .find(|(key, _)| key.ends_with(".context_length"))
            .and_then(|(_, value)| value.as_u64())
            .map(|n| n as u32);

        let mut ext_metadata = serde_json::Map::new();
        if let Some(details) = show.details {
            ext_metadata.insert("details".to_string(), details);
        }

        Ok(ModelMetadata {
            model: self.model_name.clone(),
            backend: Some(self.backend().to_string()),
            context_length: self.params.read().await.num_ctx.or(context_length),
            prompt_template: show.template,
            ext_metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_common::ModelMessage;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params(server: &MockServer) -> WorkerParams {
        WorkerParams {
            base_url: Some(server.uri()),
            keep_alive: Some("30m".to_string()),
            ..WorkerParams::with_backend("ollama")
        }
    }

    async fn mount_show(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/show"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "template": "{{ .Prompt }}",
                "details": {"family": "llama"},
                "model_info": {"llama.context_length": 8192}
            })))
            .mount(server)
            .await;
    }

    async fn started(server: &MockServer, worker_type: WorkerType) -> OllamaWorker {
        mount_show(server).await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true})))
            .mount(server)
            .await;
        let worker = OllamaWorker::new("llama3", worker_type, params(server)).unwrap();
        worker.start().await.unwrap();
        worker
    }

    fn prompt() -> PromptRequest {
        PromptRequest::new("llama3", vec![ModelMessage::user("Hello")])
    }

    #[tokio::test]
    async fn test_start_preloads_with_keep_alive() {
        let server = MockServer::start().await;
        mount_show(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"model": "llama3", "keep_alive": "30m"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true})))
            .expect(1)
            .mount(&server)
            .await;

        let worker = OllamaWorker::new("llama3", WorkerType::Llm, params(&server)).unwrap();
        worker.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_for_unknown_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/show"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "model not found"})),
            )
            .mount(&server)
            .await;

        let worker = OllamaWorker::new("missing", WorkerType::Llm, params(&server)).unwrap();
        assert!(matches!(worker.start().await, Err(Error::StartupFailed(_))));
        assert!(!worker.is_alive().await);
    }

    #[tokio::test]
    async fn test_generate_maps_done_reason_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"options": {"num_predict": 16}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "Hi!"},
                "done": true,
                "done_reason": "length",
                "prompt_eval_count": 4,
                "eval_count": 16
            })))
            .mount(&server)
            .await;

        let worker = started(&server, WorkerType::Llm).await;
        let mut request = prompt();
        request.max_new_tokens = Some(16);
        let output = worker.generate(&request).await.unwrap();
        assert_eq!(output.text, "Hi!");
        assert_eq!(output.finish_reason, Some(FinishReason::Length));
        assert_eq!(output.usage, Some(ModelUsage::new(4, 16)));
    }

    #[tokio::test]
    async fn test_generate_stream_ndjson() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":2,\"eval_count\":2}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let worker = started(&server, WorkerType::Llm).await;
        let outputs: Vec<ModelOutput> = worker
            .generate_stream(prompt())
            .await
            .unwrap()
            .collect()
            .await;

        let texts: Vec<&str> = outputs.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, vec!["Hel", "Hello", "Hello"]);
        assert_eq!(outputs[2].finish_reason, Some(FinishReason::Stop));
        assert_eq!(outputs[2].usage, Some(ModelUsage::new(2, 2)));
    }

    #[tokio::test]
    async fn test_embeddings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]})),
            )
            .mount(&server)
            .await;

        let worker = started(&server, WorkerType::Embedding).await;
        let request = EmbeddingsRequest::new("llama3", vec!["a".into(), "b".into()]);
        let vectors = worker.embeddings(&request).await.unwrap();
        assert_eq!(vectors.len(), 2);
    }

    #[tokio::test]
    async fn test_update_params_in_place() {
        let server = MockServer::start().await;
        let worker = started(&server, WorkerType::Llm).await;

        let mut updated = params(&server);
        updated.num_ctx = Some(4096);
        assert!(worker.update_params(&updated).await.unwrap());

        let metadata = worker.metadata().await.unwrap();
        assert_eq!(metadata.context_length, Some(4096));

        updated.base_url = Some("http://elsewhere:11434".to_string());
        assert!(!worker.update_params(&updated).await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_reads_context_length() {
        let server = MockServer::start().await;
        let worker = started(&server, WorkerType::Llm).await;
        let metadata = worker.metadata().await.unwrap();
        assert_eq!(metadata.context_length, Some(8192));
        assert_eq!(metadata.ext_metadata["details"]["family"], "llama");
    }
}
