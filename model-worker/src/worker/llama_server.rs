//! llama.cpp worker backend.
//!
//! Each worker owns one `llama-server` subprocess on an OS-assigned port. The process is
//! polled on `/health` until ready, stopped with SIGTERM (then killed after a timeout), and
//! served through its OpenAI-compatible endpoints.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

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
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

use super::{backend_client, echo_prefix, ModelOutputStream, ModelWorker};
use crate::error::{error_from_response, read_json, Error, Result};
use crate::line_stream::{lines, sse_data};

const HEALTH_CHECK_INTERVAL_MS: u64 = 200;
const DEFAULT_SERVER_BINARY: &str = "llama-server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
}

/// A running llama-server process.
struct ServerProcess {
    port: u16,
    state: RwLock<ServerState>,
    process: RwLock<Option<Child>>,
}

impl ServerProcess {
    fn new(port: u16, process: Option<Child>) -> Self {
        Self {
            port,
            state: RwLock::new(ServerState::Starting),
            process: RwLock::new(process),
        }
    }

    async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ServerState) {
        *self.state.write().await = state;
    }

    async fn is_process_alive(&self) -> bool {
        let mut process = self.process.write().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// SIGTERM, wait up to `timeout_secs`, then kill.
    async fn terminate(&self, model_name: &str, timeout_secs: u64) {
        self.set_state(ServerState::ShuttingDown).await;

        let mut process_guard = self.process.write().await;
        if let Some(mut child) = process_guard.take() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }

            match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(model = model_name, %status, "llama-server exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(model = model_name, error = %e, "Error waiting for llama-server");
                }
                Err(_timeout) => {
                    tracing::warn!(model = model_name, "llama-server didn't stop gracefully, killing");
                    let _ = child.kill().await;
                }
            }
        }

        self.set_state(ServerState::Stopped).await;
    }
}

/// Worker backed by a managed `llama-server` subprocess.
pub struct LlamaServerWorker {
    model_name: String,
    worker_type: WorkerType,
    params: WorkerParams,
    http_client: Client,
    server: RwLock<Option<Arc<ServerProcess>>>,
}

impl LlamaServerWorker {
    pub fn new(model_name: &str, worker_type: WorkerType, params: WorkerParams) -> Result<Self> {
        if params.model_path.is_none() {
            return Err(Error::Validation(format!(
                "model_path is required for llama_server worker {}",
                model_name
            )));
        }
        Ok(Self {
            model_name: model_name.to_string(),
            worker_type,
            http_client: backend_client(worker_type)?,
            params,
            server: RwLock::new(None),
        })
    }

    fn server_binary(&self) -> &str {
        self.params
            .server_binary
            .as_deref()
            .unwrap_or(DEFAULT_SERVER_BINARY)
    }

    /// Port of the server if it is ready to serve.
    async fn ready_port(&self) -> Result<u16> {
        let server = self.server.read().await;
        match server.as_ref() {
            Some(process) if process.state().await == ServerState::Ready => Ok(process.port),
            _ => Err(Error::Internal(format!(
                "llama-server for {} is not running",
                self.model_name
            ))),
        }
    }

    async fn url(&self, path: &str) -> Result<String> {
        Ok(format!("http://127.0.0.1:{}{}", self.ready_port().await?, path))
    }

    async fn allocate_port() -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::StartupFailed(format!("Failed to bind for port allocation: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::StartupFailed(format!("Failed to get local addr: {}", e)))?
            .port();
        drop(listener);
        Ok(port)
    }

    fn command(&self, model_path: &Path, port: u16) -> Command {
        let mut cmd = Command::new(self.server_binary());

        for arg in &self.params.server_args {
            cmd.arg(arg);
        }
        cmd.arg("-m")
            .arg(model_path)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--parallel")
            .arg(self.params.concurrency.max(1).to_string());

        if let Some(gpu_layers) = self.params.gpu_layers {
            cmd.arg("-ngl").arg(gpu_layers.to_string());
        }
        if let Some(ctx_size) = self.params.context_size {
            cmd.arg("-c").arg(ctx_size.to_string());
        }
        if let Some(template) = &self.params.prompt_template {
            cmd.arg("--chat-template").arg(template);
        }
        match self.worker_type {
            WorkerType::Llm => {}
            WorkerType::Embedding => {
                cmd.arg("--embedding");
            }
            WorkerType::Reranker => {
                cmd.arg("--reranking");
            }
        }
        for arg in &self.params.extra_args {
            cmd.arg(arg);
        }

        cmd.stdin(Stdio::null()).kill_on_drop(true);
        if self.params.log_server_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd
    }

    /// Poll `/health` until ready. Fails if the process exits first; the caller bounds the wait.
    async fn wait_for_ready(&self, server: &ServerProcess) -> Result<()> {
        let start = Instant::now();
        let health_url = format!("http://127.0.0.1:{}/health", server.port);

        loop {
            if !server.is_process_alive().await {
                return Err(Error::StartupFailed(format!(
                    "llama-server process died during startup for {}",
                    self.model_name
                )));
            }

            if let Ok(resp) = self.http_client.get(&health_url).send().await {
                if resp.status().is_success() {
                    server.set_state(ServerState::Ready).await;
                    tracing::info!(
                        model = %self.model_name,
                        port = server.port,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "llama-server ready"
                    );
                    return Ok(());
                }
            }

            tokio::time::sleep(Duration::from_millis(HEALTH_CHECK_INTERVAL_MS)).await;
        }
    }

    fn chat_request(&self, request: &PromptRequest, stream: bool) -> LlamaChatRequest {
        LlamaChatRequest {
            model: self.model_name.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| LlamaMessage {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_new_tokens,
            top_p: request.top_p,
            top_k: request.top_k,
            stop: request.stop.clone(),
            stream,
        }
    }

    #[cfg(test)]
    async fn attach(&self, port: u16) {
        let process = Arc::new(ServerProcess::new(port, None));
        process.set_state(ServerState::Ready).await;
        *self.server.write().await = Some(process);
    }
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

// ============================================================================
// llama-server API types (OpenAI-compatible)
// ============================================================================

#[derive(Debug, Serialize)]
struct LlamaChatRequest {
    model: String,
    messages: Vec<LlamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct LlamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct LlamaChatResponse {
    choices: Vec<LlamaChoice>,
    #[serde(default)]
    usage: Option<LlamaUsage>,
}

#[derive(Debug, Deserialize)]
struct LlamaChoice {
    message: LlamaResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlamaResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlamaStreamChunk {
    #[serde(default)]
    choices: Vec<LlamaStreamChoice>,
    #[serde(default)]
    usage: Option<LlamaUsage>,
}

#[derive(Debug, Deserialize)]
struct LlamaStreamChoice {
    #[serde(default)]
    delta: LlamaDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LlamaDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlamaUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<LlamaUsage> for ModelUsage {
    fn from(usage: LlamaUsage) -> Self {
        ModelUsage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct LlamaEmbeddingsResponse {
    data: Vec<LlamaEmbedding>,
}

#[derive(Debug, Deserialize)]
struct LlamaEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct LlamaRerankResponse {
    results: Vec<LlamaRerankResult>,
}

#[derive(Debug, Deserialize)]
struct LlamaRerankResult {
    index: usize,
    relevance_score: f32,
}

#[derive(Debug, Deserialize)]
struct LlamaTokenizeResponse {
    tokens: Vec<serde_json::Value>,
}

// ============================================================================
// ModelWorker implementation
// ============================================================================

#[async_trait]
impl ModelWorker for LlamaServerWorker {
    fn backend(&self) -> &'static str {
        "llama_server"
    }

    fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    fn parameter_descriptions(&self) -> Vec<ParameterDescription> {
        vec![
            ParameterDescription::new("model_path", "string", None, "Path to the GGUF model file"),
            ParameterDescription::new(
                "server_binary",
                "string",
                Some(json!(DEFAULT_SERVER_BINARY)),
                "llama-server binary or wrapper command",
            ),
            ParameterDescription::new(
                "server_args",
                "array",
                Some(json!([])),
                "Arguments placed before the model flags",
            ),
            ParameterDescription::new(
                "extra_args",
                "array",
                Some(json!([])),
                "Arguments appended after the standard flags",
            ),
            ParameterDescription::new(
                "gpu_layers",
                "integer",
                Some(json!(null)),
                "Layers offloaded to the GPU (-ngl)",
            ),
            ParameterDescription::new(
                "context_size",
                "integer",
                Some(json!(null)),
                "Context window size (-c)",
            ),
            ParameterDescription::new(
                "concurrency",
                "integer",
                Some(json!(5)),
                "Concurrent calls admitted and server slots",
            ),
            ParameterDescription::new(
                "prompt_template",
                "string",
                Some(json!(null)),
                "Chat template name passed to the server",
            ),
            ParameterDescription::new(
                "shutdown_timeout_secs",
                "integer",
                Some(json!(10)),
                "Grace period before the server is killed",
            ),
            ParameterDescription::new(
                "log_server_output",
                "boolean",
                Some(json!(false)),
                "Inherit the server's stdout and stderr",
            ),
        ]
    }

    async fn start(&self) -> Result<()> {
        if self.is_alive().await {
            return Ok(());
        }

        let model_path = self.params.model_path.clone().unwrap_or_default();
        if !Path::new(&model_path).exists() {
            return Err(Error::StartupFailed(format!(
                "Model file not found: {}",
                model_path
            )));
        }

        let port = Self::allocate_port().await?;
        let process = self
            .command(Path::new(&model_path), port)
            .spawn()
            .map_err(|e| {
                Error::StartupFailed(format!(
                    "Failed to spawn llama-server for {}: {}. Binary: {}",
                    self.model_name,
                    e,
                    self.server_binary()
                ))
            })?;

        tracing::info!(
            model = %self.model_name,
            port,
            pid = ?process.id(),
            "Spawned llama-server"
        );

        let server = Arc::new(ServerProcess::new(port, Some(process)));
        if let Err(e) = self.wait_for_ready(&server).await {
            server
                .terminate(&self.model_name, self.params.shutdown_timeout_secs)
                .await;
            return Err(e);
        }

        *self.server.write().await = Some(server);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let server = self.server.write().await.take();
        if let Some(server) = server {
            server
                .terminate(&self.model_name, self.params.shutdown_timeout_secs)
                .await;
            tracing::info!(model = %self.model_name, "llama-server stopped");
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        let server = self.server.read().await;
        match server.as_ref() {
            Some(process) => process.is_process_alive().await,
            None => false,
        }
    }

    async fn generate(&self, request: &PromptRequest) -> Result<ModelOutput> {
        let url = self.url("/v1/chat/completions").await?;
        let response = self
            .http_client
            .post(&url)
            .json(&self.chat_request(request, false))
            .send()
            .await?;
        let llama_response: LlamaChatResponse = read_json(response).await?;

        let choice = llama_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("No choices in llama-server response".to_string()))?;

        let text = echo_prefix(request) + &choice.message.content.unwrap_or_default();
        let mut output = ModelOutput::text(text)
            .with_finish_reason(finish_reason(choice.finish_reason.as_deref().unwrap_or("stop")));
        output.usage = llama_response.usage.map(Into::into);
        Ok(output)
    }

    async fn generate_stream(&self, request: PromptRequest) -> Result<ModelOutputStream> {
        let url = self.url("/v1/chat/completions").await?;
        let response = self
            .http_client
            .post(&url)
            .json(&self.chat_request(&request, true))
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
                let Some(data) = sse_data(&line) else {
                    continue;
                };
                if data == "[DONE]" {
                    break;
                }
                let chunk: LlamaStreamChunk = match serde_json::from_str(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield ModelOutput::error(
                            error_code::INTERNAL_ERROR,
                            format!("Malformed llama-server chunk: {}", e),
                        );
                        return;
                    }
                };
                let usage = chunk.usage.map(ModelUsage::from);
                if let Some(choice) = chunk.choices.into_iter().next() {
                    if let Some(content) = choice.delta.content {
                        text.push_str(&content);
                    }
                    let mut output = ModelOutput::text(text.clone());
                    output.finish_reason = choice.finish_reason.as_deref().map(finish_reason);
                    output.usage = usage;
                    yield output;
                }
            }
        }))
    }

    async fn embeddings(&self, request: &EmbeddingsRequest) -> Result<Vec<Vec<f32>>> {
        match self.worker_type {
            WorkerType::Llm => Err(Error::Unsupported(format!(
                "{} is a text generation worker",
                self.model_name
            ))),
            WorkerType::Embedding => {
                let url = self.url("/v1/embeddings").await?;
                let body = json!({ "model": self.model_name, "input": request.input });
                let response = self.http_client.post(&url).json(&body).send().await?;
                let mut parsed: LlamaEmbeddingsResponse = read_json(response).await?;
                parsed.data.sort_by_key(|e| e.index);
                Ok(parsed.data.into_iter().map(|e| e.embedding).collect())
            }
            WorkerType::Reranker => {
                let query = request.query.as_deref().ok_or_else(|| {
                    Error::Validation("query is required for rerank".to_string())
                })?;
                let url = self.url("/v1/rerank").await?;
                let body = json!({
                    "model": self.model_name,
                    "query": query,
                    "documents": request.input,
                });
                let response = self.http_client.post(&url).json(&body).send().await?;
                let parsed: LlamaRerankResponse = read_json(response).await?;
                let mut scores = vec![0.0; request.input.len()];
                for result in parsed.results {
                    if let Some(score) = scores.get_mut(result.index) {
                        *score = result.relevance_score;
                    }
                }
                Ok(vec![scores])
            }
        }
    }

    async fn count_token(&self, prompt: &str) -> Result<usize> {
        let url = self.url("/tokenize").await?;
        let response = self
            .http_client
            .post(&url)
            .json(&json!({ "content": prompt }))
            .send()
            .await?;
        let parsed: LlamaTokenizeResponse = read_json(response).await?;
        Ok(parsed.tokens.len())
    }

    async fn metadata(&self) -> Result<ModelMetadata> {
        let url = self.url("/props").await?;
        let response = self.http_client.get(&url).send().await?;
        let props: serde_json::Value = read_json(response).await?;

        let mut ext_metadata = serde_json::Map::new();
        for key in ["total_slots", "model_path", "build_info"] {
            if let Some(value) = props.get(key) {
                ext_metadata.insert(key.to_string(), value.clone());
            }
        }

        Ok(ModelMetadata {
            model: self.model_name.clone(),
            backend: Some(self.backend().to_string()),
            context_length: props
                .pointer("/default_generation_settings/n_ctx")
                .and_then(|v| v.as_u64())
                .map(|n| n as u32),
            prompt_template: props
                .get("chat_template")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| self.params.prompt_template.clone()),
            ext_metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_common::ModelMessage;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params() -> WorkerParams {
        WorkerParams {
            model_path: Some("/models/test.gguf".to_string()),
            ..WorkerParams::with_backend("llama_server")
        }
    }

    async fn attached(server: &MockServer, worker_type: WorkerType) -> LlamaServerWorker {
        let worker = LlamaServerWorker::new("test-model", worker_type, params()).unwrap();
        worker.attach(server.address().port()).await;
        worker
    }

    fn prompt() -> PromptRequest {
        PromptRequest::new("test-model", vec![ModelMessage::user("Hello")])
    }

    #[test]
    fn test_requires_model_path() {
        let result = LlamaServerWorker::new(
            "m",
            WorkerType::Llm,
            WorkerParams::with_backend("llama_server"),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_model_file() {
        let worker = LlamaServerWorker::new("m", WorkerType::Llm, params()).unwrap();
        let result = worker.start().await;
        assert!(matches!(result, Err(Error::StartupFailed(_))));
        assert!(!worker.is_alive().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_detects_process_exit() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let mut params = params();
        params.model_path = Some(model.path().display().to_string());
        params.server_binary = Some("false".to_string());

        let worker = LlamaServerWorker::new("m", WorkerType::Llm, params).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), worker.start())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::StartupFailed(_))));
    }

    #[tokio::test]
    async fn test_calls_fail_when_not_running() {
        let worker = LlamaServerWorker::new("m", WorkerType::Llm, params()).unwrap();
        assert!(worker.generate(&prompt()).await.is_err());
    }

    #[tokio::test]
    async fn test_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hi there"},
                    "finish_reason": "length"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })))
            .mount(&server)
            .await;

        let worker = attached(&server, WorkerType::Llm).await;
        let output = worker.generate(&prompt()).await.unwrap();
        assert_eq!(output.text, "Hi there");
        assert_eq!(output.finish_reason, Some(FinishReason::Length));
        assert_eq!(output.usage, Some(ModelUsage::new(3, 2)));
    }

    #[tokio::test]
    async fn test_generate_stream_is_cumulative() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let worker = attached(&server, WorkerType::Llm).await;
        let outputs: Vec<ModelOutput> = worker
            .generate_stream(prompt())
            .await
            .unwrap()
            .collect()
            .await;

        let texts: Vec<&str> = outputs.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, vec!["", "Hel", "Hello", "Hello"]);
        assert_eq!(outputs[3].finish_reason, Some(FinishReason::Stop));
        assert!(outputs.iter().all(|o| !o.is_error()));
    }

    #[tokio::test]
    async fn test_embeddings_sorted_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [0.3, 0.4]},
                    {"index": 0, "embedding": [0.1, 0.2]}
                ]
            })))
            .mount(&server)
            .await;

        let worker = attached(&server, WorkerType::Embedding).await;
        let request = EmbeddingsRequest::new("test-model", vec!["a".into(), "b".into()]);
        let vectors = worker.embeddings(&request).await.unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[tokio::test]
    async fn test_rerank_scores_in_document_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/rerank"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"index": 1, "relevance_score": 0.9},
                    {"index": 0, "relevance_score": 0.2}
                ]
            })))
            .mount(&server)
            .await;

        let worker = attached(&server, WorkerType::Reranker).await;
        let mut request = EmbeddingsRequest::new("test-model", vec!["a".into(), "b".into()]);
        request.query = Some("q".to_string());
        let scores = worker.embeddings(&request).await.unwrap();
        assert_eq!(scores, vec![vec![0.2, 0.9]]);
    }

    #[tokio::test]
    async fn test_count_token_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tokenize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tokens": [1, 2, 3]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/props"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "default_generation_settings": {"n_ctx": 4096},
                "total_slots": 5,
                "chat_template": "chatml"
            })))
            .mount(&server)
            .await;

        let worker = attached(&server, WorkerType::Llm).await;
        assert_eq!(worker.count_token("a b c").await.unwrap(), 3);

        let metadata = worker.metadata().await.unwrap();
        assert_eq!(metadata.context_length, Some(4096));
        assert_eq!(metadata.prompt_template.as_deref(), Some("chatml"));
        assert_eq!(metadata.ext_metadata["total_slots"], 5);
    }

    #[tokio::test]
    async fn test_llm_worker_rejects_embeddings() {
        let server = MockServer::start().await;
        let worker = attached(&server, WorkerType::Llm).await;
        let request = EmbeddingsRequest::new("test-model", vec!["a".into()]);
        assert!(matches!(
            worker.embeddings(&request).await,
            Err(Error::Unsupported(_))
        ));
    }
}
