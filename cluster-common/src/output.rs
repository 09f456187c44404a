//! Results produced by workers and the structured error body shared by every HTTP surface.

use serde::{Deserialize, Serialize};

/// Numeric error codes carried in `ModelOutput.error_code` and HTTP error bodies.
pub mod error_code {
    pub const OK: i32 = 0;
    pub const VALIDATION_TYPE_ERROR: i32 = 40001;
    pub const INVALID_AUTH_KEY: i32 = 40101;
    pub const INCORRECT_AUTH_KEY: i32 = 40102;
    pub const INVALID_MODEL: i32 = 40301;
    pub const PARAM_OUT_OF_RANGE: i32 = 40302;
    pub const ENGINE_OVERLOADED: i32 = 42903;
    pub const INTERNAL_ERROR: i32 = 50001;
    pub const TRANSPORT_ERROR: i32 = 50003;
    pub const CONTROLLER_NO_WORKER: i32 = 50005;
    pub const CONTROLLER_WORKER_TIMEOUT: i32 = 50006;
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Length => write!(f, "length"),
        }
    }
}

/// Token accounting for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl ModelUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Field-wise sum, saturating at `u32::MAX`.
    pub fn add(&mut self, other: &ModelUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// Output of one generation call, or one chunk of a stream.
///
/// In a stream `text` is cumulative: every chunk carries everything generated so far.
/// A non-zero `error_code` signals failure and terminates the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub text: String,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ModelUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

impl ModelOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error_code: error_code::OK,
            finish_reason: None,
            usage: None,
            metrics: None,
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            ..Self::text(message)
        }
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }

    pub fn with_usage(mut self, usage: ModelUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error_code != error_code::OK
    }
}

/// Static facts about a deployed model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub context_length: Option<u32>,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub ext_metadata: serde_json::Map<String, serde_json::Value>,
}

/// Description of one startup parameter a worker backend understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescription {
    pub param_name: String,
    pub param_type: String,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl ParameterDescription {
    pub fn new(
        param_name: &str,
        param_type: &str,
        default_value: Option<serde_json::Value>,
        description: &str,
    ) -> Self {
        Self {
            param_name: param_name.to_string(),
            param_type: param_type.to_string(),
            required: default_value.is_none(),
            default_value,
            description: description.to_string(),
        }
    }
}

/// `{"error": {"message", "type", "code"}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: i32,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.into(),
                code,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_output_skips_empty_optionals() {
        let json = serde_json::to_string(&ModelOutput::text("hi")).unwrap();
        assert_eq!(json, r#"{"text":"hi","error_code":0}"#);
    }

    #[test]
    fn test_model_output_error() {
        let out = ModelOutput::error(error_code::CONTROLLER_NO_WORKER, "no worker");
        assert!(out.is_error());
        assert_eq!(out.text, "no worker");
    }

    #[test]
    fn test_finish_reason_wire_names() {
        let out = ModelOutput::text("done").with_finish_reason(FinishReason::Length);
        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains(r#""finish_reason":"length""#));
    }

    #[test]
    fn test_usage_add() {
        let mut total = ModelUsage::default();
        total.add(&ModelUsage::new(10, 5));
        total.add(&ModelUsage::new(3, 2));
        assert_eq!(total, ModelUsage::new(13, 7));
    }

    #[test]
    fn test_usage_add_saturates() {
        let mut total = ModelUsage::new(u32::MAX - 1, 1);
        total.add(&ModelUsage::new(5, 5));
        assert_eq!(total.prompt_tokens, u32::MAX);
        assert_eq!(total.completion_tokens, 6);
        assert_eq!(total.total_tokens, u32::MAX);
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody::new("invalid_request_error", error_code::INVALID_MODEL, "bad model");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["code"], 40301);
        assert_eq!(json["error"]["message"], "bad model");
    }

    #[test]
    fn test_parameter_description_required_without_default() {
        let required = ParameterDescription::new("model_path", "string", None, "Path to weights");
        assert!(required.required);

        let optional = ParameterDescription::new(
            "concurrency",
            "integer",
            Some(serde_json::json!(5)),
            "Max in-flight calls",
        );
        assert!(!optional.required);
    }
}
