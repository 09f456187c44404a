//! Error types for worker management and dispatch.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cluster_common::{error_code, ErrorBody, ModelOutput};
use serde::de::DeserializeOwned;

/// Failure taxonomy shared by the registry, the managers and the worker host API.
///
/// Messages are complete sentences so that an error decoded from a remote
/// `{"error": ...}` body renders the same as the original.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or missing request fields. Nothing was dispatched.
    #[error("{0}")]
    Validation(String),

    /// No healthy instance matches the requested model and worker type.
    #[error("{0}")]
    NoAvailableWorker(String),

    /// Every matching instance is at its concurrency limit.
    #[error("{0}")]
    WorkerSaturated(String),

    #[error("{0}")]
    WorkerTimeout(String),

    /// A worker reported a non-zero error code.
    #[error("{message}")]
    WorkerFailure { code: i32, message: String },

    /// Network failure talking to a controller or a remote worker host.
    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    StartupFailed(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Numeric code carried in `ModelOutput.error_code` and error bodies.
    pub fn code(&self) -> i32 {
        match self {
            Error::Validation(_) => error_code::VALIDATION_TYPE_ERROR,
            Error::NoAvailableWorker(_) => error_code::CONTROLLER_NO_WORKER,
            Error::WorkerSaturated(_) => error_code::ENGINE_OVERLOADED,
            Error::WorkerTimeout(_) => error_code::CONTROLLER_WORKER_TIMEOUT,
            Error::WorkerFailure { code, .. } => *code,
            Error::Transport(_) => error_code::TRANSPORT_ERROR,
            Error::StartupFailed(_) | Error::Unsupported(_) | Error::Internal(_) => {
                error_code::INTERNAL_ERROR
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::NoAvailableWorker(_) => "no_available_worker",
            Error::WorkerSaturated(_) => "worker_saturated",
            Error::WorkerTimeout(_) => "worker_timeout",
            Error::WorkerFailure { .. } => "worker_failure",
            Error::Transport(_) => "transport_error",
            Error::StartupFailed(_) => "startup_failed",
            Error::Unsupported(_) => "unsupported",
            Error::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NoAvailableWorker(_) => StatusCode::NOT_FOUND,
            Error::WorkerSaturated(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::WorkerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::WorkerFailure { .. } | Error::StartupFailed(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.kind(), self.code(), self.to_string())
    }

    /// Terminal stream item for this error.
    pub fn to_output(&self) -> ModelOutput {
        ModelOutput::error(self.code(), self.to_string())
    }

    /// Rebuild the error a remote peer rendered into an error body.
    pub fn from_body(body: ErrorBody) -> Self {
        let ErrorBody { error } = body;
        match error.kind.as_str() {
            "validation_error" => Error::Validation(error.message),
            "no_available_worker" => Error::NoAvailableWorker(error.message),
            "worker_saturated" => Error::WorkerSaturated(error.message),
            "worker_timeout" => Error::WorkerTimeout(error.message),
            "transport_error" => Error::Transport(error.message),
            "startup_failed" => Error::StartupFailed(error.message),
            "unsupported" => Error::Unsupported(error.message),
            "internal_error" => Error::Internal(error.message),
            _ => Error::WorkerFailure {
                code: error.code,
                message: error.message,
            },
        }
    }

    /// Map a failed `ModelOutput` back into an error.
    pub fn from_output(output: &ModelOutput) -> Self {
        match output.error_code {
            error_code::CONTROLLER_NO_WORKER => Error::NoAvailableWorker(output.text.clone()),
            error_code::CONTROLLER_WORKER_TIMEOUT => Error::WorkerTimeout(output.text.clone()),
            error_code::ENGINE_OVERLOADED => Error::WorkerSaturated(output.text.clone()),
            error_code::TRANSPORT_ERROR => Error::Transport(output.text.clone()),
            code => Error::WorkerFailure {
                code,
                message: output.text.clone(),
            },
        }
    }

    /// Whether retrying the same idempotent call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::WorkerTimeout(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::WorkerTimeout(format!("Request timed out: {}", e))
        } else if e.is_decode() {
            Error::Internal(format!("Malformed response: {}", e))
        } else {
            Error::Transport(format!("Request failed: {}", e))
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decode a JSON response, turning non-success statuses into the error the peer reported.
pub async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    Err(error_from_response(response).await)
}

pub async fn error_from_response(response: reqwest::Response) -> Error {
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => Error::from_body(parsed),
        Err(_) if status.is_server_error() => {
            Error::Transport(format!("{} returned {}: {}", url, status, body))
        }
        Err(_) => Error::Internal(format!("{} returned {}: {}", url, status, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_roundtrip_keeps_variant() {
        let original = Error::NoAvailableWorker("No available worker for m1@llm".to_string());
        let decoded = Error::from_body(original.to_body());
        assert!(matches!(decoded, Error::NoAvailableWorker(_)));
        assert_eq!(decoded.to_string(), original.to_string());
    }

    #[test]
    fn test_worker_failure_keeps_code() {
        let decoded = Error::from_body(ErrorBody::new("worker_failure", 40302, "bad temperature"));
        assert_eq!(decoded.code(), 40302);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::Validation("x".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::WorkerSaturated("x".to_string()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(Error::Transport("x".to_string()).code(), 50003);
    }

    #[test]
    fn test_from_output() {
        let out = ModelOutput::error(error_code::CONTROLLER_WORKER_TIMEOUT, "slow");
        assert!(matches!(Error::from_output(&out), Error::WorkerTimeout(_)));
    }
}
