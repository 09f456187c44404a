//! Gateway errors, rendered as `{"error": {"message", "type", "code"}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cluster_common::{error_code, ErrorBody};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or malformed field.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    ParamOutOfRange(String),

    #[error("Only {available} allowed now, your model {model}")]
    InvalidModel { model: String, available: String },

    #[error("Missing bearer token")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error(transparent)]
    Worker(#[from] model_worker::Error),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn code(&self) -> i32 {
        match self {
            ApiError::InvalidRequest(_) => error_code::VALIDATION_TYPE_ERROR,
            ApiError::ParamOutOfRange(_) => error_code::PARAM_OUT_OF_RANGE,
            ApiError::InvalidModel { .. } => error_code::INVALID_MODEL,
            ApiError::MissingApiKey => error_code::INVALID_AUTH_KEY,
            ApiError::InvalidApiKey => error_code::INCORRECT_AUTH_KEY,
            ApiError::Worker(e) => e.code(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_)
            | ApiError::ParamOutOfRange(_)
            | ApiError::InvalidModel { .. } => StatusCode::BAD_REQUEST,
            ApiError::MissingApiKey | ApiError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ApiError::Worker(e) => e.status(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let kind = match self {
            ApiError::InvalidRequest(_)
            | ApiError::ParamOutOfRange(_)
            | ApiError::InvalidModel { .. } => "invalid_request_error",
            ApiError::MissingApiKey | ApiError::InvalidApiKey => "authentication_error",
            ApiError::Worker(e) => e.kind(),
        };
        ErrorBody::new(kind, self.code(), self.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        } else {
            tracing::debug!(code = self.code(), "{}", self);
        }
        (self.status(), Json(self.to_body())).into_response()
    }
}
