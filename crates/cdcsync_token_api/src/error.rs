//! Error types for the token endpoint.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cdcsync_engine::SyncError;
use serde::Serialize;
use thiserror::Error;

/// Result type for endpoint operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors that can occur in the token endpoint.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed client input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The credential source is gone or failed.
    #[error("token unavailable: {0}")]
    Unavailable(String),

    /// I/O error while serving.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(self, ApiError::InvalidRequest(_))
    }

    /// HTTP status for the error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

/// JSON body sent with error responses.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// HTTP status code.
    pub error_code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let reason = match &self {
            ApiError::InvalidRequest(reason) => reason.clone(),
            other => other.to_string(),
        };
        tracing::debug!(status = status.as_u16(), reason = %reason, "sending error to client");
        let body = ErrorBody {
            error_code: status.as_u16(),
            reason,
        };
        (status, Json(body)).into_response()
    }
}
