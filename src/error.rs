//! Error taxonomy. Each component keeps a small, local
//! error type; `KmeError` is the single place that knows about HTTP status
//! codes and the §6.3 wire shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KmeError {
    #[error("authentication failed: {0}")]
    AuthenticationError(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("gone: {0}")]
    Gone(String),

    #[error("exhausted: {0}")]
    Exhausted(String),

    #[error("extension rejected: {0}")]
    ExtensionRejected(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KmeError {
    fn status(&self) -> StatusCode {
        match self {
            KmeError::AuthenticationError(_) => StatusCode::UNAUTHORIZED,
            KmeError::Forbidden(_) => StatusCode::FORBIDDEN,
            KmeError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            KmeError::NotFound(_) => StatusCode::NOT_FOUND,
            KmeError::Gone(_) => StatusCode::GONE,
            KmeError::Exhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            KmeError::ExtensionRejected(_) => StatusCode::BAD_REQUEST,
            KmeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            KmeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wire shape for JSON error bodies returned to the caller.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<serde_json::Value>>,
}

impl IntoResponse for KmeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status >= StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        let body = ErrorBody {
            message: self.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

pub type KmeResult<T> = Result<T, KmeError>;
