//! Service error type with HTTP status mapping.
//!
//! Every fallible boundary returns a tagged [`ServiceError`] instead of an
//! error string embedded in the payload. The WebSocket chat bridge is the
//! one place errors are converted to in-band text, at the socket edge.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("completion request failed: {0}")]
    Completion(String),
    #[error("pdf error: {0}")]
    Pdf(String),
}

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ServiceError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", detail.clone())
            }
            ServiceError::NotFound(detail) => (StatusCode::NOT_FOUND, "NOT_FOUND", detail.clone()),
            ServiceError::Storage(detail) => {
                tracing::error!(detail = %detail, "session storage fault");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE",
                    "Session storage fault".to_string(),
                )
            }
            ServiceError::Completion(detail) => {
                tracing::error!(detail = %detail, "completion backend failure");
                (StatusCode::BAD_GATEWAY, "UPSTREAM", detail.clone())
            }
            ServiceError::Pdf(detail) => {
                tracing::error!(detail = %detail, "pdf processing failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PDF",
                    "PDF processing failed".to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };
        (status, Json(body)).into_response()
    }
}
