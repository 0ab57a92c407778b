//! Application-level error type for HTTP handlers.

use atelier_core::error::CoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Wraps [`CoreError`] for domain errors and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error bodies.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `atelier-core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => {
                let status = match core {
                    CoreError::NoCapableNode { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                    CoreError::MissingParameter(_)
                    | CoreError::UnsupportedAdapter(_)
                    | CoreError::CorruptExport(_)
                    | CoreError::Config(_) => StatusCode::BAD_REQUEST,
                    CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    CoreError::Transport(_) | CoreError::RejectedByWorker(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    CoreError::Cancelled => StatusCode::CONFLICT,
                    CoreError::Internal(msg) => {
                        tracing::error!(error = %msg, "Internal error");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, core.kind(), core.to_string())
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
