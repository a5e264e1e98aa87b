//! Error taxonomy shared across the gateway.
//!
//! Mirrors the OpenAI error envelope on the client-facing side
//! (`{"error": {"message", "type", "code", "param"}}`) while keeping a typed
//! `UpstreamError` for anything that crosses the reverse-client boundary, in
//! the same split `thiserror` (typed) / `anyhow` (glue) style as the rest of
//! the crate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Upstream non-2xx or transport failure, carrying enough detail for the
/// retry engine and the token pool to decide how to react.
#[derive(Debug, thiserror::Error)]
#[error("upstream error: status={status} body={body}")]
pub struct UpstreamError {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<u64>,
}

impl UpstreamError {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<u64>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// Raised when an upstream stream produces no chunk within the idle window.
#[derive(Debug, thiserror::Error)]
#[error("stream idle timeout after {idle_secs}s")]
pub struct StreamIdleTimeout {
    pub idle_secs: u64,
}

/// Public error type returned to API clients.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error("permission error: {0}")]
    Permission(String),
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("stream idle timeout")]
    StreamIdleTimeout(#[from] StreamIdleTimeout),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn rate_limit_exceeded(msg: impl Into<String>) -> Self {
        Self::RateLimitExceeded(msg.into())
    }

    /// Public `type` discriminator per the error taxonomy.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Authentication(_) => "authentication_error",
            Self::Permission(_) => "permission_error",
            Self::RateLimitExceeded(_) => "rate_limit_exceeded",
            Self::Upstream(_) => "upstream_error",
            Self::StreamIdleTimeout(_) => "stream_idle_timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Permission(_) => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::StreamIdleTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(err) => match err.status {
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                429 => StatusCode::TOO_MANY_REQUESTS,
                504 => StatusCode::GATEWAY_TIMEOUT,
                503 => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                error_type: self.error_type().to_string(),
                code: self.error_type().to_string(),
                param: None,
            },
        }
    }
}

/// OpenAI-shaped error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub param: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let envelope = self.to_envelope();
        tracing::warn!(
            event = "request_failed",
            status = status.as_u16(),
            error_type = envelope.error.error_type,
            message = envelope.error.message,
            "request failed"
        );
        (status, axum::Json(envelope)).into_response()
    }
}
