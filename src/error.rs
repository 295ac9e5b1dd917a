//! Error types for chatrelay.

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for chatrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chatrelay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The request body was not a valid Chat Completions request.
    #[error("Invalid request body: {message}")]
    InvalidBody { status: StatusCode, message: String },

    #[error("No messages provided")]
    NoMessages,

    #[error("Unsupported model '{model}'")]
    UnsupportedModel { model: String },

    /// Upstream answered the connection attempt with a non-success status.
    #[error("Failed to connect to upstream server")]
    UpstreamStatus { status: u16 },

    /// Connection or transport failure talking to the upstream.
    #[error("Failed to connect to upstream server")]
    Upstream(#[from] reqwest::Error),

    /// No response or no body bytes from the upstream within the read timeout.
    #[error("Upstream stalled for more than {after:?}")]
    UpstreamTimeout { after: Duration },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidBody { status, .. } => *status,
            Error::NoMessages | Error::UnsupportedModel { .. } => StatusCode::BAD_REQUEST,
            Error::UpstreamStatus { .. } | Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::InvalidBody {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });

        (status, axum::Json(body)).into_response()
    }
}
