//! Error handling module for SaleStream
//!
//! This module defines the error taxonomy shared by every component and maps
//! each kind onto an HTTP response, so callers always see the kind of failure
//! and never a raw internal error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for SaleStream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for SaleStream
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Client data is malformed; never retried
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// Ingest buffer is at its hard limit; caller must retry with backoff
    #[error("Ingest buffer is full, retry later")]
    Backpressure,

    /// Durable log write or read failure
    #[error("IO error: {0}")]
    Io(String),

    /// Commit retries were exhausted and ingestion is paused
    #[error("Ingestion is paused after repeated log failures")]
    IngestionPaused,

    /// Query engine failed or timed out and no cached value could be served
    #[error("Upstream query failed: {0}")]
    Upstream(String),

    /// Analytics kind is not in the allow-list
    #[error("Unknown analytics kind: {0}")]
    UnknownKind(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Shutdown in progress
    #[error("Service is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid-input error
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Error::Invalid(msg.into())
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(msg: S) -> Self {
        Error::Io(msg.into())
    }

    /// Create an upstream error
    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        Error::Upstream(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Invalid(_) | Error::UnknownKind(_) => StatusCode::BAD_REQUEST,
            Error::Backpressure => StatusCode::TOO_MANY_REQUESTS,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::IngestionPaused | Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) | Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }

    /// Check if the caller may retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Backpressure | Error::Io(_) | Error::Upstream(_) | Error::IngestionPaused
        )
    }

    /// Taxonomy kind reported to clients
    pub fn kind(&self) -> &'static str {
        error_type(self)
    }
}

/// Implement IntoResponse for automatic error responses in Axum
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type(&self),
                "status": status.as_u16(),
            }
        }));

        match status {
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::BAD_GATEWAY => {
                tracing::error!(error = ?self, "Server-side failure");
            },
            StatusCode::BAD_REQUEST => {
                tracing::warn!(error = ?self, "Client error");
            },
            _ => {
                tracing::info!(error = ?self, "Request error");
            },
        }

        (status, body).into_response()
    }
}

/// Get the taxonomy kind of the error
fn error_type(error: &Error) -> &'static str {
    match error {
        Error::Config(_) => "configuration_error",
        Error::Invalid(_) | Error::Serialization(_) => "invalid",
        Error::Backpressure => "backpressure",
        Error::Io(_) | Error::IngestionPaused => "io",
        Error::Upstream(_) => "upstream",
        Error::UnknownKind(_) => "unknown_kind",
        Error::Internal(_) => "internal_error",
        Error::ShuttingDown => "shutting_down",
    }
}

/// Convert from envconfig::Error to our Error type
impl From<envconfig::Error> for Error {
    fn from(err: envconfig::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
