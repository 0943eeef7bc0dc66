//! Error types for the REST adapters.

use thiserror::Error;

/// REST client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("HTTP status {0}")]
    Status(u16),

    #[error(transparent)]
    Core(#[from] bfx_core::CoreError),

    #[error("Malformed response: {0}")]
    Protocol(String),
}

/// Result type alias for REST operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
