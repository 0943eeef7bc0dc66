//! Error types for the agent binary.

use thiserror::Error;

/// Application-level errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error(transparent)]
    Engine(#[from] bfx_engine::EngineError),

    #[error(transparent)]
    Client(#[from] bfx_client::ClientError),

    #[error(transparent)]
    Ws(#[from] bfx_ws::WsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the binary.
pub type AppResult<T> = std::result::Result<T, AppError>;
