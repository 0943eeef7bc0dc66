//! Error types for the realtime plane.

use thiserror::Error;

/// Realtime websocket errors.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Exchange command error: {0}")]
    Command(String),

    #[error("Disconnection broke the pending command")]
    Disconnected,

    #[error("Client is stopping")]
    Stopped,

    #[error("Malformed frame: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] bfx_core::CoreError),

    #[error("Websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for realtime operations.
pub type WsResult<T> = std::result::Result<T, WsError>;
