//! Error types for the engine crate.

use thiserror::Error;

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Client(#[from] bfx_client::ClientError),

    #[error(transparent)]
    Ws(#[from] bfx_ws::WsError),

    #[error(transparent)]
    Core(#[from] bfx_core::CoreError),

    #[error("No USD market exists for the configured currency")]
    NoUsdPrice,

    #[error("Execution failed: {0}")]
    Execution(String),
}

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Run one periodic action, logging instead of propagating its failure
/// so a failed tick never kills the process.
pub async fn run_safely<F>(name: &str, fut: F)
where
    F: std::future::Future<Output = EngineResult<()>>,
{
    if let Err(e) = fut.await {
        tracing::error!(task = name, error = %e, "periodic task failed");
    }
}
