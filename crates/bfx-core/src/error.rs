//! Error types for bfx-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid market symbol: {0}")]
    InvalidMarket(String),

    #[error("Unknown order status: {0}")]
    UnknownOrderStatus(String),

    #[error("Malformed wire payload: {0}")]
    Protocol(String),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
