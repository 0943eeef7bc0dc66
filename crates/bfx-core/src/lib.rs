//! Core domain types for the Bitfinex funding agent.
//!
//! This crate provides the fundamental types used throughout the agent:
//! - `Rate`, `Amount`: fixed-precision decimal newtypes
//! - `OrderBook`, `OrderBookEntry`, `Trade`, `Candle`: public market data
//! - `Loan`, `Credit`, `Position`, `Balance`, `Order`: account state
//! - `BorrowTask`: the decision engine's output
//! - `wire`: helpers for the exchange's positional-array JSON format

pub mod book;
pub mod decimal;
pub mod error;
pub mod funding;
pub mod market;
pub mod wire;

pub use book::{OrderBook, OrderBookEntry, Side};
pub use decimal::{Amount, Rate, AMOUNT_SCALE, RATE_SCALE};
pub use error::{CoreError, Result};
pub use funding::{
    Balance, BorrowTask, Candle, Credit, Loan, Order, OrderStatus, Position, Trade,
};
pub use market::Market;
