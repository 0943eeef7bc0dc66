//! REST adapters for the exchange.
//!
//! `BfxPublicClient` covers the unauthenticated market-data endpoints;
//! `BfxPrivateClient` covers the credentialed account and funding
//! operations with HMAC-SHA384 request signing.

pub mod error;
mod http;
pub mod private;
pub mod public;
pub mod sign;

pub use error::{ClientError, ClientResult};
pub use private::{BfxPrivateClient, CloseResult, OpResult};
pub use public::BfxPublicClient;
pub use sign::NonceGen;
