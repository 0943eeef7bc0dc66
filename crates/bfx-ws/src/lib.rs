//! Realtime market-data plane.
//!
//! One duplex websocket connection multiplexes ticker, trades and
//! funding-book channels. Book subscriptions are replicated locally
//! through sequence-numbered diffs with automatic resynchronisation on
//! loss, and every subscription is restored after a reconnect.

pub mod book;
pub mod client;
pub mod error;
pub mod message;
pub mod seqbuf;

pub use book::{apply_diff, BookDiff, BookFeed, BookHandler, BookMaintainer, RT_BOOK_DEPTH};
pub use client::{PriceHandler, RtPublicClient, TradeHandler};
pub use error::{WsError, WsResult};
pub use message::{ChannelKind, ChannelMessage, Event, Frame};
pub use seqbuf::{Drained, SeqBuffer, SeqError};
