//! Funding order book: price-aggregated levels, two rate-ordered sides.

use crate::decimal::{Amount, Rate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Side of a funding order or trade.
///
/// On the wire a signed amount encodes the side: negative is a bid
/// (demand to borrow), positive an offer (supply to lend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Offer,
}

impl Side {
    /// Side from the sign of a wire amount.
    pub fn from_negative(neg: bool) -> Self {
        if neg {
            Side::Bid
        } else {
            Side::Offer
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => write!(f, "bid"),
            Side::Offer => write!(f, "offer"),
        }
    }
}

/// One aggregated price level of the funding book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookEntry {
    /// Per-day rate of the level.
    pub rate: Rate,
    /// Funding term in days.
    pub period: u32,
    /// Aggregate amount at the level.
    pub amount: Amount,
}

impl OrderBookEntry {
    /// Rate ordering; levels are addressed by rate.
    pub fn cmp_rate(&self, other: &OrderBookEntry) -> Ordering {
        self.rate.cmp(&other.rate)
    }
}

/// Replicated funding order book.
///
/// Invariant: `bid` is sorted descending by rate, `ask` ascending, and
/// each side holds at most the subscription's depth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bid: Vec<OrderBookEntry>,
    pub ask: Vec<OrderBookEntry>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore the side orderings after a bulk load.
    pub fn sort_sides(&mut self) {
        self.bid.sort_by(|a, b| b.cmp_rate(a));
        self.ask.sort_by(|a, b| a.cmp_rate(b));
    }

    /// Best (cheapest) ask level, if any.
    pub fn top_ask(&self) -> Option<&OrderBookEntry> {
        self.ask.first()
    }

    pub fn is_empty(&self) -> bool {
        self.bid.is_empty() && self.ask.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rate_units: u64, amount_units: u64) -> OrderBookEntry {
        OrderBookEntry {
            rate: Rate::from_units(rate_units),
            period: 2,
            amount: Amount::from_units(amount_units),
        }
    }

    #[test]
    fn test_sort_sides() {
        let mut ob = OrderBook {
            bid: vec![entry(100, 1), entry(300, 1), entry(200, 1)],
            ask: vec![entry(500, 1), entry(400, 1), entry(600, 1)],
        };
        ob.sort_sides();
        let bid_rates: Vec<u64> = ob.bid.iter().map(|e| e.rate.units()).collect();
        let ask_rates: Vec<u64> = ob.ask.iter().map(|e| e.rate.units()).collect();
        assert_eq!(bid_rates, vec![300, 200, 100]);
        assert_eq!(ask_rates, vec![400, 500, 600]);
    }

    #[test]
    fn test_top_ask() {
        let mut ob = OrderBook::new();
        assert!(ob.top_ask().is_none());
        ob.ask = vec![entry(400, 1), entry(500, 1)];
        assert_eq!(ob.top_ask().unwrap().rate.units(), 400);
    }

    #[test]
    fn test_side_from_sign() {
        assert_eq!(Side::from_negative(true), Side::Bid);
        assert_eq!(Side::from_negative(false), Side::Offer);
    }
}
