//! Account-side funding state: loans, credits, positions, balances,
//! active offers, and the borrow task the decision engine emits.

use crate::book::Side;
use crate::decimal::{Amount, Rate};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A public funding trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub amount: Amount,
    pub rate: Rate,
    pub period: u32,
}

/// A funding rate candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Rate,
    pub high: Rate,
    pub low: Rate,
    pub close: Rate,
    pub volume: Amount,
}

/// An active funded loan.
///
/// From the account's lending side these are "loans"; the borrowing
/// side's entries are [`Credit`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: u64,
    pub currency: String,
    /// 1 lender, -1 borrower, 0 both.
    pub side: i32,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub amount: Amount,
    pub status: String,
    pub rate: Rate,
    /// Funding term in days.
    pub period: u32,
    pub renew: bool,
    pub no_close: bool,
}

impl Loan {
    /// The loan runs out `period` days after it was taken.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.create_time + Duration::days(i64::from(self.period))
    }
}

/// A funded loan backing a margin position (borrowing side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub loan: Loan,
    /// Market whose position the funds back.
    pub market: String,
}

/// An open margin position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub market: String,
    pub status: String,
    pub amount: Amount,
    pub long: bool,
    pub base_price: Amount,
    pub funding: Amount,
    pub liq_price: Amount,
}

/// A wallet balance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    /// Wallet type, e.g. `margin` or `exchange`.
    pub wallet: String,
    pub total: Amount,
    pub available: Amount,
}

/// Lifecycle state of a funding offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Active,
    Executed,
    PartiallyFilled,
    Canceled,
}

impl OrderStatus {
    /// Parse the exchange's status text. Executed and canceled statuses
    /// arrive with trailing fill details, so match on the prefix.
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with("ACTIVE") {
            Ok(OrderStatus::Active)
        } else if s.starts_with("EXECUTED") {
            Ok(OrderStatus::Executed)
        } else if s.starts_with("PARTIALLY FILLED") {
            Ok(OrderStatus::PartiallyFilled)
        } else if s.starts_with("CANCELED") {
            Ok(OrderStatus::Canceled)
        } else {
            Err(CoreError::UnknownOrderStatus(s.to_string()))
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Active => write!(f, "active"),
            OrderStatus::Executed => write!(f, "executed"),
            OrderStatus::PartiallyFilled => write!(f, "partially filled"),
            OrderStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// An active funding offer on the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub currency: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    /// Remaining amount; negative wire values mark a bid.
    pub amount: Amount,
    pub amount_orig: Amount,
    pub side: Side,
    pub status: OrderStatus,
    pub rate: Rate,
    pub period: u32,
}

/// What to borrow and which credits to displace, as decided for one
/// activation window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BorrowTask {
    /// Amount to bid for on the funding book.
    pub total_borrow: Amount,
    /// Held credits to close once the bid fills.
    pub loan_ids_to_close: Vec<u64>,
    /// Highest ask rate consumed while sizing the task.
    pub rate: Rate,
}

impl BorrowTask {
    pub fn is_empty(&self) -> bool {
        self.total_borrow.is_zero()
    }
}
