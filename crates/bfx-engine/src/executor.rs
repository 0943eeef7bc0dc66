//! Execution sequencer.
//!
//! Turns a borrow task into exchange operations: place the funding bid,
//! give it a moment to fill, cancel any residual, then close the
//! displaced credits. Also sweeps the account's own lent-out funding at
//! the start of each activation window.

use crate::error::{EngineError, EngineResult};
use bfx_client::BfxPrivateClient;
use bfx_core::{BorrowTask, Rate};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Term of the funding bid in days.
const BID_PERIOD_DAYS: u32 = 2;
/// Time allowed for the bid to fill before checking.
const FILL_WAIT: Duration = Duration::from_secs(2);
/// Extra wait before a partially filled bid is cancelled.
const CANCEL_WAIT: Duration = Duration::from_secs(10);
/// Closures between rate-limit pauses.
const CLOSE_BATCH: usize = 80;
const CLOSE_BATCH_PAUSE: Duration = Duration::from_secs(60);

pub struct Executor {
    private: Arc<BfxPrivateClient>,
    currency: String,
}

impl Executor {
    pub fn new(private: Arc<BfxPrivateClient>, currency: impl Into<String>) -> Self {
        Self {
            private,
            currency: currency.into(),
        }
    }

    /// Run one borrow task to completion.
    pub async fn execute(&self, task: &BorrowTask) -> EngineResult<()> {
        if task.is_empty() {
            return Ok(());
        }

        // Bid above the consumed ask rate so the makers lift it.
        let bid_rate = Rate::new(task.rate.inner() * Decimal::new(11, 1));
        let res = self
            .private
            .submit_bid_order(&self.currency, task.total_borrow, bid_rate, BID_PERIOD_DAYS)
            .await?;
        if !res.success {
            return Err(EngineError::Execution(format!(
                "bid rejected: {} {}",
                res.status, res.text
            )));
        }
        let order_id = res.order.as_ref().map(|o| o.id);
        info!(
            amount = %task.total_borrow,
            rate = %bid_rate,
            order_id,
            "funding bid placed"
        );

        tokio::time::sleep(FILL_WAIT).await;

        if let Some(order_id) = order_id {
            let active = self.private.get_active_orders(&self.currency).await?;
            if active.iter().any(|o| o.id == order_id) {
                // Partial fill; give it a little longer, then pull it.
                tokio::time::sleep(CANCEL_WAIT).await;
                let res = self.private.cancel_order(order_id).await?;
                if res.success {
                    info!(order_id, "residual bid cancelled");
                } else {
                    warn!(order_id, status = %res.status, text = %res.text, "cancel failed");
                }
            }
        }

        for (i, loan_id) in task.loan_ids_to_close.iter().enumerate() {
            if i > 0 && i % CLOSE_BATCH == 0 {
                info!(closed = i, "pausing closures for rate limits");
                tokio::time::sleep(CLOSE_BATCH_PAUSE).await;
            }
            let res = self.private.close_funding(*loan_id).await?;
            if !res.success {
                return Err(EngineError::Execution(format!(
                    "closing credit {loan_id} failed: {} {}",
                    res.status, res.text
                )));
            }
            info!(loan_id, "displaced credit closed");
        }

        info!(
            borrowed = %task.total_borrow,
            closed = task.loan_ids_to_close.len(),
            "borrow task finished"
        );
        Ok(())
    }

    /// Close the account's own lent-out funding for the currency.
    ///
    /// These are loans on the lending side, not the borrows backing
    /// positions; keeping them open would tie up the funds the bid needs.
    pub async fn close_unused_fundings(&self) -> EngineResult<()> {
        let loans = self.private.get_loans(&self.currency).await?;
        if loans.is_empty() {
            return Ok(());
        }
        info!(count = loans.len(), "closing unused lent-out funding");
        for (i, loan) in loans.iter().enumerate() {
            if i > 0 && i % CLOSE_BATCH == 0 {
                info!(closed = i, "pausing closures for rate limits");
                tokio::time::sleep(CLOSE_BATCH_PAUSE).await;
            }
            let res = self.private.close_funding(loan.id).await?;
            if !res.success {
                return Err(EngineError::Execution(format!(
                    "closing loan {} failed: {} {}",
                    loan.id, res.status, res.text
                )));
            }
            info!(loan_id = loan.id, "loan closed");
        }
        Ok(())
    }
}
