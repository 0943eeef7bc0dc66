//! Periodic control loop.
//!
//! Aligns with the exchange's auto-loan tick: sleeps to each window
//! start, sweeps lent-out funding, snapshots the held credits, then
//! arms a randomized task timer plus an opportunistic trigger that
//! fires early when cheap asks appear on the book. Firing is idempotent
//! per window and a failed cycle never kills the process.

use crate::engine::{next_aligned, Engine};
use crate::error::{run_safely, EngineResult};
use crate::executor::Executor;
use crate::fetcher::DataFetcher;
use bfx_client::BfxPrivateClient;
use bfx_core::{Credit, OrderBook};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Randomized lead of the task timer before the window end (ms).
const FIRE_JITTER_MS: std::ops::Range<u64> = 100..60_100;

/// Watches the book's top ask for a sudden drop worth front-running.
pub struct AskWatch {
    enabled: AtomicBool,
    triggered: AtomicBool,
    /// Relative drop of the top ask that arms the trigger.
    threshold: f64,
    last_seen: Mutex<Option<f64>>,
    notify: Notify,
}

impl AskWatch {
    pub fn new(threshold: f64) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            triggered: AtomicBool::new(false),
            threshold,
            last_seen: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Enable checking, seeded with the current top ask.
    pub fn arm(&self, top_ask: Option<f64>) {
        *self.last_seen.lock() = top_ask;
        self.triggered.store(false, Ordering::Release);
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Feed a book snapshot; wakes the waiter when the top ask dropped
    /// by more than the threshold since the last observation.
    pub fn observe(&self, book: &OrderBook) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let Some(top) = book.top_ask() else { return };
        let top = top.rate.to_f64();
        let mut last = self.last_seen.lock();
        let dropped = last
            .map(|prev| top < prev * (1.0 - self.threshold))
            .unwrap_or(false);
        *last = Some(top);
        drop(last);
        if dropped {
            self.triggered.store(true, Ordering::Release);
            self.notify.notify_one();
        }
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }

    fn take_triggered(&self) -> bool {
        self.triggered.swap(false, Ordering::AcqRel)
    }
}

pub struct ControlLoop {
    engine: Engine,
    executor: Executor,
    fetcher: DataFetcher,
    private: Arc<BfxPrivateClient>,
    stop: CancellationToken,
    /// Set once the window's task has fired.
    fired: AtomicBool,
    /// Held across a full borrow-task execution.
    task_lock: TokioMutex<()>,
    /// Credits as of window start, by id.
    al_credits: Mutex<HashMap<u64, Credit>>,
    watch: Arc<AskWatch>,
}

impl ControlLoop {
    pub fn new(
        engine: Engine,
        executor: Executor,
        fetcher: DataFetcher,
        private: Arc<BfxPrivateClient>,
        stop: CancellationToken,
    ) -> Self {
        let watch = Arc::new(AskWatch::new(
            engine.config().min_rate_diff_in_ask_to_force_borrow,
        ));
        Self {
            engine,
            executor,
            fetcher,
            private,
            stop,
            fired: AtomicBool::new(false),
            task_lock: TokioMutex::new(()),
            al_credits: Mutex::new(HashMap::new()),
            watch,
        }
    }

    /// Drive activation windows until stopped.
    pub async fn run(&self) {
        if self.engine.config().realtime {
            let watch = Arc::clone(&self.watch);
            self.fetcher
                .set_order_book_handler(Some(Arc::new(move |book| watch.observe(&book))));
        }

        loop {
            let cfg = self.engine.config();
            let t_start = next_aligned(
                Utc::now(),
                cfg.auto_loan_fetch_period,
                cfg.auto_loan_fetch_shift,
            );
            let window = window_length(
                cfg.auto_loan_fetch_period,
                cfg.auto_loan_fetch_shift,
                cfg.auto_loan_fetch_end_shift,
            );
            info!(start = %t_start, window_secs = window.as_secs(), "next activation window");
            if !self.sleep_until(t_start).await {
                break;
            }
            self.run_window(t_start, window).await;
            if self.stop.is_cancelled() {
                break;
            }
        }
        self.fetcher.set_order_book_handler(None);
        info!("control loop stopped");
    }

    /// Sleep until a wall-clock instant; false when stopped meanwhile.
    async fn sleep_until(&self, t: DateTime<Utc>) -> bool {
        let wait = (t - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = tokio::time::sleep(wait) => true,
            () = self.stop.cancelled() => false,
        }
    }

    async fn run_window(&self, t_start: DateTime<Utc>, window: Duration) {
        info!("activation window opened");
        run_safely("window prelude", self.window_prelude()).await;

        self.fired.store(false, Ordering::Release);
        if self.engine.config().realtime {
            let top_ask = self
                .fetcher
                .get_order_book()
                .top_ask()
                .map(|e| e.rate.to_f64());
            self.watch.arm(top_ask);
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(FIRE_JITTER_MS));
        let now = Utc::now();
        let end_at = t_start + chrono::Duration::from_std(window).unwrap_or_default();
        let end_in = (end_at - now).to_std().unwrap_or(Duration::ZERO);
        let fire_in = end_in.saturating_sub(jitter);
        debug!(fire_secs = fire_in.as_secs(), end_secs = end_in.as_secs(), "timers armed");

        let fire_timer = tokio::time::sleep(fire_in);
        let end_timer = tokio::time::sleep(end_in);
        tokio::pin!(fire_timer, end_timer);

        loop {
            let fired = self.fired.load(Ordering::Acquire);
            tokio::select! {
                () = self.stop.cancelled() => break,

                () = &mut end_timer => break,

                () = &mut fire_timer, if !fired => {
                    self.fire("window timer").await;
                }

                () = self.watch.wait(), if !fired => {
                    if self.watch.take_triggered() {
                        self.fire("top ask dropped").await;
                    }
                }
            }
        }
        self.watch.disarm();
        info!("activation window closed");
    }

    /// Window start work: sweep lent-out funding, log the funding
    /// state, snapshot credits for the fire-time merge.
    async fn window_prelude(&self) -> EngineResult<()> {
        self.executor.close_unused_fundings().await?;
        let credits = self.private.get_credits(self.fetcher.currency()).await?;
        log_funding_summary(&credits);
        *self.al_credits.lock() = credits.into_iter().map(|c| (c.loan.id, c)).collect();
        Ok(())
    }

    /// Fire the borrow task once per window.
    async fn fire(&self, reason: &str) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!(reason, "firing borrow task");
        run_safely("borrow task", self.borrow_task_once()).await;
    }

    async fn borrow_task_once(&self) -> EngineResult<()> {
        let _guard = self.task_lock.lock().await;
        let currency = self.fetcher.currency();

        let fresh = self.private.get_credits(currency).await?;
        let credits = self.merge_with_window_snapshot(fresh);
        let positions = self.private.get_positions().await?;
        let balances = self.private.get_margin_balances().await?;
        let total = self
            .engine
            .calculate_total_borrow(&positions, Some(&balances));
        let book = self.fetcher.get_order_book();
        let usd_price = self.fetcher.get_usd_price()?.to_f64();

        let task = self
            .engine
            .make_borrow_task(&book, &credits, total, usd_price, Utc::now());
        if task.is_empty() {
            info!("no profitable refinancing this cycle");
            return Ok(());
        }
        info!(
            total_borrow = %task.total_borrow,
            closing = task.loan_ids_to_close.len(),
            rate = %task.rate,
            "borrow task ready"
        );
        self.executor.execute(&task).await
    }

    /// Fresh credits plus window-start credits that vanished and expire
    /// this cycle: the exchange refinanced those mid-window, and their
    /// amounts still need covering.
    fn merge_with_window_snapshot(&self, fresh: Vec<Credit>) -> Vec<Credit> {
        let next_tick = self.engine.next_auto_loan_time(Utc::now());
        let ids: HashSet<u64> = fresh.iter().map(|c| c.loan.id).collect();
        let mut merged = fresh;
        for (id, credit) in self.al_credits.lock().iter() {
            if !ids.contains(id) && credit.loan.expires_at() <= next_tick {
                merged.push(credit.clone());
            }
        }
        merged
    }
}

/// Window length `(end_shift - shift) mod period`.
pub fn window_length(period: Duration, shift: Duration, end_shift: Duration) -> Duration {
    let p = period.as_millis() as i64;
    let d = (end_shift.as_millis() as i64 - shift.as_millis() as i64).rem_euclid(p);
    Duration::from_millis(d as u64)
}

fn log_funding_summary(credits: &[Credit]) {
    let total: f64 = credits.iter().map(|c| c.loan.amount.to_f64()).sum();
    let weighted: f64 = credits
        .iter()
        .map(|c| c.loan.amount.to_f64() * c.loan.rate.to_f64())
        .sum();
    let avg_rate = if total > 0.0 { weighted / total } else { 0.0 };
    info!(
        credits = credits.len(),
        total_borrowed = total,
        avg_rate,
        "funding summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfx_core::{Amount, OrderBookEntry, Rate};

    fn book_with_top(rate_units: u64) -> OrderBook {
        OrderBook {
            bid: Vec::new(),
            ask: vec![OrderBookEntry {
                rate: Rate::from_units(rate_units),
                period: 2,
                amount: Amount::from_units(1_000_000_000),
            }],
        }
    }

    #[test]
    fn test_window_length_wraps_over_period() {
        // Shift 15m, end shift 9m20s, period 20m: the window spans the
        // next tick and lasts 14m20s.
        let d = window_length(
            Duration::from_secs(20 * 60),
            Duration::from_secs(15 * 60),
            Duration::from_secs(9 * 60 + 20),
        );
        assert_eq!(d, Duration::from_secs(14 * 60 + 20));

        let plain = window_length(
            Duration::from_secs(20 * 60),
            Duration::from_secs(60),
            Duration::from_secs(5 * 60),
        );
        assert_eq!(plain, Duration::from_secs(4 * 60));
    }

    #[test]
    fn test_ask_watch_triggers_on_drop() {
        let watch = AskWatch::new(0.2);
        watch.arm(Some(0.001));

        // 10% drop: below the 20% threshold.
        watch.observe(&book_with_top(900_000_000));
        assert!(!watch.take_triggered());

        // A further drop past 20% of the last observation.
        watch.observe(&book_with_top(700_000_000));
        assert!(watch.take_triggered());
    }

    #[test]
    fn test_ask_watch_ignores_when_disarmed() {
        let watch = AskWatch::new(0.2);
        watch.arm(Some(0.001));
        watch.disarm();
        watch.observe(&book_with_top(100_000_000));
        assert!(!watch.take_triggered());
    }

    #[test]
    fn test_ask_watch_seeds_from_first_observation() {
        let watch = AskWatch::new(0.2);
        watch.arm(None);
        // First observation only seeds the baseline.
        watch.observe(&book_with_top(1_000_000_000));
        assert!(!watch.take_triggered());
        watch.observe(&book_with_top(500_000_000));
        assert!(watch.take_triggered());
    }
}
