//! Replicated funding book: diff application and per-subscription state.
//!
//! The exchange sends one snapshot per subscription followed by
//! price-level diffs. Diffs are keyed by rate; a zero amount removes the
//! level. Application is non-destructive: each diff produces a fresh
//! bounded snapshot that is safe to hand to subscribers without locking.

use crate::seqbuf::{SeqBuffer, SeqError};
use bfx_core::{OrderBook, OrderBookEntry, Side};
use std::sync::Arc;
use tracing::{debug, warn};

/// Real-time book depth requested from the exchange.
pub const RT_BOOK_DEPTH: usize = 25;

/// Callback receiving each published book snapshot.
///
/// Invocations for a batch of folded diffs may run concurrently; the
/// handler must tolerate that.
pub type BookHandler = Arc<dyn Fn(OrderBook) + Send + Sync>;

/// One price-level change on one side of the book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookDiff {
    pub side: Side,
    pub entry: OrderBookEntry,
}

impl BookDiff {
    /// A zero amount means the level disappeared.
    pub fn is_delete(&self) -> bool {
        self.entry.amount.is_zero()
    }
}

/// Apply one diff to `book`, producing a new snapshot.
///
/// The touched side is rebuilt around the insertion point found by
/// binary search; an equal-rate slot is replaced (or removed for a
/// delete); the result is truncated to `max_depth`. The opposite side is
/// copied verbatim.
pub fn apply_diff(book: &OrderBook, diff: &BookDiff, max_depth: usize) -> OrderBook {
    let mut out = OrderBook::new();
    match diff.side {
        Side::Bid => {
            out.bid = apply_to_side(&book.bid, diff, max_depth, |probe, e| {
                probe.rate > e.rate // bid side: descending by rate
            });
            out.ask = book.ask.clone();
        }
        Side::Offer => {
            out.ask = apply_to_side(&book.ask, diff, max_depth, |probe, e| {
                probe.rate < e.rate // ask side: ascending by rate
            });
            out.bid = book.bid.clone();
        }
    }
    out
}

fn apply_to_side(
    side: &[OrderBookEntry],
    diff: &BookDiff,
    max_depth: usize,
    before: impl Fn(&OrderBookEntry, &OrderBookEntry) -> bool,
) -> Vec<OrderBookEntry> {
    let delete = diff.is_delete();
    // Insertion point: first index the diff entry does not sort before.
    let i = side.partition_point(|e| before(e, &diff.entry));
    let replaced = i < side.len() && side[i].rate == diff.entry.rate;

    if delete && !replaced {
        // Nothing at this level; a stale delete is a no-op.
        return side.to_vec();
    }

    let mut out = Vec::with_capacity(max_depth);
    out.extend_from_slice(&side[..i]);
    if !delete {
        out.push(diff.entry);
    }
    let skip = if replaced { i + 1 } else { i };
    out.extend_from_slice(&side[skip..]);
    out.truncate(max_depth);
    out
}

/// A diff paired with its channel sequence number.
#[derive(Debug)]
pub struct SequencedDiff {
    pub seq: u64,
    pub diff: BookDiff,
}

/// Outcome of feeding one frame into a [`BookMaintainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookFeed {
    Ok,
    /// Sequence numbers were lost or collided; the subscription must be
    /// rebuilt to obtain a fresh snapshot.
    NeedsResync,
}

/// Per-subscription replica state.
///
/// Owns the last acknowledged snapshot plus diffs that ran ahead of it,
/// and publishes every intermediate snapshot to the subscriber handler.
pub struct BookMaintainer {
    key: String,
    max_depth: usize,
    seqbuf: SeqBuffer<SequencedDiff>,
    /// Snapshot sequence number and book, once received.
    snapshot: Option<(u64, OrderBook)>,
    /// In-order diffs waiting for the snapshot to catch up.
    pending: Vec<SequencedDiff>,
    /// Set after a gap; frames are ignored until the fresh snapshot lands.
    broken: bool,
    handler: BookHandler,
}

impl BookMaintainer {
    pub fn new(key: impl Into<String>, handler: BookHandler) -> Self {
        Self {
            key: key.into(),
            max_depth: RT_BOOK_DEPTH,
            seqbuf: SeqBuffer::new(),
            snapshot: None,
            pending: Vec::new(),
            broken: false,
            handler,
        }
    }

    /// Drop all derived state, e.g. before a resubscription.
    pub fn clear(&mut self) {
        self.seqbuf.clear();
        self.snapshot = None;
        self.pending.clear();
        self.broken = false;
    }

    /// Install the initial snapshot and flush any diffs that outran it.
    pub fn push_snapshot(&mut self, seq: u64, book: OrderBook) {
        debug!(key = %self.key, seq, "book snapshot received");
        self.broken = false;
        self.publish(book.clone());
        self.snapshot = Some((seq, book));
        self.pending.retain(|d| d.seq > seq);
        self.fold_pending();
    }

    /// Feed one sequenced diff.
    pub fn push_diff(&mut self, seq: u64, diff: BookDiff) -> BookFeed {
        if self.broken {
            // Resubscription already requested; drop frames until the
            // fresh snapshot arrives.
            return BookFeed::Ok;
        }
        let drained = match self.seqbuf.push(seq, SequencedDiff { seq, diff }) {
            Ok(d) => d,
            Err(SeqError::Collision(seq)) => {
                warn!(key = %self.key, seq, "sequence collision, forcing resync");
                return self.mark_broken();
            }
        };
        let gap = drained.gap;
        self.pending.extend(drained.ready);
        if gap {
            warn!(key = %self.key, "sequence gap, forcing resync");
            return self.mark_broken();
        }
        self.fold_pending();
        BookFeed::Ok
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn mark_broken(&mut self) -> BookFeed {
        self.broken = true;
        self.snapshot = None;
        self.pending.clear();
        self.seqbuf.clear();
        BookFeed::NeedsResync
    }

    /// Fold in-order pending diffs into the snapshot, publishing each
    /// intermediate state.
    fn fold_pending(&mut self) {
        let Some((snap_seq, _)) = self.snapshot else {
            return;
        };
        let ready = self
            .pending
            .first()
            .map_or(false, |first| first.seq <= snap_seq + 1);
        if !ready {
            return;
        }
        let mut applied = Vec::new();
        let (mut seq, mut book) = self.snapshot.take().expect("snapshot checked above");
        for d in self.pending.drain(..) {
            if d.seq <= seq {
                continue; // already part of the snapshot
            }
            book = apply_diff(&book, &d.diff, self.max_depth);
            seq = d.seq;
            applied.push(book.clone());
        }
        self.snapshot = Some((seq, book));
        for snapshot in applied {
            self.publish(snapshot);
        }
    }

    fn publish(&self, book: OrderBook) {
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move { handler(book) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfx_core::{Amount, Rate};

    fn entry(rate_units: u64, amount_units: u64) -> OrderBookEntry {
        OrderBookEntry {
            rate: Rate::from_units(rate_units),
            period: 2,
            amount: Amount::from_units(amount_units),
        }
    }

    fn ask_diff(rate_units: u64, amount_units: u64) -> BookDiff {
        BookDiff {
            side: Side::Offer,
            entry: entry(rate_units, amount_units),
        }
    }

    fn bid_diff(rate_units: u64, amount_units: u64) -> BookDiff {
        BookDiff {
            side: Side::Bid,
            entry: entry(rate_units, amount_units),
        }
    }

    fn ask_rates(ob: &OrderBook) -> Vec<u64> {
        ob.ask.iter().map(|e| e.rate.units()).collect()
    }

    fn bid_rates(ob: &OrderBook) -> Vec<u64> {
        ob.bid.iter().map(|e| e.rate.units()).collect()
    }

    fn sample_book() -> OrderBook {
        OrderBook {
            bid: vec![entry(300, 10), entry(200, 10), entry(100, 10)],
            ask: vec![entry(400, 10), entry(500, 10), entry(600, 10)],
        }
    }

    #[test]
    fn test_insert_keeps_order() {
        let book = sample_book();
        let out = apply_diff(&book, &ask_diff(450, 5), 25);
        assert_eq!(ask_rates(&out), vec![400, 450, 500, 600]);
        assert_eq!(bid_rates(&out), vec![300, 200, 100]);

        let out = apply_diff(&book, &bid_diff(250, 5), 25);
        assert_eq!(bid_rates(&out), vec![300, 250, 200, 100]);
        assert_eq!(ask_rates(&out), vec![400, 500, 600]);
    }

    #[test]
    fn test_update_replaces_level() {
        let book = sample_book();
        let out = apply_diff(&book, &ask_diff(500, 77), 25);
        assert_eq!(ask_rates(&out), vec![400, 500, 600]);
        assert_eq!(out.ask[1].amount.units(), 77);
    }

    #[test]
    fn test_zero_amount_deletes_level() {
        let book = sample_book();
        let out = apply_diff(&book, &ask_diff(500, 0), 25);
        assert_eq!(ask_rates(&out), vec![400, 600]);

        let out = apply_diff(&book, &bid_diff(200, 0), 25);
        assert_eq!(bid_rates(&out), vec![300, 100]);
    }

    #[test]
    fn test_stale_delete_is_noop() {
        let book = sample_book();
        let out = apply_diff(&book, &ask_diff(999, 0), 25);
        assert_eq!(ask_rates(&out), ask_rates(&book));
    }

    #[test]
    fn test_depth_cap_evicts_worst() {
        let book = OrderBook {
            bid: Vec::new(),
            ask: vec![entry(400, 1), entry(500, 1), entry(600, 1)],
        };
        let out = apply_diff(&book, &ask_diff(450, 1), 3);
        assert_eq!(ask_rates(&out), vec![400, 450, 500]);

        let book = OrderBook {
            bid: vec![entry(600, 1), entry(500, 1), entry(400, 1)],
            ask: Vec::new(),
        };
        let out = apply_diff(&book, &bid_diff(550, 1), 3);
        assert_eq!(bid_rates(&out), vec![600, 550, 500]);
    }

    #[test]
    fn test_insert_beyond_depth_is_dropped() {
        let book = OrderBook {
            bid: Vec::new(),
            ask: vec![entry(400, 1), entry(500, 1), entry(600, 1)],
        };
        let out = apply_diff(&book, &ask_diff(700, 1), 3);
        assert_eq!(ask_rates(&out), vec![400, 500, 600]);
    }

    #[test]
    fn test_apply_is_deterministic() {
        let book = sample_book();
        let d = ask_diff(450, 5);
        let a = apply_diff(&book, &d, 25);
        let b = apply_diff(&book, &d, 25);
        assert_eq!(ask_rates(&a), ask_rates(&b));
        assert_eq!(a.ask, b.ask);
    }

    #[test]
    fn test_sides_stay_sorted_and_bounded() {
        // Random-ish diff storm; both sides must stay ordered and capped.
        let mut book = OrderBook::new();
        let seq = [
            (Side::Offer, 500u64, 10u64),
            (Side::Offer, 300, 10),
            (Side::Bid, 200, 10),
            (Side::Offer, 400, 0),
            (Side::Bid, 250, 3),
            (Side::Offer, 300, 7),
            (Side::Bid, 200, 0),
            (Side::Offer, 450, 2),
            (Side::Offer, 350, 1),
            (Side::Bid, 150, 4),
        ];
        for (side, rate, amount) in seq {
            let diff = BookDiff {
                side,
                entry: entry(rate, amount),
            };
            book = apply_diff(&book, &diff, 3);
        }
        assert!(book.ask.len() <= 3 && book.bid.len() <= 3);
        assert!(book.ask.windows(2).all(|w| w[0].rate < w[1].rate));
        assert!(book.bid.windows(2).all(|w| w[0].rate > w[1].rate));
    }

    #[tokio::test]
    async fn test_maintainer_folds_out_of_order_diffs() {
        use parking_lot::Mutex;
        let published: Arc<Mutex<Vec<OrderBook>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        let handler: BookHandler = Arc::new(move |ob| sink.lock().push(ob));

        let mut m = BookMaintainer::new("UST", handler);
        // Diff 11 arrives before the snapshot at seq 10.
        assert_eq!(m.push_diff(11, ask_diff(450, 5)), BookFeed::Ok);
        m.push_snapshot(10, sample_book());
        // Snapshot publish + folded diff publish.
        let (seq, book) = m.snapshot.clone().unwrap();
        assert_eq!(seq, 11);
        assert_eq!(ask_rates(&book), vec![400, 450, 500, 600]);

        // Next in-order diff folds directly.
        assert_eq!(m.push_diff(12, ask_diff(400, 0)), BookFeed::Ok);
        let (seq, book) = m.snapshot.clone().unwrap();
        assert_eq!(seq, 12);
        assert_eq!(ask_rates(&book), vec![450, 500, 600]);
    }

    #[tokio::test]
    async fn test_maintainer_discards_stale_pending() {
        let handler: BookHandler = Arc::new(|_| {});
        let mut m = BookMaintainer::new("UST", handler);
        assert_eq!(m.push_diff(8, ask_diff(450, 5)), BookFeed::Ok);
        // Snapshot at seq 10 supersedes the buffered diff at 8 (first
        // event anchors the reorder buffer, so it is released).
        m.push_snapshot(10, sample_book());
        let (seq, book) = m.snapshot.clone().unwrap();
        assert_eq!(seq, 10);
        assert_eq!(ask_rates(&book), vec![400, 500, 600]);
    }

    #[tokio::test]
    async fn test_maintainer_gap_forces_resync() {
        let handler: BookHandler = Arc::new(|_| {});
        let mut m = BookMaintainer::new("UST", handler);
        m.push_snapshot(10, sample_book());
        assert_eq!(m.push_diff(11, ask_diff(450, 5)), BookFeed::Ok);
        // Jump far past the window: data was lost.
        assert_eq!(m.push_diff(100, ask_diff(460, 5)), BookFeed::NeedsResync);
        assert!(m.is_broken());
        assert!(m.snapshot.is_none());

        // A fresh snapshot repairs the subscription.
        m.clear();
        m.push_snapshot(200, sample_book());
        assert!(!m.is_broken());
        assert_eq!(m.push_diff(201, ask_diff(450, 5)), BookFeed::Ok);
    }
}
