//! Reorder buffer for sequence-numbered channel events.
//!
//! The exchange stamps every public channel frame with a per-channel
//! monotone sequence number. Frames can arrive out of order; this buffer
//! releases them in sequence, drops duplicates of already-released
//! numbers, and reports when numbers were lost so the caller can resync.

use thiserror::Error;
use tracing::warn;

/// Errors surfaced by the reorder buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeqError {
    /// Two distinct frames claimed the same in-window sequence number.
    /// The feed is inconsistent; the subscription must be rebuilt.
    #[error("duplicate sequence number {0} inside the reorder window")]
    Collision(u64),
}

/// Events released by one [`SeqBuffer::push`] call, in sequence order.
#[derive(Debug)]
pub struct Drained<T> {
    pub ready: Vec<T>,
    /// True when sequence numbers were skipped; the stream has holes and
    /// the caller should request a fresh snapshot.
    pub gap: bool,
}

impl<T> Drained<T> {
    fn empty() -> Self {
        Self {
            ready: Vec::new(),
            gap: false,
        }
    }
}

/// Fixed-window reorder buffer.
///
/// Uninitialized until the first push; the first event after creation or
/// [`clear`](Self::clear) defines the stream position and is released
/// immediately.
#[derive(Debug)]
pub struct SeqBuffer<T> {
    /// Next expected sequence number; `None` until the first event.
    next: Option<u64>,
    /// Ring of out-of-order events, indexed relative to `next`.
    slots: Vec<Option<T>>,
    /// Ring index corresponding to `next`.
    head: usize,
}

impl<T> SeqBuffer<T> {
    /// Window size: events further ahead force the window forward.
    pub const CAPACITY: usize = 30;

    pub fn new() -> Self {
        Self {
            next: None,
            slots: (0..Self::CAPACITY).map(|_| None).collect(),
            head: 0,
        }
    }

    /// Forget the stream position; the next event re-initializes it.
    pub fn clear(&mut self) {
        self.next = None;
        self.head = 0;
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Offer one event. Returns the events now releasable in order.
    pub fn push(&mut self, seq: u64, item: T) -> Result<Drained<T>, SeqError> {
        let expected = match self.next {
            Some(e) => e,
            None => {
                // First event defines the position and is in-order by definition.
                self.next = Some(seq + 1);
                return Ok(Drained {
                    ready: vec![item],
                    gap: false,
                });
            }
        };

        if seq < expected {
            warn!(seq, expected, "stale sequence number dropped");
            return Ok(Drained::empty());
        }

        if seq == expected {
            let mut ready = vec![item];
            self.advance();
            self.drain_contiguous(&mut ready);
            return Ok(Drained { ready, gap: false });
        }

        let offset = (seq - expected) as usize;
        if offset < Self::CAPACITY {
            let idx = (self.head + offset) % Self::CAPACITY;
            if self.slots[idx].is_some() {
                return Err(SeqError::Collision(seq));
            }
            self.slots[idx] = Some(item);
            return Ok(Drained::empty());
        }

        // Window overflow: everything below seq - CAPACITY + 1 is lost or
        // stuck; force out whatever arrived, slide the window, re-offer.
        let new_expected = seq - (Self::CAPACITY as u64 - 1);
        let mut ready = Vec::new();
        while self.next.unwrap_or(new_expected) < new_expected {
            if let Some(ev) = self.slots[self.head].take() {
                ready.push(ev);
            }
            self.advance();
        }
        let mut rec = self.push(seq, item)?;
        ready.append(&mut rec.ready);
        Ok(Drained { ready, gap: true })
    }

    fn advance(&mut self) {
        self.next = self.next.map(|e| e + 1);
        self.head = (self.head + 1) % Self::CAPACITY;
    }

    fn drain_contiguous(&mut self, ready: &mut Vec<T>) {
        while let Some(ev) = self.slots[self.head].take() {
            ready.push(ev);
            self.advance();
        }
    }
}

impl<T> Default for SeqBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
