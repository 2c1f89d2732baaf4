//! Flow-control window bookkeeping for one connection.
//!
//! The ledger is the synchronous half of the flow window: it accounts for
//! in-flight bytes, matches acknowledgements to outstanding segments and
//! measures round-trip times. Blocking producers until capacity frees up is
//! the job of the async wrapper in `tunnel-node`.
//!
//! Items are kept in send order. An ack locates its item by offset from the
//! oldest outstanding sequence number; acked items are evicted only from the
//! front, so capacity is reclaimed for the contiguous acked prefix.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Window errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    /// The acked sequence number is outside the outstanding range.
    #[error("message_not_in_window: seq {seq}")]
    NotInWindow {
        /// Sequence number of the ack.
        seq: u64,
    },

    /// The segment was acknowledged before.
    #[error("message_already_acked: seq {seq}")]
    AlreadyAcked {
        /// Sequence number of the ack.
        seq: u64,
    },

    /// A single segment is larger than the whole window.
    #[error("segment of {size} bytes exceeds window capacity {capacity}")]
    Oversized {
        /// Segment size in bytes.
        size: usize,
        /// Window capacity in bytes.
        capacity: usize,
    },

    /// Segments must be added in sequence order without gaps.
    #[error("unexpected seq {seq}, expected {expected}")]
    OutOfSequence {
        /// Offered sequence number.
        seq: u64,
        /// Next sequence number the window accepts.
        expected: u64,
    },

    /// Not enough free capacity right now.
    #[error("window full: {occupied}/{capacity} bytes in flight")]
    Full {
        /// Bytes currently in flight.
        occupied: usize,
        /// Window capacity in bytes.
        capacity: usize,
    },

    /// The connection was torn down.
    #[error("window closed")]
    Closed,
}

impl WindowError {
    /// Duplicate and late acks are expected on a lossy path.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            WindowError::NotInWindow { .. } | WindowError::AlreadyAcked { .. }
        )
    }
}

/// One in-flight segment as seen by the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowItem {
    /// Sequence number.
    pub seq: u64,
    /// Accounted size in bytes.
    pub size: usize,
    /// First transmission time.
    pub sent_at: Instant,
    /// Acknowledged by the peer.
    pub acked: bool,
    /// RTT of this item is not trustworthy.
    pub retransmitted: bool,
}

/// Result of a successful ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// Time between first transmission and the ack.
    pub rtt: Duration,
    /// Whether `rtt` may be fed to the estimator.
    pub reliable: bool,
    /// Bytes returned to the window by evicting the acked prefix.
    pub released: usize,
}

/// Byte-bounded ledger of unacknowledged segments.
#[derive(Debug)]
pub struct WindowLedger {
    capacity: usize,
    occupied: usize,
    items: VecDeque<WindowItem>,
    next_seq: Option<u64>,
}

impl WindowLedger {
    /// Create an empty ledger with the given byte capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            occupied: 0,
            items: VecDeque::new(),
            next_seq: None,
        }
    }

    /// Check whether `size` more bytes fit right now.
    pub fn fits(&self, size: usize) -> bool {
        self.occupied + size <= self.capacity
    }

    /// Record a sent segment.
    ///
    /// Fails with [`WindowError::Full`] when the bytes do not fit; callers
    /// that want to wait retry after the next ack.
    pub fn try_add(&mut self, seq: u64, size: usize, now: Instant) -> Result<(), WindowError> {
        if size > self.capacity {
            return Err(WindowError::Oversized {
                size,
                capacity: self.capacity,
            });
        }
        if let Some(expected) = self.next_seq {
            if seq != expected {
                return Err(WindowError::OutOfSequence { seq, expected });
            }
        }
        if !self.fits(size) {
            return Err(WindowError::Full {
                occupied: self.occupied,
                capacity: self.capacity,
            });
        }

        self.items.push_back(WindowItem {
            seq,
            size,
            sent_at: now,
            acked: false,
            retransmitted: false,
        });
        self.occupied += size;
        self.next_seq = Some(seq + 1);
        Ok(())
    }

    /// Acknowledge one segment.
    ///
    /// When `retransmitted` is set, every later outstanding item is marked
    /// unreliable: its ack may have been triggered by the retransmission.
    pub fn ack(
        &mut self,
        seq: u64,
        retransmitted: bool,
        now: Instant,
    ) -> Result<AckOutcome, WindowError> {
        let first = match self.items.front() {
            Some(item) => item.seq,
            None => return Err(WindowError::NotInWindow { seq }),
        };
        if seq < first || seq - first >= self.items.len() as u64 {
            return Err(WindowError::NotInWindow { seq });
        }
        let index = (seq - first) as usize;

        let item = &mut self.items[index];
        if item.acked {
            return Err(WindowError::AlreadyAcked { seq });
        }
        item.acked = true;
        let rtt = now.saturating_duration_since(item.sent_at);
        let reliable = !retransmitted && !item.retransmitted;
        if retransmitted {
            item.retransmitted = true;
            for later in self.items.iter_mut().skip(index + 1) {
                later.retransmitted = true;
            }
        }

        let mut released = 0;
        while let Some(front) = self.items.front() {
            if !front.acked {
                break;
            }
            released += front.size;
            self.items.pop_front();
        }
        self.occupied -= released;

        Ok(AckOutcome {
            rtt,
            reliable,
            released,
        })
    }

    /// Change the capacity. Items already in flight stay accounted.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently in flight (including acked items behind a gap).
    pub fn occupancy(&self) -> usize {
        self.occupied
    }

    /// Number of tracked items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up an outstanding item.
    pub fn get(&self, seq: u64) -> Option<&WindowItem> {
        let first = self.items.front()?.seq;
        let index = seq.checked_sub(first)?;
        self.items.get(usize::try_from(index).ok()?)
    }

    /// Forget all items.
    pub fn clear(&mut self) {
        self.items.clear();
        self.occupied = 0;
    }
}
