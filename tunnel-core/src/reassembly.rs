//! Reassembly buffer for inbound data segments.
//!
//! Segments arrive in any order. The buffer keeps a cursor (`next_expected`)
//! and a bounded min-heap of segments that arrived early:
//! - the expected segment is released together with every buffered segment
//!   that continues the run without a gap
//! - segments below the cursor are stale
//! - early segments are buffered, bounded by queue size and by distance
//!   from the cursor
//!
//! The forwarder writes every released segment to the local socket in the
//! order returned, which gives in-order, gap-free delivery.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use thiserror::Error;
use tunnel_types::DataMessage;

/// Limits for the reassembly buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyOptions {
    /// Maximum number of early segments held at once.
    pub max_queue_size: usize,
    /// Maximum distance between the cursor and a buffered sequence number.
    pub max_queue_gap: u64,
}

impl Default for ReassemblyOptions {
    fn default() -> Self {
        Self {
            max_queue_size: 4096,
            max_queue_gap: 4096,
        }
    }
}

/// Reasons a segment is not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    /// The segment is below the cursor; it was delivered before.
    #[error("old_message: seq {seq} < next expected {next_expected}")]
    OldMessage {
        /// Sequence number of the rejected segment.
        seq: u64,
        /// Cursor at the time of rejection.
        next_expected: u64,
    },

    /// The buffer already holds `max_queue_size` early segments.
    #[error("queue_full: {capacity} segments buffered")]
    QueueFull {
        /// Configured queue size.
        capacity: usize,
    },

    /// The segment is too far ahead of the cursor.
    #[error("gap_too_large: seq {seq} is {gap} ahead of the cursor (max {max_gap})")]
    GapTooLarge {
        /// Sequence number of the rejected segment.
        seq: u64,
        /// Distance from the cursor.
        gap: u64,
        /// Configured maximum gap.
        max_gap: u64,
    },
}

impl ReassemblyError {
    /// Stale data is discarded, everything else means the peer or the
    /// path is misbehaving.
    pub fn is_stale(&self) -> bool {
        matches!(self, ReassemblyError::OldMessage { .. })
    }
}

/// Heap entry ordered by sequence number only.
#[derive(Debug)]
struct Pending(DataMessage);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.seq.cmp(&other.0.seq)
    }
}

/// Bounded out-of-order buffer with a delivery cursor.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    options: ReassemblyOptions,
    next_expected: u64,
    heap: BinaryHeap<Reverse<Pending>>,
    buffered: HashSet<u64>,
}

impl ReassemblyBuffer {
    /// Create an empty buffer expecting sequence number 0.
    pub fn new(options: ReassemblyOptions) -> Self {
        Self {
            options,
            next_expected: 0,
            heap: BinaryHeap::new(),
            buffered: HashSet::new(),
        }
    }

    /// Offer a segment to the buffer.
    ///
    /// Returns the run of segments that can now be delivered, starting with
    /// `segment` itself when it was the expected one. An empty run means
    /// the segment was buffered (or was a duplicate of a buffered one).
    pub fn test(&mut self, segment: DataMessage) -> Result<Vec<DataMessage>, ReassemblyError> {
        let seq = segment.seq;

        if seq < self.next_expected {
            return Err(ReassemblyError::OldMessage {
                seq,
                next_expected: self.next_expected,
            });
        }

        if seq == self.next_expected {
            self.next_expected += 1;
            let mut run = vec![segment];
            while let Some(Reverse(Pending(top))) = self.heap.peek() {
                if top.seq != self.next_expected {
                    break;
                }
                if let Some(Reverse(Pending(next))) = self.heap.pop() {
                    self.buffered.remove(&next.seq);
                    self.next_expected += 1;
                    run.push(next);
                }
            }
            return Ok(run);
        }

        if self.buffered.contains(&seq) {
            return Ok(Vec::new());
        }
        if self.heap.len() >= self.options.max_queue_size {
            return Err(ReassemblyError::QueueFull {
                capacity: self.options.max_queue_size,
            });
        }
        let gap = seq - self.next_expected;
        if gap > self.options.max_queue_gap {
            return Err(ReassemblyError::GapTooLarge {
                seq,
                gap,
                max_gap: self.options.max_queue_gap,
            });
        }

        self.buffered.insert(seq);
        self.heap.push(Reverse(Pending(segment)));
        Ok(Vec::new())
    }

    /// The next sequence number that will be delivered.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Number of early segments currently buffered.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if no early segments are buffered.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop all buffered segments.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.buffered.clear();
    }
}
