//! Retransmission timeout queue for one connection.
//!
//! In-flight segments are stored by sequence number and indexed by a
//! min-heap on their deadline. Acked segments leave the map immediately
//! and their heap entries are skipped when they surface (lazy deletion).
//!
//! The async scheduler in `tunnel-node` calls [`RtoQueue::due`] on every
//! tick and re-sends whatever it returns.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use tunnel_types::DataMessage;

/// Scheduler errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Too many segments in flight.
    #[error("queue is full ({capacity} segments in flight)")]
    QueueFull {
        /// Configured maximum.
        capacity: usize,
    },

    /// The same sequence number was registered twice.
    #[error("seq {seq} is already scheduled")]
    Duplicate {
        /// Offending sequence number.
        seq: u64,
    },
}

/// A sent, unacknowledged segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightItem {
    /// The segment as it will be re-sent.
    pub segment: DataMessage,
    /// First transmission time.
    pub sent_at: Instant,
    /// Next retransmission time.
    pub deadline: Instant,
    /// Timeout applied on every (re)transmission.
    pub rto: Duration,
    /// Number of retransmissions so far.
    pub retransmissions: u32,
}

impl InFlightItem {
    /// Create an item for a segment sent at `now`.
    pub fn new(segment: DataMessage, now: Instant, rto: Duration) -> Self {
        Self {
            segment,
            sent_at: now,
            deadline: now + rto,
            rto,
            retransmissions: 0,
        }
    }

    /// Sequence number of the segment.
    pub fn seq(&self) -> u64 {
        self.segment.seq
    }

    /// Whether the segment was re-sent at least once.
    pub fn retransmitted(&self) -> bool {
        self.segment.re
    }
}

/// Deadline-ordered set of in-flight segments.
#[derive(Debug)]
pub struct RtoQueue {
    max_queue_size: usize,
    items: HashMap<u64, InFlightItem>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
}

impl RtoQueue {
    /// Create an empty queue holding at most `max_queue_size` segments.
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            items: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    /// Register a segment that is about to be sent.
    pub fn add(&mut self, item: InFlightItem) -> Result<(), SchedulerError> {
        if self.items.len() >= self.max_queue_size {
            return Err(SchedulerError::QueueFull {
                capacity: self.max_queue_size,
            });
        }
        let seq = item.seq();
        if self.items.contains_key(&seq) {
            return Err(SchedulerError::Duplicate { seq });
        }
        self.deadlines.push(Reverse((item.deadline, seq)));
        self.items.insert(seq, item);
        Ok(())
    }

    /// Remove an acknowledged segment. Returns it if it was still in flight.
    pub fn ack(&mut self, seq: u64) -> Option<InFlightItem> {
        self.items.remove(&seq)
    }

    /// Collect every segment whose deadline has passed.
    ///
    /// Each returned segment carries the retransmission flag and is
    /// rescheduled to `now + rto`.
    pub fn due(&mut self, now: Instant) -> Vec<DataMessage> {
        let mut resend = Vec::new();
        while let Some(Reverse((deadline, seq))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();

            let Some(item) = self.items.get_mut(&seq) else {
                // acked since it was scheduled
                continue;
            };
            if item.deadline != deadline {
                // superseded entry
                continue;
            }
            item.segment.re = true;
            item.retransmissions += 1;
            item.deadline = now + item.rto;
            self.deadlines.push(Reverse((item.deadline, seq)));
            resend.push(item.segment.clone());
        }
        resend
    }

    /// Earliest pending deadline, skipping acked entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq))) = self.deadlines.peek().copied() {
            match self.items.get(&seq) {
                Some(item) if item.deadline == deadline => return Some(deadline),
                _ => {
                    self.deadlines.pop();
                }
            }
        }
        None
    }

    /// Look up an in-flight segment.
    pub fn get(&self, seq: u64) -> Option<&InFlightItem> {
        self.items.get(&seq)
    }

    /// Number of segments in flight.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop everything (connection teardown).
    pub fn clear(&mut self) {
        self.items.clear();
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn item(seq: u64, now: Instant, rto: Duration) -> InFlightItem {
        InFlightItem::new(DataMessage::new(seq, vec![seq as u8]), now, rto)
    }

    #[test]
    fn nothing_is_due_before_deadline() {
        let t0 = Instant::now();
        let mut queue = RtoQueue::new(10);
        queue.add(item(0, t0, ms(100))).unwrap();

        assert!(queue.due(t0 + ms(99)).is_empty());
        assert_eq!(queue.next_deadline(), Some(t0 + ms(100)));
    }

    #[test]
    fn expired_segment_is_resent_with_flag_and_rescheduled() {
        let t0 = Instant::now();
        let mut queue = RtoQueue::new(10);
        queue.add(item(0, t0, ms(100))).unwrap();

        let resend = queue.due(t0 + ms(120));

        assert_eq!(resend.len(), 1);
        assert!(resend[0].re);
        assert_eq!(resend[0].seq, 0);
        let pending = queue.get(0).unwrap();
        assert_eq!(pending.deadline, t0 + ms(220));
        assert_eq!(pending.retransmissions, 1);
        assert!(pending.retransmitted());

        // not due again until the new deadline
        assert!(queue.due(t0 + ms(200)).is_empty());
        assert_eq!(queue.due(t0 + ms(220)).len(), 1);
    }

    #[test]
    fn due_segments_come_out_in_deadline_order() {
        let t0 = Instant::now();
        let mut queue = RtoQueue::new(10);
        queue.add(item(0, t0, ms(300))).unwrap();
        queue.add(item(1, t0, ms(100))).unwrap();
        queue.add(item(2, t0, ms(200))).unwrap();

        let resend: Vec<u64> = queue.due(t0 + ms(500)).iter().map(|m| m.seq).collect();

        assert_eq!(resend, vec![1, 2, 0]);
    }

    #[test]
    fn acked_segment_is_never_resent() {
        let t0 = Instant::now();
        let mut queue = RtoQueue::new(10);
        queue.add(item(0, t0, ms(50))).unwrap();
        queue.add(item(1, t0, ms(50))).unwrap();

        assert!(queue.ack(0).is_some());
        assert!(queue.ack(0).is_none());

        let resend = queue.due(t0 + ms(60));
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].seq, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn full_queue_rejects_new_segment() {
        let t0 = Instant::now();
        let mut queue = RtoQueue::new(2);
        queue.add(item(0, t0, ms(50))).unwrap();
        queue.add(item(1, t0, ms(50))).unwrap();

        let err = queue.add(item(2, t0, ms(50))).unwrap_err();

        assert_eq!(err, SchedulerError::QueueFull { capacity: 2 });
        assert_eq!(err.to_string(), "queue is full (2 segments in flight)");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let t0 = Instant::now();
        let mut queue = RtoQueue::new(4);
        queue.add(item(3, t0, ms(50))).unwrap();
        assert_eq!(
            queue.add(item(3, t0, ms(50))).unwrap_err(),
            SchedulerError::Duplicate { seq: 3 }
        );
    }

    #[test]
    fn next_deadline_skips_acked_entries() {
        let t0 = Instant::now();
        let mut queue = RtoQueue::new(4);
        queue.add(item(0, t0, ms(10))).unwrap();
        queue.add(item(1, t0, ms(30))).unwrap();
        queue.ack(0);

        assert_eq!(queue.next_deadline(), Some(t0 + ms(30)));
        queue.clear();
        assert_eq!(queue.next_deadline(), None);
    }
}
