//! Retransmission scheduler.
//!
//! Shares one [`RtoQueue`] between the egress pump (register), the ack path
//! (remove) and a periodic scan task that re-sends expired segments.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use tunnel_core::{InFlightItem, RtoQueue, SchedulerError};
use tunnel_types::{ConnectionId, DataMessage};

use crate::forwarder::SegmentSender;

/// Deadline-ordered in-flight segments of one connection.
#[derive(Debug)]
pub struct RetransmitScheduler {
    queue: Mutex<RtoQueue>,
    tick: Duration,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl RetransmitScheduler {
    /// Create a scheduler scanning every `tick`.
    pub fn new(max_queue_size: usize, tick: Duration) -> Self {
        Self {
            queue: Mutex::new(RtoQueue::new(max_queue_size)),
            tick,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RtoQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a segment that is being sent now.
    pub fn register(&self, segment: DataMessage, rto: Duration) -> Result<(), SchedulerError> {
        self.lock().add(InFlightItem::new(segment, now(), rto))
    }

    /// Remove an acknowledged segment.
    pub fn ack(&self, seq: u64) -> bool {
        self.lock().ack(seq).is_some()
    }

    /// Segments whose deadline passed, flagged and rescheduled.
    pub fn due(&self) -> Vec<DataMessage> {
        self.lock().due(now())
    }

    /// Number of segments in flight.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every in-flight segment.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Scan interval.
    pub fn tick(&self) -> Duration {
        self.tick
    }
}

/// Periodically re-send expired segments until `stop` fires.
pub(crate) async fn run_scan(
    connection_id: ConnectionId,
    scheduler: Arc<RetransmitScheduler>,
    sender: Arc<SegmentSender>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(scheduler.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        for segment in scheduler.due() {
            debug!(%connection_id, seq = segment.seq, "Retransmitting segment");
            if let Err(e) = sender.send_data(&segment).await {
                warn!(%connection_id, seq = segment.seq, error = %e, "Retransmission failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlaintextCipher;
    use crate::uplink::{MockUplink, Uplink};
    use tunnel_types::{DeviceId, Header, MessageType, WireMessage};

    fn segment(seq: u64) -> DataMessage {
        DataMessage::new(seq, vec![seq as u8; 4])
    }

    #[tokio::test(start_paused = true)]
    async fn segment_is_due_after_its_rto() {
        let scheduler = RetransmitScheduler::new(16, Duration::from_millis(20));
        scheduler.register(segment(0), Duration::from_millis(100)).unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(scheduler.due().is_empty());

        tokio::time::advance(Duration::from_millis(60)).await;
        let due = scheduler.due();
        assert_eq!(due.len(), 1);
        assert!(due[0].re);
    }

    #[tokio::test(start_paused = true)]
    async fn acked_segment_is_not_due() {
        let scheduler = RetransmitScheduler::new(16, Duration::from_millis(20));
        scheduler.register(segment(0), Duration::from_millis(100)).unwrap();

        assert!(scheduler.ack(0));
        assert!(!scheduler.ack(0));
        tokio::time::advance(Duration::from_millis(200)).await;

        assert!(scheduler.due().is_empty());
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn full_scheduler_reports_queue_full() {
        let scheduler = RetransmitScheduler::new(1, Duration::from_millis(20));
        scheduler.register(segment(0), Duration::from_millis(100)).unwrap();

        let err = scheduler
            .register(segment(1), Duration::from_millis(100))
            .unwrap_err();

        assert!(err.to_string().starts_with("queue is full"));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_task_resends_with_retransmission_flag() {
        let uplink = MockUplink::new();
        let _rx = uplink.connect().await.unwrap();
        let cid = tunnel_types::ConnectionId::new("scan");
        let header = Header::new(
            DeviceId::random(),
            DeviceId::random(),
            MessageType::Data,
            cid.clone(),
        );
        let sender = Arc::new(SegmentSender::new(
            Arc::new(uplink.clone()),
            Arc::new(PlaintextCipher),
            header,
        ));
        let scheduler = Arc::new(RetransmitScheduler::new(16, Duration::from_millis(20)));
        scheduler.register(segment(0), Duration::from_millis(100)).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_scan(cid, Arc::clone(&scheduler), sender, stop_rx));

        tokio::time::sleep(Duration::from_millis(130)).await;
        stop_tx.send_replace(true);
        task.await.unwrap();

        let resent = uplink.sent_of_type(MessageType::Data);
        assert_eq!(resent.len(), 1);
        let decoded = DataMessage::from_bytes(&resent[0].payload).unwrap();
        assert_eq!(decoded.seq, 0);
        assert!(decoded.re);
    }
}
