//! Async flow-control window.
//!
//! Wraps the [`WindowLedger`] and the connection's [`RttEstimator`] behind
//! one lock. Producers suspend in [`FlowWindow::add`] until an ack frees
//! enough capacity; teardown wakes them with [`WindowError::Closed`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tunnel_core::{AckOutcome, RttEstimator, RttOptions, WindowError, WindowLedger};
use tunnel_types::DataAck;

#[derive(Debug)]
struct WindowState {
    ledger: WindowLedger,
    rtt: RttEstimator,
    closed: bool,
}

/// Byte-bounded window of unacknowledged segments for one connection.
#[derive(Debug)]
pub struct FlowWindow {
    state: Mutex<WindowState>,
    notify: Notify,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl FlowWindow {
    /// Create a window of `capacity` bytes.
    pub fn new(capacity: usize, rtt: RttOptions) -> Self {
        Self {
            state: Mutex::new(WindowState {
                ledger: WindowLedger::new(capacity),
                rtt: RttEstimator::new(rtt),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account for a segment about to be sent, waiting for capacity.
    pub async fn add(&self, seq: u64, size: usize) -> Result<(), WindowError> {
        loop {
            // registered before the check so an ack in between is not missed
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(WindowError::Closed);
                }
                match state.ledger.try_add(seq, size, now()) {
                    Ok(()) => return Ok(()),
                    Err(WindowError::Full { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            notified.await;
        }
    }

    /// Apply an acknowledgement and feed reliable RTT samples.
    pub fn ack(&self, ack: DataAck) -> Result<AckOutcome, WindowError> {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return Err(WindowError::Closed);
            }
            let outcome = state.ledger.ack(ack.seq, ack.re, now())?;
            if outcome.reliable {
                state.rtt.update(outcome.rtt);
            }
            outcome
        };
        if outcome.released > 0 {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// Change the capacity and re-check waiting producers.
    pub fn set_capacity(&self, capacity: usize) {
        self.lock().ledger.set_capacity(capacity);
        self.notify.notify_waiters();
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.lock().ledger.capacity()
    }

    /// Bytes currently in flight.
    pub fn occupancy(&self) -> usize {
        self.lock().ledger.occupancy()
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.lock().rtt.rto()
    }

    /// Smoothed RTT, if measured.
    pub fn srtt(&self) -> Option<Duration> {
        self.lock().rtt.srtt()
    }

    /// Tear down: forget in-flight items and wake every waiter.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.ledger.clear();
        }
        self.notify.notify_waiters();
    }

    /// Check if the window was closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
