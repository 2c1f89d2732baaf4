//! Mock uplink for testing.
//!
//! Records sent envelopes and allows injecting inbound ones. Two mocks can
//! be linked back to back, each delivering what it sends into the other's
//! inbound queue, which stands in for a relay between two nodes.

use super::{Uplink, UplinkError, UplinkEvent, UplinkState, EVENT_CAPACITY};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc};
use tunnel_types::{Envelope, MessageType};

const QUEUE_SIZE: usize = 1024;

/// Mock uplink for testing.
#[derive(Debug)]
pub struct MockUplink {
    inner: Arc<Mutex<MockUplinkInner>>,
    events: broadcast::Sender<UplinkEvent>,
}

#[derive(Debug, Default)]
struct MockUplinkInner {
    connected: bool,
    sent: Vec<Envelope>,
    inbound: Option<mpsc::Sender<Envelope>>,
    peer: Option<Weak<Mutex<MockUplinkInner>>>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
    panic_next_send: bool,
    drop_next: Vec<MessageType>,
}

fn lock(inner: &Mutex<MockUplinkInner>) -> MutexGuard<'_, MockUplinkInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MockUplink {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MockUplink {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
        }
    }
}

impl MockUplink {
    /// Create a new, unlinked mock uplink.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(MockUplinkInner::default())),
            events,
        }
    }

    /// Two mocks wired to each other.
    pub fn linked_pair() -> (Self, Self) {
        let a = Self::new();
        let b = Self::new();
        lock(&a.inner).peer = Some(Arc::downgrade(&b.inner));
        lock(&b.inner).peer = Some(Arc::downgrade(&a.inner));
        (a, b)
    }

    /// Deliver an envelope into this uplink's inbound queue.
    ///
    /// Returns false if not connected or the queue is full.
    pub fn inject(&self, envelope: Envelope) -> bool {
        let inner = lock(&self.inner);
        match &inner.inbound {
            Some(tx) => tx.try_send(envelope).is_ok(),
            None => false,
        }
    }

    /// Get all envelopes that were sent.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        lock(&self.inner).sent.clone()
    }

    /// Get sent envelopes of one message type.
    pub fn sent_of_type(&self, msg_type: MessageType) -> Vec<Envelope> {
        lock(&self.inner)
            .sent
            .iter()
            .filter(|e| e.msg_type() == msg_type)
            .cloned()
            .collect()
    }

    /// Get the last envelope that was sent.
    pub fn last_sent(&self) -> Option<Envelope> {
        lock(&self.inner).sent.last().cloned()
    }

    /// Forget recorded envelopes.
    pub fn clear_sent(&self) {
        lock(&self.inner).sent.clear();
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        lock(&self.inner).fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        lock(&self.inner).fail_next_send = Some(error.to_string());
    }

    /// Cause the next send() to panic.
    pub fn panic_next_send(&self) {
        lock(&self.inner).panic_next_send = true;
    }

    /// Record but do not deliver the next sent envelope of this type.
    pub fn drop_next(&self, msg_type: MessageType) {
        lock(&self.inner).drop_next.push(msg_type);
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }
}

#[async_trait]
impl Uplink for MockUplink {
    async fn connect(&self) -> Result<mpsc::Receiver<Envelope>, UplinkError> {
        let mut inner = lock(&self.inner);

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(UplinkError::ConnectionFailed(error));
        }

        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        inner.inbound = Some(tx);
        inner.connected = true;
        drop(inner);

        let _ = self
            .events
            .send(UplinkEvent::new(UplinkState::Connected, "mock connected"));
        Ok(rx)
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), UplinkError> {
        let mut inner = lock(&self.inner);

        if !inner.connected {
            return Err(UplinkError::NotConnected);
        }
        if std::mem::take(&mut inner.panic_next_send) {
            drop(inner);
            panic!("mock uplink: forced panic on send");
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(UplinkError::SendFailed(error));
        }

        inner.sent.push(envelope.clone());

        if let Some(pos) = inner.drop_next.iter().position(|t| *t == envelope.msg_type()) {
            inner.drop_next.remove(pos);
            return Ok(());
        }

        let peer = inner.peer.as_ref().and_then(Weak::upgrade);
        drop(inner);
        if let Some(peer) = peer {
            if let Some(tx) = &lock(&peer).inbound {
                // lossy like the relay: a full or closed queue drops
                let _ = tx.try_send(envelope.clone());
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), UplinkError> {
        let mut inner = lock(&self.inner);
        inner.connected = false;
        inner.inbound = None;
        drop(inner);

        let _ = self
            .events
            .send(UplinkEvent::new(UplinkState::Disconnected, "mock closed"));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<UplinkEvent> {
        self.events.subscribe()
    }
}
