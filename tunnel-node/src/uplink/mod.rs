//! Uplink abstraction for the relay tunnel.
//!
//! The uplink is the single multiplexed connection between a node and the
//! relay. Every logical connection shares it; the relay forwards envelopes
//! by their `to` device id and gives no ordering or delivery guarantees
//! beyond per-frame atomicity.
//!
//! # Design
//!
//! - `connect()` establishes the connection and hands out the inbound queue
//! - `send()` transmits one envelope (writes are serialized)
//! - `close()` terminates and stops reconnecting
//! - `events()` reports connection state changes

mod mock;
mod websocket;

pub use mock::MockUplink;
pub use websocket::{WebSocketUplink, WebSocketUplinkOptions};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tunnel_types::{Envelope, WireError};

/// Uplink errors.
#[derive(Debug, Error)]
pub enum UplinkError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Write timeout.
    #[error("write timeout")]
    Timeout,

    /// Envelope could not be encoded.
    #[error("encoding failed: {0}")]
    Wire(#[from] WireError),
}

/// Connection state reported on the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkState {
    /// Connected to the relay.
    Connected,
    /// Not connected (connecting, reconnecting or closed).
    Disconnected,
    /// Reconnect attempts exhausted; the uplink stopped.
    GaveUp,
}

/// Uplink state change or notable condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkEvent {
    /// State after the event.
    pub state: UplinkState,
    /// Human-readable detail.
    pub detail: String,
}

impl UplinkEvent {
    /// Create an event.
    pub fn new(state: UplinkState, detail: impl Into<String>) -> Self {
        Self {
            state,
            detail: detail.into(),
        }
    }
}

/// Capacity of the event broadcast channel.
pub(crate) const EVENT_CAPACITY: usize = 64;

/// Uplink trait for exchanging envelopes with the relay.
///
/// Implementations handle the underlying connection mechanism
/// (WebSocket, in-memory mock).
#[async_trait]
pub trait Uplink: Send + Sync {
    /// Connect and return the queue of inbound envelopes.
    ///
    /// The queue ends when the uplink is closed or gives up.
    async fn connect(&self) -> Result<mpsc::Receiver<Envelope>, UplinkError>;

    /// Send one envelope to the relay.
    async fn send(&self, envelope: &Envelope) -> Result<(), UplinkError>;

    /// Close the connection and stop reconnecting.
    async fn close(&self) -> Result<(), UplinkError>;

    /// Subscribe to connection events.
    fn events(&self) -> broadcast::Receiver<UplinkEvent>;
}
