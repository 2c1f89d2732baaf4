//! Protocol sub-messages for the relay tunnel.
//!
//! These are serialized into the [`Envelope`](crate::Envelope) payload.
//! Handshake messages travel in plaintext; data and acknowledgements are
//! encrypted by the session cipher before being wrapped.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::WireError;

/// MessagePack encoding shared by all sub-messages.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Serialize to MessagePack bytes.
    fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}

/// Handshake parameters exchanged when a connection is opened.
///
/// Immutable for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeOptions {
    /// Unix timestamp (milliseconds) of the open attempt - informational only
    pub timestamp: u64,
    /// Target service on the peer, `tcp://host:port` or `udp://host:port`
    pub url_remote: String,
    /// Throughput limit requested by the opener (0 = unlimited)
    pub rate_limit_bytes_per_second: u64,
    /// Flow-control window size in bytes
    pub ack_window_size: u64,
    /// Session cipher name
    pub cipher: String,
    /// Key agreement curve name
    pub curve: String,
}

impl BridgeOptions {
    /// Create bridge options stamped with the current time.
    pub fn new(url_remote: impl Into<String>, cipher: &str, curve: &str) -> Self {
        Self {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            url_remote: url_remote.into(),
            rate_limit_bytes_per_second: 0,
            ack_window_size: 0,
            cipher: cipher.to_string(),
            curve: curve.to_string(),
        }
    }
}

/// Open request (`CO`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOpen {
    /// Parameters of the requested bridge
    pub bridge_options: BridgeOptions,
    /// Ephemeral public connection key of the opener
    pub pc_key: String,
}

/// Accept response (`CA`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAccept {
    /// Ephemeral public connection key of the acceptor
    pub pc_key: String,
}

/// Failure response (`CF`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFailed {
    /// Human-readable reason, surfaced to the opener
    pub reason: String,
}

/// One sequenced chunk of application data (`D`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    /// Sequence number, contiguous from 0 per connection
    pub seq: u64,
    /// Set on retransmissions
    pub re: bool,
    /// Application bytes
    pub data: Vec<u8>,
}

impl DataMessage {
    /// Create a first-transmission segment.
    pub fn new(seq: u64, data: Vec<u8>) -> Self {
        Self {
            seq,
            re: false,
            data,
        }
    }
}

/// Acknowledgement of exactly one data segment (`DA`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAck {
    /// Sequence number being acknowledged
    pub seq: u64,
    /// Echo of the segment's retransmission flag
    pub re: bool,
}

impl WireMessage for BridgeOptions {}
impl WireMessage for ConnectionOpen {}
impl WireMessage for ConnectionAccept {}
impl WireMessage for ConnectionFailed {}
impl WireMessage for DataMessage {}
impl WireMessage for DataAck {}
