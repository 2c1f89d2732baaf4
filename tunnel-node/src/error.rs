//! Error types for tunnel-node.

use tunnel_core::{ReassemblyError, SchedulerError, WindowError};
use tunnel_types::{ConnectionId, MessageType, WireError};

use crate::crypto::CryptoError;
use crate::uplink::UplinkError;

/// Errors raised while driving one logical connection.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The handshake could not be completed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A message arrived that the current state does not accept.
    #[error("protocol error: unexpected {msg_type} in state {state}")]
    UnexpectedMessage {
        /// Type of the offending message.
        msg_type: MessageType,
        /// Adapter state at the time.
        state: &'static str,
    },

    /// Another adapter is already registered under this id.
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// Encoding or decoding failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Encryption, decryption or key agreement failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The uplink rejected a send.
    #[error("uplink error: {0}")]
    Uplink(#[from] UplinkError),

    /// Retransmission scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Flow window error.
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// Reassembly error.
    #[error("reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),
}

/// Result type alias for adapter operations.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;
