//! Error types for the tunnel wire format.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Unknown message type code
    #[error("invalid message type: {0}")]
    InvalidMessageType(String),

    /// Malformed identifier
    #[error("invalid id: {0}")]
    InvalidId(String),
}
