//! Envelope - the unit exchanged over the uplink.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ConnectionId, DeviceId, WireError};

/// Message type tag carried in the plaintext header.
///
/// Encoded on the wire as its two-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Connection open request
    #[serde(rename = "CO")]
    Open,
    /// Connection accepted by the peer
    #[serde(rename = "CA")]
    Accept,
    /// Connection attempt failed on the peer
    #[serde(rename = "CF")]
    Failed,
    /// Connection closed
    #[serde(rename = "CC")]
    Close,
    /// Sequenced application data
    #[serde(rename = "D")]
    Data,
    /// Acknowledgement of one data segment
    #[serde(rename = "DA")]
    DataAck,
    /// Keep-alive confirm sent before traffic flows
    #[serde(rename = "CR")]
    Confirm,
    /// The addressed connection is unknown to the receiver
    #[serde(rename = "NF")]
    NotFound,
}

impl MessageType {
    /// All message types, in protocol order.
    pub const ALL: [MessageType; 8] = [
        MessageType::Open,
        MessageType::Accept,
        MessageType::Failed,
        MessageType::Close,
        MessageType::Data,
        MessageType::DataAck,
        MessageType::Confirm,
        MessageType::NotFound,
    ];

    /// The wire code of this message type.
    pub fn code(&self) -> &'static str {
        match self {
            MessageType::Open => "CO",
            MessageType::Accept => "CA",
            MessageType::Failed => "CF",
            MessageType::Close => "CC",
            MessageType::Data => "D",
            MessageType::DataAck => "DA",
            MessageType::Confirm => "CR",
            MessageType::NotFound => "NF",
        }
    }
}

impl TryFrom<&str> for MessageType {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.code() == value)
            .ok_or_else(|| WireError::InvalidMessageType(value.to_string()))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Plaintext routing header.
///
/// The relay routes on `to`; the endpoints route on `connection_id`.
/// Authenticated ciphers bind the header as associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Sending device
    pub from: DeviceId,
    /// Receiving device
    pub to: DeviceId,
    /// Message type tag
    pub msg_type: MessageType,
    /// Logical connection this message belongs to
    pub connection_id: ConnectionId,
}

impl Header {
    /// Create a header.
    pub fn new(
        from: DeviceId,
        to: DeviceId,
        msg_type: MessageType,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            from,
            to,
            msg_type,
            connection_id,
        }
    }

    /// The same header with a different message type.
    pub fn with_type(&self, msg_type: MessageType) -> Self {
        Self {
            msg_type,
            ..self.clone()
        }
    }

    /// Header for a reply travelling back to the sender of this one.
    pub fn reply(&self, msg_type: MessageType) -> Self {
        Self {
            from: self.to,
            to: self.from,
            msg_type,
            connection_id: self.connection_id.clone(),
        }
    }

    /// Serialize to MessagePack bytes (used as associated data).
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }
}

/// The envelope wraps every protocol message with routing metadata.
///
/// This is the outer layer that the relay sees. The payload is the
/// serialized (and for data traffic, encrypted) sub-message and is
/// opaque to the relay and to the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Plaintext header
    pub header: Header,
    /// Serialized sub-message
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Create an envelope without payload (Close, Confirm, NotFound).
    pub fn control(header: Header) -> Self {
        Self::new(header, Vec::new())
    }

    /// The message type from the header.
    pub fn msg_type(&self) -> MessageType {
        self.header.msg_type
    }

    /// The connection id from the header.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.header.connection_id
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}
