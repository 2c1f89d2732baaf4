//! # tunnel-types
//!
//! Wire format types for the relay tunnel protocol.
//!
//! This crate provides the foundational types shared by every tunnel crate:
//! - [`DeviceId`], [`ConnectionId`] - Identity types
//! - [`Envelope`], [`Header`], [`MessageType`] - The unit exchanged over the uplink
//! - [`BridgeOptions`], [`ConnectionOpen`], [`DataMessage`], ... - Sub-messages carried in the payload
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod messages;

pub use envelope::{Envelope, Header, MessageType};
pub use error::WireError;
pub use ids::{ConnectionId, DeviceId};
pub use messages::{
    BridgeOptions, ConnectionAccept, ConnectionFailed, ConnectionOpen, DataAck, DataMessage,
    WireMessage,
};
