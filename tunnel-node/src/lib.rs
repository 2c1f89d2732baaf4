//! # tunnel-node
//!
//! Relay tunnel node: carries local TCP/UDP streams to services on peer
//! devices through a relay that only forwards opaque envelopes.
//!
//! ## Architecture
//!
//! ```text
//!  local client ──► ServiceListener ──► Controller::open_outbound
//!                                              │
//!                                     ConnectionAdapter (per connection)
//!                                              │ Forwarder
//!                                              ▼
//!                      ┌──────────── Uplink (WebSocket) ◄──── relay
//!                      ▼
//!                   Router ──unknown CO──► Controller ──► inbound adapter ──► dial service
//! ```
//!
//! Reliability (sequencing, acks, retransmission, flow control) lives in the
//! endpoints; the relay gives no ordering or delivery guarantees.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod error;
pub mod forwarder;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod socket;
pub mod uplink;
pub mod window;

pub use adapter::{AdapterContext, AdapterEvent, AdapterEventKind, ConnectionAdapter};
pub use config::{Config, ConfigError, ConnectionSettings, ServiceConfig};
pub use controller::Controller;
pub use crypto::{CryptoError, SessionCipher};
pub use error::{AdapterError, AdapterResult};
pub use router::{ConnectionRequest, Router};
pub use service::ServiceListener;
pub use socket::{dial, LocalStream};
pub use uplink::{
    MockUplink, Uplink, UplinkError, UplinkEvent, UplinkState, WebSocketUplink,
    WebSocketUplinkOptions,
};
