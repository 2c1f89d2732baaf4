//! # tunnel-core
//!
//! Pure transport logic for the relay tunnel (no I/O, instant tests).
//!
//! This crate implements the algorithms that turn an unordered, lossy
//! envelope channel into an ordered byte stream, without any network
//! or timer I/O of its own.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - time is passed in as an
//! [`Instant`](std::time::Instant) argument and nothing blocks. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//!
//! The actual I/O (sockets, uplink, tickers) is performed by `tunnel-node`,
//! which wraps these structures in its async forwarder.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod reassembly;
pub mod rto_queue;
pub mod rtt;
pub mod window;

pub use backoff::ReconnectPolicy;
pub use reassembly::{ReassemblyBuffer, ReassemblyError, ReassemblyOptions};
pub use rto_queue::{InFlightItem, RtoQueue, SchedulerError};
pub use rtt::{RttEstimator, RttHistogram, RttOptions};
pub use window::{AckOutcome, WindowError, WindowItem, WindowLedger};
