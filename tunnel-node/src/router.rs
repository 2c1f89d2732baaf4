//! Router - single consumer of the uplink's inbound stream.
//!
//! Dispatches envelopes to the adapter registered for their connection id.
//! An Open for an unknown id becomes a [`ConnectionRequest`] for the
//! controller; anything else for an unknown id is answered with NotFound.

use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tunnel_types::{ConnectionId, ConnectionOpen, Envelope, Header, MessageType, WireMessage};

use crate::adapter::ConnectionAdapter;
use crate::uplink::Uplink;

/// An adapter shared between the router and the controller.
pub type SharedAdapter = Arc<tokio::sync::Mutex<ConnectionAdapter>>;

/// A peer asked to open a connection we do not know yet.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    /// Header of the Open (from = peer, to = us).
    pub header: Header,
    /// Decoded Open.
    pub open: ConnectionOpen,
}

/// Routes inbound envelopes to connection adapters.
pub struct Router {
    uplink: Arc<dyn Uplink>,
    connections: Mutex<HashMap<ConnectionId, SharedAdapter>>,
    requests: mpsc::Sender<ConnectionRequest>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("connections", &self.len())
            .finish()
    }
}

impl Router {
    /// Create a router answering on `uplink` and reporting Opens on `requests`.
    pub fn new(uplink: Arc<dyn Uplink>, requests: mpsc::Sender<ConnectionRequest>) -> Self {
        Self {
            uplink,
            connections: Mutex::new(HashMap::new()),
            requests,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, SharedAdapter>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an adapter. Returns false if the id is taken.
    pub fn add_connection(&self, connection_id: ConnectionId, adapter: SharedAdapter) -> bool {
        let mut connections = self.lock();
        if connections.contains_key(&connection_id) {
            return false;
        }
        connections.insert(connection_id, adapter);
        true
    }

    /// Unregister an adapter.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> Option<SharedAdapter> {
        self.lock().remove(connection_id)
    }

    /// Look up an adapter.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<SharedAdapter> {
        self.lock().get(connection_id).cloned()
    }

    /// Check if an id is registered.
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.lock().contains_key(connection_id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Unregister every adapter.
    pub fn drain(&self) -> Vec<SharedAdapter> {
        self.lock().drain().map(|(_, adapter)| adapter).collect()
    }

    /// Route one envelope.
    pub async fn route(&self, envelope: Envelope) {
        if let Some(adapter) = self.get(envelope.connection_id()) {
            adapter.lock().await.handle_message(envelope).await;
            return;
        }

        match envelope.msg_type() {
            MessageType::Open => match ConnectionOpen::from_bytes(&envelope.payload) {
                Ok(open) => {
                    info!(
                        connection_id = %envelope.connection_id(),
                        peer = %envelope.header.from,
                        url_remote = %open.bridge_options.url_remote,
                        "Connection requested"
                    );
                    let request = ConnectionRequest {
                        header: envelope.header,
                        open,
                    };
                    if self.requests.send(request).await.is_err() {
                        warn!("Connection request dropped, controller is gone");
                    }
                }
                Err(e) => {
                    warn!(connection_id = %envelope.connection_id(), error = %e, "Malformed open");
                }
            },
            MessageType::NotFound => {
                debug!(connection_id = %envelope.connection_id(), "NotFound for unknown connection");
            }
            msg_type => {
                debug!(
                    connection_id = %envelope.connection_id(),
                    %msg_type,
                    "Unknown connection, replying NotFound"
                );
                let reply = Envelope::control(envelope.header.reply(MessageType::NotFound));
                if let Err(e) = self.uplink.send(&reply).await {
                    warn!(connection_id = %envelope.connection_id(), error = %e, "NotFound not sent");
                }
            }
        }
    }

    /// Route until the inbound stream ends.
    ///
    /// A panic while routing one envelope is logged and the loop goes on.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Envelope>) {
        info!("Router started");
        while let Some(envelope) = inbound.recv().await {
            let connection_id = envelope.connection_id().clone();
            let msg_type = envelope.msg_type();
            if AssertUnwindSafe(self.route(envelope))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(%connection_id, %msg_type, "Panic while routing envelope");
            }
        }
        info!("Uplink inbound stream ended, router stopped");
    }
}
