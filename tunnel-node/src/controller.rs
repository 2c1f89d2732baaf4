//! Controller - admits connections and reacts to adapter events.
//!
//! Inbound: a [`ConnectionRequest`] from the router gets an inbound adapter,
//! which is registered once its start (dial + key agreement) succeeded.
//! Outbound: [`Controller::open_outbound`] registers a fresh adapter for a
//! local socket before starting it. A Closed or Error event unregisters the
//! adapter and stops it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnel_types::{ConnectionId, DeviceId};

use crate::adapter::{AdapterContext, AdapterEvent, AdapterEventKind, ConnectionAdapter};
use crate::config::ConnectionSettings;
use crate::error::{AdapterError, AdapterResult};
use crate::router::{ConnectionRequest, Router, SharedAdapter};
use crate::socket::LocalStream;
use crate::uplink::Uplink;

/// Owns connection admission and teardown for one node.
pub struct Controller {
    local: DeviceId,
    uplink: Arc<dyn Uplink>,
    router: Arc<Router>,
    settings: ConnectionSettings,
    events: mpsc::Sender<AdapterEvent>,
    /// Inbound ids whose adapter is still starting.
    pending: Mutex<HashSet<ConnectionId>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("local", &self.local)
            .field("router", &self.router)
            .finish()
    }
}

impl Controller {
    /// Create a controller; adapters report on `events`.
    pub fn new(
        local: DeviceId,
        uplink: Arc<dyn Uplink>,
        router: Arc<Router>,
        settings: ConnectionSettings,
        events: mpsc::Sender<AdapterEvent>,
    ) -> Self {
        Self {
            local,
            uplink,
            router,
            settings,
            events,
            pending: Mutex::new(HashSet::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<ConnectionId>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self, connection_id: ConnectionId, local: DeviceId, peer: DeviceId) -> AdapterContext {
        AdapterContext {
            connection_id,
            local,
            peer,
            uplink: Arc::clone(&self.uplink),
            settings: self.settings.clone(),
            events: self.events.clone(),
        }
    }

    /// The router this controller registers adapters with.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Admit a peer's Open.
    ///
    /// Repeated Opens that arrive while the first one is still dialing are
    /// ignored.
    pub async fn handle_request(&self, request: ConnectionRequest) {
        let connection_id = request.header.connection_id.clone();
        if self.router.contains(&connection_id) || !self.pending().insert(connection_id.clone()) {
            debug!(%connection_id, "Ignoring open for connection in progress");
            return;
        }

        let ctx = self.context(connection_id.clone(), request.header.to, request.header.from);
        let mut adapter = ConnectionAdapter::inbound(ctx, request.open);
        match adapter.start().await {
            Ok(()) => {
                self.register_inbound(adapter).await;
            }
            Err(e) => {
                warn!(%connection_id, error = %e, "Inbound connection refused");
            }
        }
        self.pending().remove(&connection_id);
    }

    /// Register a started inbound adapter; on an id collision the adapter
    /// is dropped and the registered one kept.
    async fn register_inbound(&self, adapter: ConnectionAdapter) -> bool {
        let connection_id = adapter.connection_id().clone();
        let adapter: SharedAdapter = Arc::new(tokio::sync::Mutex::new(adapter));
        if self.router.add_connection(connection_id.clone(), Arc::clone(&adapter)) {
            return true;
        }
        warn!(%connection_id, "Connection id already registered, dropping inbound adapter");
        adapter.lock().await.abandon().await;
        false
    }

    /// Unregister and stop the adapter an event belongs to.
    pub async fn handle_event(&self, event: AdapterEvent) {
        match event.kind {
            AdapterEventKind::Closed => {
                info!(connection_id = %event.connection_id, reason = %event.message, "Connection closed");
            }
            AdapterEventKind::Error => {
                warn!(connection_id = %event.connection_id, reason = %event.message, "Connection failed");
            }
        }
        if let Some(adapter) = self.router.remove_connection(&event.connection_id) {
            // the adapter may be busy emitting this very event
            tokio::spawn(async move {
                adapter.lock().await.stop().await;
            });
        }
    }

    /// Tunnel a local socket to `url_remote` on `peer`.
    pub async fn open_outbound(
        &self,
        peer: DeviceId,
        url_remote: &str,
        socket: LocalStream,
    ) -> AdapterResult<ConnectionId> {
        self.open_outbound_as(ConnectionId::generate(), peer, url_remote, socket)
            .await
    }

    async fn open_outbound_as(
        &self,
        connection_id: ConnectionId,
        peer: DeviceId,
        url_remote: &str,
        socket: LocalStream,
    ) -> AdapterResult<ConnectionId> {
        let ctx = self.context(connection_id.clone(), self.local, peer);
        let adapter: SharedAdapter = Arc::new(tokio::sync::Mutex::new(ConnectionAdapter::outbound(
            ctx, socket, url_remote,
        )));

        // registered first so the Accept finds it
        if !self.router.add_connection(connection_id.clone(), Arc::clone(&adapter)) {
            adapter.lock().await.abandon().await;
            return Err(AdapterError::DuplicateConnection(connection_id));
        }
        let started = adapter.lock().await.start().await;
        if let Err(e) = started {
            self.router.remove_connection(&connection_id);
            return Err(e);
        }
        info!(%connection_id, %peer, url_remote, "Outbound connection opened");
        Ok(connection_id)
    }

    /// Stop every connection; each sends one Close.
    pub async fn shutdown(&self) {
        let adapters = self.router.drain();
        info!(count = adapters.len(), "Stopping connections");
        for adapter in adapters {
            adapter.lock().await.stop().await;
        }
    }

    /// Serve requests and events until the router goes away.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<ConnectionRequest>,
        mut events: mpsc::Receiver<AdapterEvent>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => {
                        let controller = Arc::clone(&self);
                        tokio::spawn(async move { controller.handle_request(request).await });
                    }
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
        debug!("Controller stopped");
    }
}
