//! Connection adapter - the per-connection state machine.
//!
//! ```text
//! ConnectingOutbound ──CA──► Connected ──CC/NF──► Terminated
//!                    ──CF/CC/NF──────────────────►
//! ConnectingInbound  ──D/CR──► Connected
//!                    ──CO/CC/NF──────────────────►
//! ```
//!
//! Every state offers the same contract: `start`, `handle` returning a
//! [`Transition`], and `teardown`. After `Enter` the adapter starts the next
//! state and hands it the same envelope again, so the Data that completes an
//! inbound handshake is delivered too.

mod connected;
mod inbound;
mod outbound;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnel_types::{ConnectionId, ConnectionOpen, DeviceId, Envelope, Header, MessageType};

use crate::config::ConnectionSettings;
use crate::error::AdapterResult;
use crate::socket::LocalStream;
use crate::uplink::Uplink;

use connected::ConnectedState;
use inbound::InboundState;
use outbound::OutboundState;

/// What an adapter reports to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEventKind {
    /// The connection ended normally (peer close, local EOF, superseded).
    Closed,
    /// The connection ended because of an error.
    Error,
}

/// Lifecycle event of one connection.
#[derive(Debug, Clone)]
pub struct AdapterEvent {
    /// Connection the event belongs to.
    pub connection_id: ConnectionId,
    /// Closed or Error.
    pub kind: AdapterEventKind,
    /// Human-readable detail.
    pub message: String,
}

impl AdapterEvent {
    /// Create an event.
    pub fn new(
        connection_id: ConnectionId,
        kind: AdapterEventKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            connection_id,
            kind,
            message: message.into(),
        }
    }
}

/// Everything a state needs besides its own resources.
#[derive(Clone)]
pub struct AdapterContext {
    /// This connection.
    pub connection_id: ConnectionId,
    /// Local device.
    pub local: DeviceId,
    /// Peer device.
    pub peer: DeviceId,
    /// Shared uplink.
    pub uplink: Arc<dyn Uplink>,
    /// Node defaults for this connection.
    pub settings: ConnectionSettings,
    /// Controller event queue.
    pub events: mpsc::Sender<AdapterEvent>,
}

impl std::fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterContext")
            .field("connection_id", &self.connection_id)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

impl AdapterContext {
    /// Header from the local device to the peer.
    pub fn header(&self, msg_type: MessageType) -> Header {
        Header::new(self.local, self.peer, msg_type, self.connection_id.clone())
    }

    /// Report an event to the controller.
    pub async fn emit(&self, kind: AdapterEventKind, message: impl Into<String>) {
        let event = AdapterEvent::new(self.connection_id.clone(), kind, message);
        if self.events.send(event).await.is_err() {
            debug!(connection_id = %self.connection_id, "Adapter event dropped, controller is gone");
        }
    }

    /// Send an empty control envelope.
    pub async fn send_control(&self, msg_type: MessageType) -> AdapterResult<()> {
        self.uplink
            .send(&Envelope::control(self.header(msg_type)))
            .await?;
        Ok(())
    }
}

/// Resends one envelope on a fixed interval until stopped.
///
/// The first send happens on the first tick, right after spawning. With an
/// `until` flag the repeater also ends once the flag is set.
pub(crate) struct Repeater {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Repeater {
    pub(crate) fn spawn(
        uplink: Arc<dyn Uplink>,
        envelope: Envelope,
        every: Duration,
        until: Option<Arc<AtomicBool>>,
    ) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);
        let every = every.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                if until.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                    break;
                }
                if let Err(e) = uplink.send(&envelope).await {
                    warn!(
                        connection_id = %envelope.connection_id(),
                        msg_type = %envelope.msg_type(),
                        error = %e,
                        "Resend failed"
                    );
                }
            }
        });
        Self { stop, task }
    }

    pub(crate) fn stop(&self) {
        self.stop.send_replace(true);
        self.task.abort();
    }
}

impl Drop for Repeater {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Result of handling one envelope.
pub(crate) enum Transition {
    Stay,
    Enter(AdapterState),
    Terminate,
}

pub(crate) enum AdapterState {
    ConnectingOutbound(OutboundState),
    ConnectingInbound(InboundState),
    Connected(ConnectedState),
}

impl AdapterState {
    fn name(&self) -> &'static str {
        match self {
            AdapterState::ConnectingOutbound(_) => outbound::STATE_NAME,
            AdapterState::ConnectingInbound(_) => inbound::STATE_NAME,
            AdapterState::Connected(_) => connected::STATE_NAME,
        }
    }

    async fn start(&mut self, ctx: &AdapterContext) -> AdapterResult<()> {
        match self {
            AdapterState::ConnectingOutbound(s) => s.start(ctx).await,
            AdapterState::ConnectingInbound(s) => s.start(ctx).await,
            AdapterState::Connected(s) => s.start(ctx),
        }
    }

    async fn handle(&mut self, ctx: &AdapterContext, envelope: &Envelope) -> AdapterResult<Transition> {
        match self {
            AdapterState::ConnectingOutbound(s) => s.handle(ctx, envelope).await,
            AdapterState::ConnectingInbound(s) => s.handle(ctx, envelope).await,
            AdapterState::Connected(s) => s.handle(ctx, envelope).await,
        }
    }

    async fn teardown(&mut self) {
        match self {
            AdapterState::ConnectingOutbound(s) => s.teardown().await,
            AdapterState::ConnectingInbound(s) => s.teardown().await,
            AdapterState::Connected(s) => s.teardown().await,
        }
    }

    /// Local shutdown: one best-effort Close, then teardown.
    async fn stop(&mut self, ctx: &AdapterContext) {
        if let Err(e) = ctx.send_control(MessageType::Close).await {
            debug!(connection_id = %ctx.connection_id, error = %e, "Close not sent");
        }
        self.teardown().await;
    }
}

/// Drives one logical connection through its states.
pub struct ConnectionAdapter {
    ctx: AdapterContext,
    state: Option<AdapterState>,
}

impl std::fmt::Debug for ConnectionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAdapter")
            .field("connection_id", &self.ctx.connection_id)
            .field("state", &self.state_name())
            .finish()
    }
}

impl ConnectionAdapter {
    /// Adapter for a connection opened locally on `socket`.
    pub fn outbound(ctx: AdapterContext, socket: LocalStream, url_remote: impl Into<String>) -> Self {
        Self {
            ctx,
            state: Some(AdapterState::ConnectingOutbound(OutboundState::new(
                socket,
                url_remote.into(),
            ))),
        }
    }

    /// Adapter answering a peer's Open.
    pub fn inbound(ctx: AdapterContext, open: ConnectionOpen) -> Self {
        Self {
            ctx,
            state: Some(AdapterState::ConnectingInbound(InboundState::new(open))),
        }
    }

    /// Start the initial state. A failed start terminates the adapter.
    pub async fn start(&mut self) -> AdapterResult<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        if let Err(e) = state.start(&self.ctx).await {
            warn!(connection_id = %self.ctx.connection_id, state = state.name(), error = %e, "Adapter start failed");
            state.teardown().await;
            self.state = None;
            return Err(e);
        }
        info!(
            connection_id = %self.ctx.connection_id,
            peer = %self.ctx.peer,
            state = state.name(),
            "Connection adapter started"
        );
        Ok(())
    }

    /// Feed one envelope addressed to this connection.
    pub async fn handle_message(&mut self, envelope: Envelope) {
        loop {
            let Some(state) = self.state.as_mut() else {
                debug!(
                    connection_id = %self.ctx.connection_id,
                    msg_type = %envelope.msg_type(),
                    "Dropping envelope for terminated connection"
                );
                return;
            };

            match state.handle(&self.ctx, &envelope).await {
                Ok(Transition::Stay) => return,
                Ok(Transition::Enter(mut next)) => {
                    debug!(
                        connection_id = %self.ctx.connection_id,
                        from = state.name(),
                        to = next.name(),
                        "State transition"
                    );
                    if let Err(e) = next.start(&self.ctx).await {
                        warn!(connection_id = %self.ctx.connection_id, error = %e, "Cannot start next state");
                        self.ctx.emit(AdapterEventKind::Error, e.to_string()).await;
                        next.stop(&self.ctx).await;
                        self.state = None;
                        return;
                    }
                    // the replaced state only holds stopped timers now
                    self.state = Some(next);
                }
                Ok(Transition::Terminate) => {
                    state.teardown().await;
                    self.state = None;
                    info!(connection_id = %self.ctx.connection_id, "Connection terminated");
                    return;
                }
                Err(e) => {
                    warn!(
                        connection_id = %self.ctx.connection_id,
                        state = state.name(),
                        error = %e,
                        "Error handling message"
                    );
                    self.ctx.emit(AdapterEventKind::Error, e.to_string()).await;
                    state.stop(&self.ctx).await;
                    self.state = None;
                    return;
                }
            }
        }
    }

    /// Local shutdown. No-op once terminated.
    pub async fn stop(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.stop(&self.ctx).await;
            info!(connection_id = %self.ctx.connection_id, "Connection stopped");
        }
    }

    /// Release local resources without telling the peer. Used when the id
    /// belongs to another adapter, whose peer must not see a Close.
    pub async fn abandon(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.teardown().await;
            debug!(connection_id = %self.ctx.connection_id, "Connection abandoned");
        }
    }

    /// Name of the current state.
    pub fn state_name(&self) -> &'static str {
        self.state.as_ref().map_or("terminated", AdapterState::name)
    }

    /// Check if the adapter reached the absorbing state.
    pub fn is_terminated(&self) -> bool {
        self.state.is_none()
    }

    /// This connection's id.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.ctx.connection_id
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::crypto::CIPHER_NONE;
    use crate::uplink::MockUplink;

    /// Context on a connected mock uplink, plaintext cipher.
    pub(crate) async fn context(
        uplink: &MockUplink,
        connection_id: &str,
    ) -> (AdapterContext, mpsc::Receiver<AdapterEvent>) {
        if !uplink.is_connected() {
            let _ = uplink.connect().await.unwrap();
        }
        let mut settings = ConnectionSettings::default();
        settings.cipher = CIPHER_NONE.to_string();
        let (events, rx) = mpsc::channel(16);
        let ctx = AdapterContext {
            connection_id: ConnectionId::new(connection_id),
            local: DeviceId::random(),
            peer: DeviceId::random(),
            uplink: Arc::new(uplink.clone()),
            settings,
            events,
        };
        (ctx, rx)
    }

    /// Let spawned tasks run.
    pub(crate) async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    pub(crate) async fn next_event(events: &mut mpsc::Receiver<AdapterEvent>) -> AdapterEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no adapter event")
            .expect("event channel closed")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::uplink::MockUplink;

    // ===========================================
    // Repeater
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn repeater_sends_immediately_then_every_interval() {
        let uplink = MockUplink::new();
        let (ctx, _events) = context(&uplink, "rep").await;

        let repeater = Repeater::spawn(
            Arc::clone(&ctx.uplink),
            Envelope::control(ctx.header(MessageType::Confirm)),
            Duration::from_millis(100),
            None,
        );
        settle().await;
        assert_eq!(uplink.sent_of_type(MessageType::Confirm).len(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(uplink.sent_of_type(MessageType::Confirm).len(), 3);

        repeater.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(uplink.sent_of_type(MessageType::Confirm).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn repeater_ends_once_flag_is_set() {
        let uplink = MockUplink::new();
        let (ctx, _events) = context(&uplink, "rep").await;
        let flag = Arc::new(AtomicBool::new(false));

        let _repeater = Repeater::spawn(
            Arc::clone(&ctx.uplink),
            Envelope::control(ctx.header(MessageType::Confirm)),
            Duration::from_millis(100),
            Some(Arc::clone(&flag)),
        );
        settle().await;
        flag.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(uplink.sent_of_type(MessageType::Confirm).len(), 1);
    }

    // ===========================================
    // Adapter lifecycle
    // ===========================================

    #[tokio::test]
    async fn terminated_adapter_ignores_messages_and_stop() {
        let uplink = MockUplink::new();
        let (ctx, _events) = context(&uplink, "term").await;
        let (_local, remote) = tokio::io::duplex(1024);
        let header = ctx.header(MessageType::Close).reply(MessageType::Close);
        let mut adapter = ConnectionAdapter::outbound(ctx, Box::new(remote), "tcp://127.0.0.1:1");
        adapter.start().await.unwrap();

        adapter.handle_message(Envelope::control(header.clone())).await;
        assert!(adapter.is_terminated());
        assert_eq!(adapter.state_name(), "terminated");

        uplink.clear_sent();
        adapter.handle_message(Envelope::control(header)).await;
        adapter.stop().await;
        assert!(uplink.sent_envelopes().is_empty());
    }

    #[tokio::test]
    async fn stop_sends_one_close() {
        let uplink = MockUplink::new();
        let (ctx, _events) = context(&uplink, "stop").await;
        let (_local, remote) = tokio::io::duplex(1024);
        let mut adapter = ConnectionAdapter::outbound(ctx, Box::new(remote), "tcp://127.0.0.1:1");
        adapter.start().await.unwrap();

        adapter.stop().await;
        adapter.stop().await;

        assert_eq!(uplink.sent_of_type(MessageType::Close).len(), 1);
        assert!(adapter.is_terminated());
    }

    #[tokio::test]
    async fn protocol_error_emits_error_and_closes() {
        let uplink = MockUplink::new();
        let (ctx, mut events) = context(&uplink, "proto").await;
        let (_local, remote) = tokio::io::duplex(1024);
        let data = Envelope::new(ctx.header(MessageType::Data).reply(MessageType::Data), vec![]);
        let mut adapter = ConnectionAdapter::outbound(ctx, Box::new(remote), "tcp://127.0.0.1:1");
        adapter.start().await.unwrap();

        adapter.handle_message(data).await;

        let event = next_event(&mut events).await;
        assert_eq!(event.kind, AdapterEventKind::Error);
        assert!(event.message.contains("unexpected D"), "{}", event.message);
        assert!(adapter.is_terminated());
        assert_eq!(uplink.sent_of_type(MessageType::Close).len(), 1);
    }
}
