//! Forwarder - pumps bytes between a local socket and the uplink.
//!
//! One forwarder serves one connected tunnel connection:
//!
//! ```text
//! local socket ──read──► egress ──D──► uplink
//!                          │ window.add / scheduler.register
//!                          ▼
//!                  scan task (resend expired, re=true)
//!
//! uplink ──D──► ingress queue ──► reassembly ──write──► local socket
//!                                     └──DA──► uplink
//! uplink ──DA──► window.ack + scheduler.ack
//! ```
//!
//! Teardown stops every task, wakes the window and discards all state.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnel_core::{ReassemblyBuffer, ReassemblyOptions, RttOptions, WindowError};
use tunnel_types::{
    ConnectionId, DataAck, DataMessage, Envelope, Header, MessageType, WireMessage,
};

use crate::adapter::{AdapterEvent, AdapterEventKind};
use crate::config::ConnectionSettings;
use crate::crypto::SessionCipher;
use crate::error::{AdapterError, AdapterResult};
use crate::scheduler::{run_scan, RetransmitScheduler};
use crate::socket::LocalStream;
use crate::uplink::Uplink;
use crate::window::FlowWindow;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Encrypts and sends the messages of one connection.
///
/// Every envelope it produces carries the same addressing; only the message
/// type changes.
pub struct SegmentSender {
    uplink: Arc<dyn Uplink>,
    cipher: Arc<dyn SessionCipher>,
    header: Header,
}

impl std::fmt::Debug for SegmentSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentSender")
            .field("connection_id", &self.header.connection_id)
            .field("cipher", &self.cipher.name())
            .finish()
    }
}

impl SegmentSender {
    /// Create a sender for the connection described by `header`.
    pub fn new(uplink: Arc<dyn Uplink>, cipher: Arc<dyn SessionCipher>, header: Header) -> Self {
        Self {
            uplink,
            cipher,
            header,
        }
    }

    /// Header template (from local, to peer).
    pub fn header(&self) -> &Header {
        &self.header
    }

    async fn send_sealed(&self, msg_type: MessageType, plaintext: &[u8]) -> AdapterResult<()> {
        let header = self.header.with_type(msg_type);
        let payload = self.cipher.encrypt(&header, plaintext)?;
        self.uplink.send(&Envelope::new(header, payload)).await?;
        Ok(())
    }

    /// Send (or re-send) a data segment.
    pub async fn send_data(&self, segment: &DataMessage) -> AdapterResult<()> {
        self.send_sealed(MessageType::Data, &segment.to_bytes()?)
            .await
    }

    /// Acknowledge one received segment.
    pub async fn send_ack(&self, ack: DataAck) -> AdapterResult<()> {
        self.send_sealed(MessageType::DataAck, &ack.to_bytes()?)
            .await
    }

    /// Send an empty control message (Close, Confirm).
    pub async fn send_control(&self, msg_type: MessageType) -> AdapterResult<()> {
        self.uplink
            .send(&Envelope::control(self.header.with_type(msg_type)))
            .await?;
        Ok(())
    }

    /// Decrypt and decode a sealed payload.
    pub fn open<M: WireMessage>(&self, envelope: &Envelope) -> AdapterResult<M> {
        let plaintext = self.cipher.decrypt(&envelope.header, &envelope.payload)?;
        Ok(M::from_bytes(&plaintext)?)
    }
}

/// Tuning for one forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    /// Local socket read timeout (only re-polls).
    pub read_timeout: Duration,
    /// Bytes read per segment.
    pub read_buffer_size: usize,
    /// Effective egress limit in bytes/second (0 = unlimited).
    pub rate_limit: u64,
    /// Flow window capacity in bytes.
    pub window_size: usize,
    /// RTT estimator tuning.
    pub rtt: RttOptions,
    /// Reassembly limits.
    pub reassembly: ReassemblyOptions,
    /// Retransmission scan interval.
    pub scheduler_tick: Duration,
    /// Maximum segments in flight.
    pub scheduler_queue_size: usize,
    /// Data envelopes queued for the ingress pump.
    pub ingress_queue_size: usize,
}

impl ForwarderOptions {
    /// Options from node settings and the negotiated bridge parameters.
    ///
    /// A zero `window_size` falls back to the configured window; a zero
    /// configured window leaves a one-byte window.
    pub fn from_settings(settings: &ConnectionSettings, window_size: usize, rate_limit: u64) -> Self {
        Self {
            read_timeout: settings.read_timeout,
            read_buffer_size: settings.read_buffer_size.max(1),
            rate_limit: effective_rate(settings.throughput_limit, rate_limit),
            window_size: [window_size, settings.ack_window_size]
                .into_iter()
                .find(|&size| size > 0)
                .unwrap_or(1),
            rtt: settings.rtt,
            reassembly: settings.reassembly,
            scheduler_tick: settings.scheduler_tick,
            scheduler_queue_size: settings.scheduler_queue_size,
            ingress_queue_size: settings.ingress_queue_size.max(1),
        }
    }
}

/// Lowest non-zero limit (0 = unlimited).
pub fn effective_rate(local: u64, requested: u64) -> u64 {
    match (local, requested) {
        (0, r) => r,
        (l, 0) => l,
        (l, r) => l.min(r),
    }
}

fn build_limiter(rate: u64, chunk: usize) -> Option<DirectLimiter> {
    let rate = NonZeroU32::new(u32::try_from(rate).unwrap_or(u32::MAX))?;
    // a whole read must fit in one burst
    let burst = u32::try_from(chunk).unwrap_or(u32::MAX).max(rate.get());
    let burst = NonZeroU32::new(burst)?;
    Some(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
}

async fn emit(events: &mpsc::Sender<AdapterEvent>, event: AdapterEvent) {
    if events.send(event).await.is_err() {
        debug!("Adapter event dropped, controller is gone");
    }
}

/// Moves bytes between one local socket and the uplink.
pub struct Forwarder {
    connection_id: ConnectionId,
    sender: Arc<SegmentSender>,
    window: Arc<FlowWindow>,
    scheduler: Arc<RetransmitScheduler>,
    options: ForwarderOptions,
    events: mpsc::Sender<AdapterEvent>,
    socket: Option<LocalStream>,
    ingress_tx: mpsc::Sender<Envelope>,
    ingress_rx: Option<mpsc::Receiver<Envelope>>,
    traffic: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("connection_id", &self.connection_id)
            .field("started", &self.is_started())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Forwarder {
    /// Create a forwarder; nothing runs until [`Forwarder::start`].
    pub fn new(
        socket: LocalStream,
        sender: SegmentSender,
        options: ForwarderOptions,
        events: mpsc::Sender<AdapterEvent>,
    ) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel(options.ingress_queue_size);
        let (stop, _) = watch::channel(false);
        Self {
            connection_id: sender.header().connection_id.clone(),
            sender: Arc::new(sender),
            window: Arc::new(FlowWindow::new(options.window_size, options.rtt)),
            scheduler: Arc::new(RetransmitScheduler::new(
                options.scheduler_queue_size,
                options.scheduler_tick,
            )),
            options,
            events,
            socket: Some(socket),
            ingress_tx,
            ingress_rx: Some(ingress_rx),
            traffic: Arc::new(AtomicBool::new(false)),
            stop,
            tasks: Vec::new(),
            closed: false,
        }
    }

    /// Start the egress, ingress and retransmission tasks. Idempotent.
    pub fn start(&mut self) {
        if self.closed {
            return;
        }
        let (Some(socket), Some(ingress_rx)) = (self.socket.take(), self.ingress_rx.take()) else {
            return;
        };
        let (reader, writer) = tokio::io::split(socket);

        let egress = Egress {
            connection_id: self.connection_id.clone(),
            sender: Arc::clone(&self.sender),
            window: Arc::clone(&self.window),
            scheduler: Arc::clone(&self.scheduler),
            limiter: build_limiter(self.options.rate_limit, self.options.read_buffer_size),
            read_timeout: self.options.read_timeout,
            read_buffer_size: self.options.read_buffer_size,
            traffic: Arc::clone(&self.traffic),
            events: self.events.clone(),
            stop: self.stop.subscribe(),
        };
        let ingress = Ingress {
            connection_id: self.connection_id.clone(),
            sender: Arc::clone(&self.sender),
            reassembly: self.options.reassembly,
            events: self.events.clone(),
            stop: self.stop.subscribe(),
        };

        self.tasks.push(tokio::spawn(egress.run(reader)));
        self.tasks.push(tokio::spawn(ingress.run(writer, ingress_rx)));
        self.tasks.push(tokio::spawn(run_scan(
            self.connection_id.clone(),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.sender),
            self.stop.subscribe(),
        )));
        debug!(connection_id = %self.connection_id, "Forwarder started");
    }

    /// Hand a Data envelope to the ingress pump.
    ///
    /// A full queue drops the envelope; the peer retransmits it.
    pub fn deliver(&self, envelope: Envelope) {
        self.traffic.store(true, Ordering::Relaxed);
        match self.ingress_tx.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                warn!(
                    connection_id = %self.connection_id,
                    payload_len = envelope.payload.len(),
                    "Ingress queue full, dropping data segment"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection_id = %self.connection_id, "Ingress stopped, dropping data segment");
            }
        }
    }

    /// Apply a DataAck envelope to the window and the scheduler.
    pub fn handle_ack(&self, envelope: &Envelope) -> AdapterResult<()> {
        self.traffic.store(true, Ordering::Relaxed);
        let ack: DataAck = self.sender.open(envelope)?;
        self.scheduler.ack(ack.seq);

        match self.window.ack(ack) {
            Ok(outcome) => {
                debug!(
                    connection_id = %self.connection_id,
                    seq = ack.seq,
                    rtt = ?outcome.rtt,
                    reliable = outcome.reliable,
                    "Segment acknowledged"
                );
                Ok(())
            }
            Err(e) if e.is_stale() || e == WindowError::Closed => {
                debug!(connection_id = %self.connection_id, seq = ack.seq, error = %e, "Ignoring stale ack");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Set once Data or DataAck flows in either direction.
    pub fn traffic_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.traffic)
    }

    /// The connection's sender.
    pub fn sender(&self) -> &SegmentSender {
        &self.sender
    }

    /// The connection's flow window.
    pub fn window(&self) -> &FlowWindow {
        &self.window
    }

    /// The connection's retransmission scheduler.
    pub fn scheduler(&self) -> &RetransmitScheduler {
        &self.scheduler
    }

    /// Check if the pumps were started.
    pub fn is_started(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Check if the forwarder was closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop every task, close the local socket and discard state. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop.send_replace(true);
        self.window.close();
        self.scheduler.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.shutdown().await;
        }
        debug!(connection_id = %self.connection_id, "Forwarder closed");
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Egress {
    connection_id: ConnectionId,
    sender: Arc<SegmentSender>,
    window: Arc<FlowWindow>,
    scheduler: Arc<RetransmitScheduler>,
    limiter: Option<DirectLimiter>,
    read_timeout: Duration,
    read_buffer_size: usize,
    traffic: Arc<AtomicBool>,
    events: mpsc::Sender<AdapterEvent>,
    stop: watch::Receiver<bool>,
}

impl Egress {
    async fn fail(&self, kind: AdapterEventKind, message: String) {
        emit(
            &self.events,
            AdapterEvent::new(self.connection_id.clone(), kind, message),
        )
        .await;
    }

    async fn run(mut self, mut reader: ReadHalf<LocalStream>) {
        let mut buf = vec![0u8; self.read_buffer_size];
        let mut seq = 0u64;

        loop {
            // a segment never exceeds the window, or add() could not admit it
            let limit = buf.len().min(self.window.capacity()).max(1);
            let read = tokio::select! {
                _ = self.stop.changed() => return,
                read = tokio::time::timeout(self.read_timeout, reader.read(&mut buf[..limit])) => read,
            };
            let n = match read {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    info!(connection_id = %self.connection_id, "Local socket closed");
                    self.fail(AdapterEventKind::Closed, "local socket closed".into())
                        .await;
                    return;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(connection_id = %self.connection_id, error = %e, "Local socket read failed");
                    self.fail(AdapterEventKind::Error, format!("local socket read failed: {e}"))
                        .await;
                    return;
                }
            };

            let added = tokio::select! {
                _ = self.stop.changed() => return,
                added = self.window.add(seq, n) => added,
            };
            match added {
                Ok(()) => {}
                Err(WindowError::Closed) => return,
                Err(e) => {
                    self.fail(AdapterEventKind::Error, AdapterError::from(e).to_string())
                        .await;
                    return;
                }
            }

            if let Some(limiter) = &self.limiter {
                // n <= burst, so the only failure is a misconfigured quota
                let cells = NonZeroU32::new(n as u32).unwrap_or(NonZeroU32::MIN);
                tokio::select! {
                    _ = self.stop.changed() => return,
                    ready = limiter.until_n_ready(cells) => {
                        if let Err(e) = ready {
                            warn!(connection_id = %self.connection_id, error = %e, "Rate limiter rejected segment size");
                        }
                    }
                }
            }

            let segment = DataMessage::new(seq, buf[..n].to_vec());
            if let Err(e) = self.scheduler.register(segment.clone(), self.window.rto()) {
                warn!(connection_id = %self.connection_id, error = %e, "Cannot schedule segment");
                self.fail(AdapterEventKind::Error, AdapterError::from(e).to_string())
                    .await;
                return;
            }

            self.traffic.store(true, Ordering::Relaxed);
            if let Err(e) = self.sender.send_data(&segment).await {
                // stays scheduled, the scan task re-sends it
                warn!(connection_id = %self.connection_id, seq, error = %e, "Segment send failed");
            }
            seq += 1;
        }
    }
}

struct Ingress {
    connection_id: ConnectionId,
    sender: Arc<SegmentSender>,
    reassembly: ReassemblyOptions,
    events: mpsc::Sender<AdapterEvent>,
    stop: watch::Receiver<bool>,
}

impl Ingress {
    async fn fail(&self, message: String) {
        emit(
            &self.events,
            AdapterEvent::new(self.connection_id.clone(), AdapterEventKind::Error, message),
        )
        .await;
    }

    async fn ack(&self, seq: u64, re: bool) {
        if let Err(e) = self.sender.send_ack(DataAck { seq, re }).await {
            warn!(connection_id = %self.connection_id, seq, error = %e, "Ack send failed");
        }
    }

    async fn run(
        mut self,
        mut writer: WriteHalf<LocalStream>,
        mut inbound: mpsc::Receiver<Envelope>,
    ) {
        let mut buffer = ReassemblyBuffer::new(self.reassembly);

        loop {
            let envelope = tokio::select! {
                _ = self.stop.changed() => break,
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let segment: DataMessage = match self.sender.open(&envelope) {
                Ok(segment) => segment,
                Err(e) => {
                    warn!(connection_id = %self.connection_id, error = %e, "Undecodable data segment");
                    self.fail(e.to_string()).await;
                    break;
                }
            };
            let (seq, re) = (segment.seq, segment.re);

            match buffer.test(segment) {
                Ok(run) => {
                    for delivered in run {
                        if let Err(e) = writer.write_all(&delivered.data).await {
                            warn!(connection_id = %self.connection_id, error = %e, "Local socket write failed");
                            self.fail(format!("local socket write failed: {e}")).await;
                            return;
                        }
                        self.ack(delivered.seq, delivered.re).await;
                    }
                }
                Err(e) if e.is_stale() => {
                    // the earlier ack may have been lost
                    debug!(connection_id = %self.connection_id, seq, "Re-acking old segment");
                    self.ack(seq, re).await;
                }
                Err(e) => {
                    warn!(connection_id = %self.connection_id, seq, error = %e, "Reassembly rejected segment");
                    self.fail(AdapterError::from(e).to_string()).await;
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    }
}
