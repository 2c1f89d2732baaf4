//! Connecting outbound: the local side opened a connection and waits for
//! the peer's answer, resending Open every `response_interval`.

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use tunnel_types::{
    BridgeOptions, ConnectionAccept, ConnectionFailed, ConnectionOpen, Envelope, MessageType,
    WireMessage,
};

use super::{AdapterContext, AdapterEventKind, AdapterState, ConnectedState, Repeater, Transition};
use crate::crypto::EphemeralKeys;
use crate::error::{AdapterError, AdapterResult};
use crate::forwarder::{Forwarder, ForwarderOptions, SegmentSender};
use crate::socket::LocalStream;

pub(super) const STATE_NAME: &str = "connecting_outbound";

pub(crate) struct OutboundState {
    socket: Option<LocalStream>,
    url_remote: String,
    keys: Option<EphemeralKeys>,
    open_resender: Option<Repeater>,
}

impl OutboundState {
    pub(super) fn new(socket: LocalStream, url_remote: String) -> Self {
        Self {
            socket: Some(socket),
            url_remote,
            keys: None,
            open_resender: None,
        }
    }

    pub(super) async fn start(&mut self, ctx: &AdapterContext) -> AdapterResult<()> {
        let settings = &ctx.settings;
        let keys = EphemeralKeys::generate(&settings.cipher, &settings.curve)?;

        let mut bridge_options = BridgeOptions::new(&self.url_remote, keys.cipher(), &settings.curve);
        bridge_options.rate_limit_bytes_per_second = settings.throughput_limit;
        bridge_options.ack_window_size = settings.ack_window_size as u64;
        let open = ConnectionOpen {
            bridge_options,
            pc_key: keys.public_key().to_string(),
        };
        let envelope = Envelope::new(ctx.header(MessageType::Open), open.to_bytes()?);

        self.keys = Some(keys);
        self.open_resender = Some(Repeater::spawn(
            Arc::clone(&ctx.uplink),
            envelope,
            settings.response_interval,
            None,
        ));
        debug!(connection_id = %ctx.connection_id, url_remote = %self.url_remote, "Opening connection");
        Ok(())
    }

    fn stop_resending(&mut self) {
        if let Some(resender) = self.open_resender.take() {
            resender.stop();
        }
    }

    pub(super) async fn handle(
        &mut self,
        ctx: &AdapterContext,
        envelope: &Envelope,
    ) -> AdapterResult<Transition> {
        match envelope.msg_type() {
            MessageType::Accept => {
                self.stop_resending();
                let accept = ConnectionAccept::from_bytes(&envelope.payload)?;
                let (Some(keys), Some(socket)) = (self.keys.take(), self.socket.take()) else {
                    return Err(AdapterError::Handshake("accept before open".into()));
                };
                let cipher = keys.derive(&accept.pc_key, &ctx.connection_id)?;

                let sender = SegmentSender::new(
                    Arc::clone(&ctx.uplink),
                    cipher,
                    ctx.header(MessageType::Data),
                );
                let options = ForwarderOptions::from_settings(
                    &ctx.settings,
                    ctx.settings.ack_window_size,
                    0,
                );
                let forwarder = Forwarder::new(socket, sender, options, ctx.events.clone());

                info!(connection_id = %ctx.connection_id, "Connection accepted by peer");
                Ok(Transition::Enter(AdapterState::Connected(ConnectedState::new(
                    forwarder,
                ))))
            }
            MessageType::Failed => {
                let reason = ConnectionFailed::from_bytes(&envelope.payload)
                    .map(|failed| failed.reason)
                    .unwrap_or_else(|e| format!("undecodable failure: {e}"));
                warn!(connection_id = %ctx.connection_id, %reason, "Peer refused connection");
                ctx.emit(AdapterEventKind::Error, format!("connection failed: {reason}"))
                    .await;
                Ok(Transition::Terminate)
            }
            MessageType::Close => {
                ctx.emit(AdapterEventKind::Closed, "closed by peer").await;
                Ok(Transition::Terminate)
            }
            MessageType::NotFound => {
                ctx.emit(AdapterEventKind::Error, "peer does not know this connection")
                    .await;
                Ok(Transition::Terminate)
            }
            msg_type => Err(AdapterError::UnexpectedMessage {
                msg_type,
                state: STATE_NAME,
            }),
        }
    }

    pub(super) async fn teardown(&mut self) {
        self.stop_resending();
        self.keys = None;
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::ConnectionAdapter;
    use super::*;
    use crate::uplink::MockUplink;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn accept(ctx: &AdapterContext) -> Envelope {
        let accept = ConnectionAccept {
            pc_key: String::new(),
        };
        Envelope::new(
            ctx.header(MessageType::Accept).reply(MessageType::Accept),
            accept.to_bytes().unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_resent_until_accept() {
        let uplink = MockUplink::new();
        let (ctx, mut events) = context(&uplink, "out-1").await;
        let interval = ctx.settings.response_interval;
        let accept = accept(&ctx);
        let (_local, remote) = tokio::io::duplex(1024);
        let mut adapter = ConnectionAdapter::outbound(ctx, Box::new(remote), "tcp://127.0.0.1:22");

        adapter.start().await.unwrap();
        settle().await;
        assert_eq!(uplink.sent_of_type(MessageType::Open).len(), 1);

        tokio::time::sleep(interval).await;
        assert_eq!(uplink.sent_of_type(MessageType::Open).len(), 2);
        tokio::time::sleep(interval).await;
        assert_eq!(uplink.sent_of_type(MessageType::Open).len(), 3);

        adapter.handle_message(accept.clone()).await;
        settle().await;
        assert_eq!(adapter.state_name(), "connected");
        assert_eq!(uplink.sent_of_type(MessageType::Confirm).len(), 1);

        // a duplicate accept does not start a second connected state
        adapter.handle_message(accept).await;
        settle().await;
        assert_eq!(adapter.state_name(), "connected");
        assert_eq!(uplink.sent_of_type(MessageType::Confirm).len(), 1);

        tokio::time::sleep(interval * 5).await;
        assert_eq!(uplink.sent_of_type(MessageType::Open).len(), 3);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn open_carries_bridge_options() {
        let uplink = MockUplink::new();
        let (ctx, _events) = context(&uplink, "out-2").await;
        let window = ctx.settings.ack_window_size as u64;
        let (_local, remote) = tokio::io::duplex(1024);
        let mut adapter = ConnectionAdapter::outbound(ctx, Box::new(remote), "udp://10.0.0.1:53");

        adapter.start().await.unwrap();
        settle().await;

        let sent = uplink.sent_of_type(MessageType::Open);
        let open = ConnectionOpen::from_bytes(&sent[0].payload).unwrap();
        assert_eq!(open.bridge_options.url_remote, "udp://10.0.0.1:53");
        assert_eq!(open.bridge_options.ack_window_size, window);
        assert_eq!(open.bridge_options.cipher, "none");
        assert_eq!(sent[0].connection_id().as_str(), "out-2");
    }

    #[tokio::test]
    async fn failed_surfaces_reason_and_closes_socket() {
        let uplink = MockUplink::new();
        let (ctx, mut events) = context(&uplink, "out-3").await;
        let failed = Envelope::new(
            ctx.header(MessageType::Failed).reply(MessageType::Failed),
            ConnectionFailed {
                reason: "error dialing service".into(),
            }
            .to_bytes()
            .unwrap(),
        );
        let (mut local, remote) = tokio::io::duplex(1024);
        let mut adapter = ConnectionAdapter::outbound(ctx, Box::new(remote), "tcp://127.0.0.1:22");
        adapter.start().await.unwrap();

        adapter.handle_message(failed).await;

        let event = next_event(&mut events).await;
        assert_eq!(event.kind, AdapterEventKind::Error);
        assert_eq!(event.message, "connection failed: error dialing service");
        assert!(adapter.is_terminated());

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), local.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn not_found_emits_error() {
        let uplink = MockUplink::new();
        let (ctx, mut events) = context(&uplink, "out-4").await;
        let not_found = Envelope::control(ctx.header(MessageType::NotFound).reply(MessageType::NotFound));
        let (_local, remote) = tokio::io::duplex(1024);
        let mut adapter = ConnectionAdapter::outbound(ctx, Box::new(remote), "tcp://127.0.0.1:22");
        adapter.start().await.unwrap();

        adapter.handle_message(not_found).await;

        assert_eq!(next_event(&mut events).await.kind, AdapterEventKind::Error);
        assert!(adapter.is_terminated());
    }
}
