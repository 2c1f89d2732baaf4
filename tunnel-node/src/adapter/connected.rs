//! Connected: the forwarder pumps data both ways.

use std::sync::Arc;
use tracing::info;
use tunnel_types::{Envelope, MessageType};

use super::{AdapterContext, AdapterEventKind, Repeater, Transition};
use crate::error::{AdapterError, AdapterResult};
use crate::forwarder::Forwarder;

pub(super) const STATE_NAME: &str = "connected";

pub(crate) struct ConnectedState {
    forwarder: Forwarder,
    keepalive: Option<Repeater>,
}

impl ConnectedState {
    pub(super) fn new(forwarder: Forwarder) -> Self {
        Self {
            forwarder,
            keepalive: None,
        }
    }

    /// Start the pumps and confirm until traffic flows.
    pub(super) fn start(&mut self, ctx: &AdapterContext) -> AdapterResult<()> {
        self.forwarder.start();
        self.keepalive = Some(Repeater::spawn(
            Arc::clone(&ctx.uplink),
            Envelope::control(ctx.header(MessageType::Confirm)),
            ctx.settings.keepalive_interval,
            Some(self.forwarder.traffic_flag()),
        ));
        info!(connection_id = %ctx.connection_id, "Connection established");
        Ok(())
    }

    pub(super) async fn handle(
        &mut self,
        ctx: &AdapterContext,
        envelope: &Envelope,
    ) -> AdapterResult<Transition> {
        match envelope.msg_type() {
            MessageType::Data => {
                self.forwarder.deliver(envelope.clone());
                Ok(Transition::Stay)
            }
            MessageType::DataAck => {
                self.forwarder.handle_ack(envelope)?;
                Ok(Transition::Stay)
            }
            // late handshake retries
            MessageType::Confirm | MessageType::Open | MessageType::Accept => {
                Ok(Transition::Stay)
            }
            MessageType::Close => {
                info!(connection_id = %ctx.connection_id, "Connection closed by peer");
                ctx.emit(AdapterEventKind::Closed, "closed by peer").await;
                Ok(Transition::Terminate)
            }
            MessageType::NotFound => {
                ctx.emit(AdapterEventKind::Error, "peer does not know this connection")
                    .await;
                Ok(Transition::Terminate)
            }
            MessageType::Failed => Err(AdapterError::UnexpectedMessage {
                msg_type: MessageType::Failed,
                state: STATE_NAME,
            }),
        }
    }

    pub(super) async fn teardown(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        self.forwarder.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{AdapterEvent, ConnectionAdapter};
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::uplink::MockUplink;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tunnel_types::{ConnectionAccept, DataAck, DataMessage, Header, WireMessage};

    const WAIT: Duration = Duration::from_secs(2);

    struct Connected {
        uplink: MockUplink,
        adapter: ConnectionAdapter,
        local: DuplexStream,
        events: mpsc::Receiver<AdapterEvent>,
        /// Header of envelopes coming from the peer.
        incoming: Header,
    }

    async fn connected(id: &str) -> Connected {
        let uplink = MockUplink::new();
        let (ctx, events) = context(&uplink, id).await;
        let incoming = ctx.header(MessageType::Accept).reply(MessageType::Accept);
        let accept = Envelope::new(
            incoming.clone(),
            ConnectionAccept {
                pc_key: String::new(),
            }
            .to_bytes()
            .unwrap(),
        );
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let mut adapter = ConnectionAdapter::outbound(ctx, Box::new(remote), "tcp://127.0.0.1:22");
        adapter.start().await.unwrap();
        adapter.handle_message(accept).await;
        assert_eq!(adapter.state_name(), "connected");
        Connected {
            uplink,
            adapter,
            local,
            events,
            incoming,
        }
    }

    fn from_peer(c: &Connected, msg_type: MessageType, payload: Vec<u8>) -> Envelope {
        Envelope::new(c.incoming.with_type(msg_type), payload)
    }

    #[tokio::test]
    async fn data_reaches_local_socket_and_is_acked() {
        let mut c = connected("con-1").await;
        let data = from_peer(
            &c,
            MessageType::Data,
            DataMessage::new(0, b"ping".to_vec()).to_bytes().unwrap(),
        );

        c.adapter.handle_message(data).await;

        let mut buf = [0u8; 4];
        tokio::time::timeout(WAIT, c.local.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");
        tokio::time::timeout(WAIT, async {
            while c.uplink.sent_of_type(MessageType::DataAck).is_empty() {
                settle().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn data_ack_releases_window() {
        let mut c = connected("con-2").await;
        c.local.write_all(b"out").await.unwrap();
        tokio::time::timeout(WAIT, async {
            while c.uplink.sent_of_type(MessageType::Data).is_empty() {
                settle().await;
            }
        })
        .await
        .unwrap();

        let ack = from_peer(
            &c,
            MessageType::DataAck,
            DataAck { seq: 0, re: false }.to_bytes().unwrap(),
        );
        c.adapter.handle_message(ack.clone()).await;
        // stale duplicate is ignored
        c.adapter.handle_message(ack).await;

        assert_eq!(c.adapter.state_name(), "connected");
        assert!(c.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_repeats_until_traffic() {
        let c = connected("con-3").await;
        let interval = ConnectionSettings::default().keepalive_interval;

        settle().await;
        tokio::time::sleep(interval * 2).await;
        let before = c.uplink.sent_of_type(MessageType::Confirm).len();
        assert!(before >= 2, "{before}");

        let mut adapter = c.adapter;
        let data = Envelope::new(
            c.incoming.with_type(MessageType::Data),
            DataMessage::new(0, b"x".to_vec()).to_bytes().unwrap(),
        );
        adapter.handle_message(data).await;
        tokio::time::sleep(interval * 5).await;

        assert_eq!(c.uplink.sent_of_type(MessageType::Confirm).len(), before);
    }

    #[tokio::test]
    async fn peer_close_emits_closed_and_closes_socket() {
        let mut c = connected("con-4").await;
        let close = Envelope::control(c.incoming.with_type(MessageType::Close));

        c.adapter.handle_message(close).await;

        let event = next_event(&mut c.events).await;
        assert_eq!(event.kind, AdapterEventKind::Closed);
        assert_eq!(event.message, "closed by peer");
        assert!(c.adapter.is_terminated());

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(WAIT, c.local.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn late_handshake_messages_are_ignored() {
        let mut c = connected("con-5").await;

        for msg_type in [MessageType::Confirm, MessageType::Open, MessageType::Accept] {
            let envelope = from_peer(&c, msg_type, Vec::new());
            c.adapter.handle_message(envelope).await;
        }

        assert_eq!(c.adapter.state_name(), "connected");
        assert!(c.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_is_a_protocol_error() {
        let mut c = connected("con-6").await;
        let failed = from_peer(&c, MessageType::Failed, Vec::new());

        c.adapter.handle_message(failed).await;

        let event = next_event(&mut c.events).await;
        assert_eq!(event.kind, AdapterEventKind::Error);
        assert!(c.adapter.is_terminated());
        assert_eq!(c.uplink.sent_of_type(MessageType::Close).len(), 1);
    }

    #[tokio::test]
    async fn local_stop_sends_close() {
        let mut c = connected("con-7").await;

        c.adapter.stop().await;

        assert_eq!(c.uplink.sent_of_type(MessageType::Close).len(), 1);
        assert!(c.adapter.is_terminated());
    }
}
