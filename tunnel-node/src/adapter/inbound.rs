//! Connecting inbound: the peer opened a connection to one of our services.
//!
//! Start dials the service, agrees on the session cipher and then repeats
//! Accept until the peer's first Data or Confirm shows it moved on.

use std::sync::Arc;
use tracing::{debug, info, warn};
use tunnel_types::{
    ConnectionAccept, ConnectionFailed, ConnectionOpen, Envelope, MessageType, WireMessage,
};

use super::{AdapterContext, AdapterEventKind, AdapterState, ConnectedState, Repeater, Transition};
use crate::crypto::EphemeralKeys;
use crate::error::{AdapterError, AdapterResult};
use crate::forwarder::{Forwarder, ForwarderOptions, SegmentSender};
use crate::socket::dial;

pub(super) const STATE_NAME: &str = "connecting_inbound";

pub(crate) struct InboundState {
    open: ConnectionOpen,
    forwarder: Option<Forwarder>,
    accept_resender: Option<Repeater>,
}

impl InboundState {
    pub(super) fn new(open: ConnectionOpen) -> Self {
        Self {
            open,
            forwarder: None,
            accept_resender: None,
        }
    }

    /// Key agreement and dial. The error is the reason sent back in Failed.
    async fn prepare(&self, ctx: &AdapterContext) -> Result<(Forwarder, Envelope), String> {
        let bridge = &self.open.bridge_options;

        let keys = EphemeralKeys::generate(&bridge.cipher, &bridge.curve)
            .map_err(|e| format!("unsupported session parameters: {e}"))?;
        let accept = ConnectionAccept {
            pc_key: keys.public_key().to_string(),
        };
        let cipher = keys
            .derive(&self.open.pc_key, &ctx.connection_id)
            .map_err(|e| format!("key agreement failed: {e}"))?;

        let socket = dial(&bridge.url_remote, ctx.settings.dial_timeout)
            .await
            .map_err(|e| format!("error dialing service {}: {e}", bridge.url_remote))?;

        let sender = SegmentSender::new(Arc::clone(&ctx.uplink), cipher, ctx.header(MessageType::Data));
        let options = ForwarderOptions::from_settings(
            &ctx.settings,
            usize::try_from(bridge.ack_window_size).unwrap_or(usize::MAX),
            bridge.rate_limit_bytes_per_second,
        );
        let forwarder = Forwarder::new(socket, sender, options, ctx.events.clone());

        let payload = accept
            .to_bytes()
            .map_err(|e| format!("cannot encode accept: {e}"))?;
        Ok((forwarder, Envelope::new(ctx.header(MessageType::Accept), payload)))
    }

    pub(super) async fn start(&mut self, ctx: &AdapterContext) -> AdapterResult<()> {
        match self.prepare(ctx).await {
            Ok((forwarder, accept)) => {
                self.forwarder = Some(forwarder);
                self.accept_resender = Some(Repeater::spawn(
                    Arc::clone(&ctx.uplink),
                    accept,
                    ctx.settings.response_interval,
                    None,
                ));
                info!(
                    connection_id = %ctx.connection_id,
                    url_remote = %self.open.bridge_options.url_remote,
                    "Accepting connection"
                );
                Ok(())
            }
            Err(reason) => {
                warn!(connection_id = %ctx.connection_id, %reason, "Refusing connection");
                // sent once, the opener only waits for this answer
                let failed = ConnectionFailed {
                    reason: reason.clone(),
                };
                let envelope = Envelope::new(ctx.header(MessageType::Failed), failed.to_bytes()?);
                if let Err(e) = ctx.uplink.send(&envelope).await {
                    warn!(connection_id = %ctx.connection_id, error = %e, "Failed not sent");
                }
                Err(AdapterError::Handshake(reason))
            }
        }
    }

    fn stop_resending(&mut self) {
        if let Some(resender) = self.accept_resender.take() {
            resender.stop();
        }
    }

    pub(super) async fn handle(
        &mut self,
        ctx: &AdapterContext,
        envelope: &Envelope,
    ) -> AdapterResult<Transition> {
        match envelope.msg_type() {
            MessageType::Data | MessageType::Confirm => {
                self.stop_resending();
                let forwarder = self
                    .forwarder
                    .take()
                    .ok_or_else(|| AdapterError::Handshake("connection was not accepted".into()))?;
                debug!(connection_id = %ctx.connection_id, "Peer confirmed accept");
                Ok(Transition::Enter(AdapterState::Connected(ConnectedState::new(
                    forwarder,
                ))))
            }
            MessageType::Open => {
                ctx.emit(AdapterEventKind::Closed, "superseded by repeated open")
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
        if let Some(mut forwarder) = self.forwarder.take() {
            forwarder.close().await;
        }
    }
}
