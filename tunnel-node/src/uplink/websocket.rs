//! WebSocket uplink to the relay.
//!
//! One binary frame carries one MessagePack-encoded envelope. The read loop
//! reconnects with exponential backoff when the connection drops, and hands
//! decoded envelopes to a bounded queue. A full queue drops the newest
//! envelope: the tunnel's retransmission recovers lost data, whereas
//! blocking here would stall every connection on the uplink.

use super::{Uplink, UplinkError, UplinkEvent, UplinkState, EVENT_CAPACITY};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use tunnel_core::ReconnectPolicy;
use tunnel_types::Envelope;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Options for [`WebSocketUplink`].
#[derive(Debug, Clone)]
pub struct WebSocketUplinkOptions {
    /// Relay URL (`ws://...`).
    pub url: String,
    /// Token sent in the `Authorization` header.
    pub api_token: String,
    /// Reconnect backoff and retry limit.
    pub policy: ReconnectPolicy,
    /// Capacity of the inbound envelope queue.
    pub receive_queue_size: usize,
    /// Timeout for a single frame write.
    pub write_timeout: Duration,
}

impl WebSocketUplinkOptions {
    /// Options with default tuning.
    pub fn new(url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_token: api_token.into(),
            policy: ReconnectPolicy::default(),
            receive_queue_size: 1000,
            write_timeout: Duration::from_secs(10),
        }
    }
}

struct Shared {
    options: WebSocketUplinkOptions,
    sink: Mutex<Option<WsSink>>,
    events: broadcast::Sender<UplinkEvent>,
    dropped: AtomicU64,
}

impl Shared {
    fn emit(&self, state: UplinkState, detail: impl Into<String>) {
        // no subscribers is fine
        let _ = self.events.send(UplinkEvent::new(state, detail));
    }

    async fn dial(&self) -> Result<WsStream, UplinkError> {
        let mut request = self
            .options
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| UplinkError::ConnectionFailed(e.to_string()))?;
        if !self.options.api_token.is_empty() {
            let token = HeaderValue::from_str(&self.options.api_token)
                .map_err(|e| UplinkError::ConnectionFailed(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, token);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| UplinkError::ConnectionFailed(e.to_string()))?;
        Ok(stream)
    }

    /// Dial until connected or the retry budget runs out.
    async fn dial_with_retry(&self) -> Result<WsStream, UplinkError> {
        let mut attempt = 0u32;
        loop {
            self.emit(
                UplinkState::Disconnected,
                format!("connecting to relay: {}", self.options.url),
            );
            match self.dial().await {
                Ok(stream) => {
                    info!(url = %self.options.url, "Uplink connected");
                    self.emit(
                        UplinkState::Connected,
                        format!("connected to relay: {}", self.options.url),
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(url = %self.options.url, attempt, error = %e, "Uplink connect failed");
                    self.emit(
                        UplinkState::Disconnected,
                        format!("error connecting to relay: {e}"),
                    );
                    match self.options.policy.delay(attempt) {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => {
                            error!(attempt, "Uplink gave up reconnecting");
                            self.emit(UplinkState::GaveUp, "maximum number of retries reached");
                            return Err(UplinkError::ConnectionFailed(format!(
                                "maximum number of retries reached after: {e}"
                            )));
                        }
                    }
                }
            }
        }
    }

    async fn install(&self, stream: WsStream) -> WsSource {
        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);
        source
    }
}

/// Uplink over a WebSocket connection to the relay.
pub struct WebSocketUplink {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketUplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketUplink")
            .field("url", &self.shared.options.url)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl WebSocketUplink {
    /// Create an unconnected uplink.
    pub fn new(options: WebSocketUplinkOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                options,
                sink: Mutex::new(None),
                events,
                dropped: AtomicU64::new(0),
            }),
            stop,
            reader: std::sync::Mutex::new(None),
        }
    }

    /// Inbound envelopes dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Uplink for WebSocketUplink {
    async fn connect(&self) -> Result<mpsc::Receiver<Envelope>, UplinkError> {
        self.stop.send_replace(false);
        let stream = self.shared.dial_with_retry().await?;
        let source = self.shared.install(stream).await;

        let (tx, rx) = mpsc::channel(self.shared.options.receive_queue_size.max(1));
        let handle = tokio::spawn(read_loop(
            Arc::clone(&self.shared),
            source,
            tx,
            self.stop.subscribe(),
        ));
        let previous = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(rx)
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), UplinkError> {
        let bytes = envelope.to_bytes()?;
        let mut guard = self.shared.sink.lock().await;
        let sink = guard.as_mut().ok_or(UplinkError::NotConnected)?;

        match tokio::time::timeout(
            self.shared.options.write_timeout,
            sink.send(Message::binary(bytes)),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.shared
                    .emit(UplinkState::Disconnected, format!("send - websocket error: {e}"));
                Err(UplinkError::SendFailed(e.to_string()))
            }
            Err(_) => Err(UplinkError::Timeout),
        }
    }

    async fn close(&self) -> Result<(), UplinkError> {
        self.stop.send_replace(true);
        if let Some(mut sink) = self.shared.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        info!(url = %self.shared.options.url, "Uplink closed");
        self.shared.emit(UplinkState::Disconnected, "uplink closed");
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<UplinkEvent> {
        self.shared.events.subscribe()
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut source: WsSource,
    inbound: mpsc::Sender<Envelope>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = stop.changed() => break,
            frame = source.next() => frame,
        };

        let reason = match frame {
            Some(Ok(Message::Binary(bytes))) => {
                let envelope = match Envelope::from_bytes(&bytes) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable frame");
                        shared.emit(
                            UplinkState::Connected,
                            format!("error decoding message: {e}"),
                        );
                        continue;
                    }
                };
                match inbound.try_send(envelope) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(envelope)) => {
                        let dropped = shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            connection_id = %envelope.connection_id(),
                            msg_type = %envelope.msg_type(),
                            dropped,
                            "Receive queue full, dropping envelope"
                        );
                        shared.emit(
                            UplinkState::Connected,
                            "recv channel full, dropping message",
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Inbound queue closed, stopping read loop");
                        break;
                    }
                }
                continue;
            }
            Some(Ok(Message::Close(frame))) => format!("closed by relay: {frame:?}"),
            // ping, pong and text frames; pongs are queued by tungstenite
            Some(Ok(_)) => continue,
            Some(Err(e)) => format!("read - websocket closed after error: {e}"),
            None => "read - websocket stream ended".to_string(),
        };

        warn!(%reason, "Uplink disconnected");
        shared.sink.lock().await.take();
        shared.emit(UplinkState::Disconnected, reason);

        tokio::time::sleep(shared.options.policy.backoff(0)).await;
        let reconnected = tokio::select! {
            _ = stop.changed() => break,
            result = shared.dial_with_retry() => result,
        };
        match reconnected {
            Ok(stream) => source = shared.install(stream).await,
            Err(_) => break,
        }
    }
    debug!("Uplink read loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tunnel_types::{ConnectionId, DeviceId, Header, MessageType};

    fn envelope(msg_type: MessageType) -> Envelope {
        Envelope::new(
            Header::new(
                DeviceId::random(),
                DeviceId::random(),
                msg_type,
                ConnectionId::new("ws-test"),
            ),
            vec![1, 2, 3],
        )
    }

    #[tokio::test]
    async fn exchanges_binary_envelopes_with_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut auth = None;
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                auth = req
                    .headers()
                    .get("authorization")
                    .map(|v| v.to_str().unwrap().to_string());
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback)
                .await
                .unwrap();

            let outbound = envelope(MessageType::Open).to_bytes().unwrap();
            ws.send(Message::binary(outbound)).await.unwrap();

            let received = loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Binary(bytes) => break Envelope::from_bytes(&bytes).unwrap(),
                    _ => continue,
                }
            };
            (auth, received)
        });

        let uplink = WebSocketUplink::new(WebSocketUplinkOptions::new(
            format!("ws://{addr}/relay"),
            "token-123",
        ));
        let mut inbound = uplink.connect().await.unwrap();

        let first = inbound.recv().await.unwrap();
        assert_eq!(first.msg_type(), MessageType::Open);

        uplink.send(&envelope(MessageType::Accept)).await.unwrap();
        let (auth, received) = relay.await.unwrap();

        assert_eq!(auth.as_deref(), Some("token-123"));
        assert_eq!(received.msg_type(), MessageType::Accept);
        assert_eq!(received.payload, vec![1, 2, 3]);

        uplink.close().await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_relay_drops_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let first = tokio_tungstenite::accept_async(tcp).await.unwrap();
            drop(first);

            let (tcp, _) = listener.accept().await.unwrap();
            let mut second = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let outbound = envelope(MessageType::Data).to_bytes().unwrap();
            second.send(Message::binary(outbound)).await.unwrap();
            loop {
                match second.next().await.unwrap().unwrap() {
                    Message::Binary(bytes) => break Envelope::from_bytes(&bytes).unwrap(),
                    _ => continue,
                }
            }
        });

        let mut options = WebSocketUplinkOptions::new(format!("ws://{addr}/relay"), "");
        options.policy = ReconnectPolicy::new(Duration::from_millis(100), 2);
        let uplink = WebSocketUplink::new(options);
        let mut events = uplink.events();
        let mut inbound = uplink.connect().await.unwrap();

        // delivered by the second relay session on the same receiver
        let resumed = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resumed.msg_type(), MessageType::Data);

        uplink.send(&envelope(MessageType::DataAck)).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.msg_type(), MessageType::DataAck);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            states.push(event.state);
        }
        let connected: Vec<usize> = states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == UplinkState::Connected)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(connected.len(), 2, "{states:?}");
        assert!(states[connected[0]..connected[1]].contains(&UplinkState::Disconnected));
        assert!(!states.contains(&UplinkState::GaveUp));

        uplink.close().await.unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        // reserve a port, then free it so the dial is refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut options = WebSocketUplinkOptions::new(format!("ws://{addr}/relay"), "");
        options.policy = ReconnectPolicy::new(Duration::from_millis(20), 2);
        let uplink = WebSocketUplink::new(options);
        let mut events = uplink.events();

        let result = uplink.connect().await;

        assert!(matches!(result, Err(UplinkError::ConnectionFailed(_))));
        let mut gave_up = false;
        while let Ok(event) = events.try_recv() {
            gave_up |= event.state == UplinkState::GaveUp;
        }
        assert!(gave_up);
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let uplink = WebSocketUplink::new(WebSocketUplinkOptions::new("ws://127.0.0.1:1", ""));
        let result = uplink.send(&envelope(MessageType::Close)).await;
        assert!(matches!(result, Err(UplinkError::NotConnected)));
        assert_eq!(uplink.dropped(), 0);
    }
}
