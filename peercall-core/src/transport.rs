//! Transport layer implementations
//!
//! [`WebSocketTransport`] is a socket.io client speaking Engine.IO v4 over a
//! plain websocket. It implements [`SignalingTransport`] so the call manager
//! never sees frames, only [`SignalingMessage`]s.

use crate::signaling::{SignalingError, SignalingMessage, SignalingTransport};
use crate::socketio::{CodecError, EnginePacket, SocketPacket};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server base URL (`http(s)://` or `ws(s)://`)
    pub url: String,
    /// Token sent as `{"token": ..}` in the namespace connect packet
    pub token: Option<String>,
    /// Limit for the websocket and socket.io handshakes
    pub connect_timeout: Duration,
}

impl TransportConfig {
    /// Configuration for the given server URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the auth token
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Websocket endpoint of the socket.io server
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` if the URL does not parse or has an unsupported scheme
    pub fn websocket_url(&self) -> Result<Url, TransportError> {
        let mut url =
            Url::parse(&self.url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidUrl(self.url.clone()))?;
        url.set_path("/socket.io/");
        url.set_query(Some("EIO=4&transport=websocket"));
        Ok(url)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Server URL is unusable
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Engine.IO or socket.io handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Server refused the namespace connection
    #[error("Connection refused by server: {0}")]
    ConnectRefused(String),

    /// Handshake did not finish in time
    #[error("Connection timed out")]
    Timeout,

    /// No open connection
    #[error("Not connected")]
    NotConnected,

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Message could not be encoded
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Socket.io client transport over a websocket
pub struct WebSocketTransport {
    config: TransportConfig,
    connection: parking_lot::Mutex<Option<Connection>>,
    inbound: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<SignalingMessage>>>,
    connected: Arc<AtomicBool>,
    sid: parking_lot::Mutex<Option<String>>,
}

impl WebSocketTransport {
    /// Create new transport; nothing is opened until `connect`
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            connection: parking_lot::Mutex::new(None),
            inbound: tokio::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            sid: parking_lot::Mutex::new(None),
        }
    }

    /// Get transport configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Socket.io session id of the current connection
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.sid.lock().clone()
    }

    async fn next_text(read: &mut SplitStream<WsStream>) -> Result<String, TransportError> {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::Handshake(
                        "connection closed during handshake".to_string(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::ConnectionError(e.to_string())),
            }
        }
    }

    /// Engine.IO open, then socket.io namespace connect; returns the socket.io sid
    async fn handshake(
        &self,
        write: &mut SplitSink<WsStream, Message>,
        read: &mut SplitStream<WsStream>,
    ) -> Result<String, TransportError> {
        let open = Self::next_text(read).await?;
        match EnginePacket::decode(&open) {
            Ok(EnginePacket::Open(handshake)) => {
                tracing::debug!(
                    engine_sid = %handshake.sid,
                    ping_interval = handshake.ping_interval,
                    "Engine.IO session opened"
                );
            }
            other => {
                return Err(TransportError::Handshake(format!(
                    "expected open packet, got {other:?}"
                )))
            }
        }

        let auth = self
            .config
            .token
            .as_ref()
            .map(|token| serde_json::json!({ "token": token }));
        write
            .send(Message::Text(SocketPacket::connect(auth).to_frame()))
            .await
            .map_err(|e| TransportError::SendError(e.to_string()))?;

        loop {
            let frame = Self::next_text(read).await?;
            match EnginePacket::decode(&frame) {
                Ok(EnginePacket::Ping(body)) => {
                    write
                        .send(Message::Text(EnginePacket::Pong(body).encode()))
                        .await
                        .map_err(|e| TransportError::SendError(e.to_string()))?;
                }
                Ok(EnginePacket::Message(payload)) => match SocketPacket::decode(&payload) {
                    Ok(SocketPacket::Connect { data, .. }) => {
                        let sid = data
                            .as_ref()
                            .and_then(|d| d.get("sid"))
                            .and_then(|s| s.as_str())
                            .unwrap_or_default()
                            .to_string();
                        return Ok(sid);
                    }
                    Ok(SocketPacket::ConnectError { data, .. }) => {
                        let message = data
                            .as_ref()
                            .and_then(|d| d.get("message"))
                            .and_then(|m| m.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("{data:?}"));
                        return Err(TransportError::ConnectRefused(message));
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(TransportError::Handshake(e.to_string())),
                },
                Ok(EnginePacket::Close) => {
                    return Err(TransportError::Handshake("server closed session".to_string()))
                }
                Ok(_) => continue,
                Err(e) => return Err(TransportError::Handshake(e.to_string())),
            }
        }
    }

    fn spawn_reader(
        mut read: SplitStream<WsStream>,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedSender<SignalingMessage>,
        connected: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                let text = match msg_result {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "WebSocket error");
                        break;
                    }
                };

                match EnginePacket::decode(&text) {
                    Ok(EnginePacket::Ping(body)) => {
                        let _ = outbound.send(EnginePacket::Pong(body).encode());
                    }
                    Ok(EnginePacket::Message(payload)) => {
                        if !Self::dispatch(&payload, &inbound) {
                            break;
                        }
                    }
                    Ok(EnginePacket::Close) => {
                        tracing::info!("Engine.IO session closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Dropping undecodable frame"),
                }
            }

            connected.store(false, Ordering::SeqCst);
            tracing::debug!("Signaling reader stopped");
        })
    }

    /// Route one socket.io packet; returns false when the server disconnected us
    fn dispatch(payload: &str, inbound: &mpsc::UnboundedSender<SignalingMessage>) -> bool {
        match SocketPacket::decode(payload) {
            Ok(SocketPacket::Event { name, data, .. }) => {
                match SignalingMessage::from_event(&name, data) {
                    Ok(message) => {
                        let _ = inbound.send(message);
                    }
                    Err(SignalingError::UnknownEvent(name)) => {
                        tracing::trace!(event = %name, "Skipping non-call event");
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping malformed event"),
                }
                true
            }
            Ok(SocketPacket::Disconnect { .. }) => {
                tracing::info!("Disconnected by server");
                false
            }
            Ok(_) => true,
            Err(CodecError::BinaryUnsupported) => {
                tracing::debug!("Ignoring binary packet");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable packet");
                true
            }
        }
    }

    fn spawn_writer(
        mut write: SplitSink<WsStream, Message>,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = write.send(Message::Text(frame)).await {
                    tracing::error!(error = %e, "Failed to send WebSocket message");
                    break;
                }
            }
            let _ = write.close().await;
        })
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    type Error = TransportError;

    #[tracing::instrument(skip(self), fields(url = %self.config.url))]
    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let url = self.config.websocket_url()?;
        tracing::info!("Connecting to signaling server");

        let setup = async {
            let (ws_stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
            let (mut write, mut read) = ws_stream.split();
            let sid = self.handshake(&mut write, &mut read).await?;
            Ok::<_, TransportError>((write, read, sid))
        };
        let (write, read, sid) = tokio::time::timeout(self.config.connect_timeout, setup)
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.connected.store(true, Ordering::SeqCst);

        let writer = Self::spawn_writer(write, out_rx);
        let reader = Self::spawn_reader(read, out_tx.clone(), in_tx, self.connected.clone());

        *self.inbound.lock().await = Some(in_rx);
        *self.sid.lock() = Some(sid.clone());
        if let Some(old) = self.connection.lock().replace(Connection {
            outbound: out_tx,
            reader,
            writer,
        }) {
            old.reader.abort();
            old.writer.abort();
        }

        tracing::info!(sid = %sid, "Connected to signaling server");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(connection) = self.connection.lock().take() else {
            return Ok(());
        };

        let _ = connection.outbound.send(
            SocketPacket::Disconnect {
                namespace: crate::socketio::DEFAULT_NAMESPACE.to_string(),
            }
            .to_frame(),
        );
        connection.reader.abort();
        drop(connection.outbound);
        // Writer drains the disconnect packet and closes the socket
        let _ = tokio::time::timeout(Duration::from_secs(1), connection.writer).await;

        self.connected.store(false, Ordering::SeqCst);
        *self.sid.lock() = None;
        tracing::info!("Disconnected from signaling server");
        Ok(())
    }

    async fn send_message(&self, message: SignalingMessage) -> Result<(), TransportError> {
        let (name, data) = message.to_event()?;
        let frame = SocketPacket::event(name, data).to_frame();

        let connection = self.connection.lock();
        let connection = connection.as_ref().ok_or(TransportError::NotConnected)?;
        connection
            .outbound
            .send(frame)
            .map_err(|_| TransportError::SendError("writer stopped".to_string()))
    }

    async fn receive_message(&self) -> Result<Option<SignalingMessage>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.as_mut() {
            Some(rx) => Ok(rx.recv().await),
            None => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
