//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Connect mit Timeout
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Heartbeat (Ping) gegen Idle-Timeouts von Proxies
//! - Event-basierte Kommunikation

use super::backoff::Backoff;
use super::messages::{Envelope, SignalingMessage};
use super::transport::{ConnectionStatus, SignalingError, SignalingEvent, SignalingTransport};
use crate::config::{CallConfig, ReconnectPolicy};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ping-Intervall, hält die Verbindung durch Proxies offen
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone)]
struct ClientState {
    status: ConnectionStatus,
    local_id: Option<String>,
    /// Wird bei jedem connect/disconnect erhöht; alte Tasks beenden sich
    generation: u64,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            local_id: None,
            generation: 0,
        }
    }
}

struct Shared {
    state: RwLock<ClientState>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.state.read().generation == generation
    }

    /// Setzt den Status nur, wenn die Verbindung noch aktuell ist
    fn set_status(&self, generation: u64, status: ConnectionStatus) {
        {
            let mut state = self.state.write();
            if state.generation != generation {
                return;
            }
            state.status = status.clone();
        }
        let _ = self.event_tx.send(SignalingEvent::Status(status));
    }
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    endpoint: Url,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    shared: Arc<Shared>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(config: &CallConfig) -> Result<Self, SignalingError> {
        let endpoint = config
            .signaling_endpoint()
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            endpoint,
            connect_timeout: config.connect_timeout(),
            reconnect: config.reconnect.clone(),
            shared: Arc::new(Shared {
                state: RwLock::new(ClientState::default()),
                tx: RwLock::new(None),
                event_tx,
            }),
        })
    }

    /// URL mit `userId` Query-Parameter
    fn url_for(&self, local_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("userId", local_id);
        url
    }

    /// Baut die WebSocket-Verbindung auf, max. `timeout`
    async fn dial(url: &Url, timeout: Duration) -> Result<WsStream, SignalingError> {
        match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws_stream, _))) => Ok(ws_stream),
            Ok(Err(e)) => Err(SignalingError::ConnectionFailed(e.to_string())),
            Err(_) => Err(SignalingError::Timeout(timeout)),
        }
    }

    /// Hält die Verbindung am Leben und verbindet nach Abbrüchen neu
    async fn supervise(
        shared: Arc<Shared>,
        url: Url,
        timeout: Duration,
        policy: ReconnectPolicy,
        generation: u64,
        ws_stream: WsStream,
        rx: mpsc::Receiver<String>,
    ) {
        let mut backoff = Backoff::new(policy);
        let mut ws_stream = ws_stream;
        let mut rx = rx;

        loop {
            Self::pump(ws_stream, rx, &shared).await;

            if !shared.is_current(generation) {
                tracing::debug!("Signaling connection closed after disconnect");
                return;
            }
            shared.tx.write().take();
            tracing::warn!("Signaling connection lost, reconnecting");

            loop {
                let Some(delay) = backoff.next_delay() else {
                    tracing::error!("Giving up after {} reconnect attempts", backoff.attempt());
                    shared.set_status(
                        generation,
                        ConnectionStatus::Failed("reconnect attempts exhausted".to_string()),
                    );
                    return;
                };

                shared.set_status(
                    generation,
                    ConnectionStatus::Reconnecting {
                        attempt: backoff.attempt(),
                        delay,
                    },
                );
                tokio::time::sleep(delay).await;

                if !shared.is_current(generation) {
                    return;
                }

                match Self::dial(&url, timeout).await {
                    Ok(new_stream) => {
                        if !shared.is_current(generation) {
                            return;
                        }
                        tracing::info!("Reconnected to signaling server");
                        backoff.reset();
                        let (tx, new_rx) = mpsc::channel(100);
                        *shared.tx.write() = Some(tx);
                        shared.set_status(generation, ConnectionStatus::Connected);
                        ws_stream = new_stream;
                        rx = new_rx;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Reconnect attempt {} failed: {}", backoff.attempt(), e);
                    }
                }
            }
        }
    }

    /// Liest und schreibt bis die Verbindung endet
    async fn pump(ws_stream: WsStream, mut rx: mpsc::Receiver<String>, shared: &Shared) {
        let (mut write, mut read) = ws_stream.split();
        let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
        let mut heartbeat = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    None => {
                        // Sender wurde von disconnect() verworfen
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                },
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => Self::handle_frame(&text, shared),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                        break;
                    }
                }
            }
        }
    }

    /// Verarbeitet einen eingehenden Frame
    fn handle_frame(text: &str, shared: &Shared) {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => {
                tracing::debug!(
                    "Received {} from '{}'",
                    envelope.message.kind(),
                    envelope.from_id
                );
                let _ = shared.event_tx.send(SignalingEvent::Message(envelope));
            }
            Err(e) => {
                tracing::debug!("Ignoring unparsable frame: {}", e);
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for SignalingClient {
    async fn connect(&self, local_id: &str) -> Result<(), SignalingError> {
        let url = self.url_for(local_id);
        let generation = {
            let mut state = self.shared.state.write();
            state.generation += 1;
            state.local_id = Some(local_id.to_string());
            state.generation
        };
        self.shared.tx.write().take();
        self.shared.set_status(generation, ConnectionStatus::Connecting);

        tracing::info!("Connecting to signaling server: {}", url);

        let ws_stream = match Self::dial(&url, self.connect_timeout).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                tracing::error!("Signaling connect failed: {}", e);
                self.shared
                    .set_status(generation, ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        if !self.shared.is_current(generation) {
            return Err(SignalingError::ConnectionFailed(
                "superseded by another connect or disconnect".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel::<String>(100);
        *self.shared.tx.write() = Some(tx);
        self.shared.set_status(generation, ConnectionStatus::Connected);

        tokio::spawn(Self::supervise(
            Arc::clone(&self.shared),
            url,
            self.connect_timeout,
            self.reconnect.clone(),
            generation,
            ws_stream,
            rx,
        ));

        Ok(())
    }

    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let (from_id, connected) = {
            let state = self.shared.state.read();
            (
                state.local_id.clone().unwrap_or_default(),
                state.status == ConnectionStatus::Connected,
            )
        };
        if !connected {
            return Err(SignalingError::NotConnected);
        }

        let kind = message.kind();
        let text = serde_json::to_string(&Envelope::new(from_id, message))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        let tx = self.shared.tx.read();
        let tx = tx.as_ref().ok_or(SignalingError::NotConnected)?;

        // try_send ist non-blocking
        tx.try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        tracing::debug!("Sent {}", kind);
        Ok(())
    }

    fn disconnect(&self) {
        let generation = {
            let mut state = self.shared.state.write();
            state.generation += 1;
            state.generation
        };
        self.shared.tx.write().take();
        self.shared
            .set_status(generation, ConnectionStatus::Disconnected);
        tracing::info!("Disconnected from signaling server");
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.shared.event_tx.subscribe()
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.state.read().status.clone()
    }

    fn local_id(&self) -> Option<String> {
        self.shared.state.read().local_id.clone()
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("state", &*self.shared.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(url: &str) -> CallConfig {
        CallConfig {
            signaling_url: url.to_string(),
            connect_timeout_ms: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_user_id_query() {
        let client = SignalingClient::new(&config_for("ws://127.0.0.1:9/ws")).unwrap();
        let url = client.url_for("alice smith");
        assert_eq!(url.as_str(), "ws://127.0.0.1:9/ws?userId=alice+smith");
    }

    #[test]
    fn test_send_before_connect_fails() {
        let client = SignalingClient::new(&config_for("ws://127.0.0.1:9")).unwrap();
        let result = client.send(SignalingMessage::EndCall {
            target_id: "bob".to_string(),
        });
        assert_eq!(result, Err(SignalingError::NotConnected));
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_times_out_when_handshake_stalls() {
        // Akzeptiert TCP, beantwortet aber den WebSocket-Handshake nie
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let client = SignalingClient::new(&config_for(&format!("ws://{}", addr))).unwrap();
        let result = client.connect("alice").await;

        assert_eq!(
            result,
            Err(SignalingError::Timeout(Duration::from_millis(200)))
        );
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        hold.abort();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = SignalingClient::new(&config_for(&format!("ws://{}", addr))).unwrap();
        let result = client.connect("alice").await;
        assert!(matches!(result, Err(SignalingError::ConnectionFailed(_))));
    }
}
