//! WebSocket Relay-Server
//!
//! Clients verbinden sich mit `ws://host/?userId=<id>`. Jeder Text-Frame
//! ist ein [`Envelope`]; `fromId` wird vom Server gesetzt.

use super::router::Router;
use crate::signaling::Envelope;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

/// Signaling-Relay
pub struct RelayServer {
    listener: TcpListener,
    router: Arc<Router>,
}

impl RelayServer {
    /// Bindet den Server an `addr`
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: Arc::new(Router::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Nimmt Verbindungen an, bis der Task abgebrochen wird
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Relay listening on {}", addr);
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let router = Arc::clone(&self.router);
                    tokio::spawn(async move {
                        handle_connection(stream, peer_addr, router).await;
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Liest `userId` aus dem Query-String
fn user_id_from_query(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "userId")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, router: Arc<Router>) {
    let mut user_id = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match user_id_from_query(request.uri().query()) {
            Some(id) => {
                user_id = Some(id);
                Ok(response)
            }
            None => {
                let mut error = ErrorResponse::new(Some("missing userId".to_string()));
                *error.status_mut() = StatusCode::BAD_REQUEST;
                Err(error)
            }
        }
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            tracing::debug!("Handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };
    let Some(user_id) = user_id else {
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let conn_id = router.register(&user_id, tx);
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!("Failed to encode frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::debug!("Failed to write to '{}': {}", user_id, e);
                        break;
                    }
                }
                None => {
                    // Registrierung wurde durch eine neuere Verbindung ersetzt
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        router.route(&user_id, envelope.message);
                    }
                    Err(e) => {
                        tracing::debug!("Ignoring malformed frame from '{}': {}", user_id, e);
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!("WebSocket error for '{}': {}", user_id, e);
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    router.unregister(&user_id, conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_from_query() {
        assert_eq!(
            user_id_from_query(Some("userId=alice")),
            Some("alice".to_string())
        );
        assert_eq!(
            user_id_from_query(Some("foo=1&userId=bob%20b")),
            Some("bob b".to_string())
        );
        assert_eq!(user_id_from_query(Some("userId=")), None);
        assert_eq!(user_id_from_query(Some("foo=1")), None);
        assert_eq!(user_id_from_query(None), None);
    }
}
