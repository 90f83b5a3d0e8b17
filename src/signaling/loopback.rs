//! In-process Signaling-Transport
//!
//! Hängt direkt an einem [`Router`], ohne WebSocket dazwischen.
//! Nützlich für eingebettete Relays und für Tests.

use super::messages::SignalingMessage;
use super::transport::{ConnectionStatus, SignalingError, SignalingEvent, SignalingTransport};
use crate::relay::{ConnectionId, Router};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug)]
struct LoopbackState {
    status: ConnectionStatus,
    local_id: Option<String>,
    conn_id: Option<ConnectionId>,
    generation: u64,
}

/// Transport, der Nachrichten direkt über einen geteilten Router leitet
pub struct LoopbackTransport {
    router: Arc<Router>,
    state: Arc<RwLock<LoopbackState>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl LoopbackTransport {
    pub fn new(router: Arc<Router>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            router,
            state: Arc::new(RwLock::new(LoopbackState {
                status: ConnectionStatus::Disconnected,
                local_id: None,
                conn_id: None,
                generation: 0,
            })),
            event_tx,
        }
    }

    /// Simuliert einen Verbindungsabbruch durch das Relay
    ///
    /// Es gibt keinen Reconnect: der Status wird `Failed`.
    pub fn drop_connection(&self) {
        let registration = {
            let state = self.state.read();
            state.local_id.clone().zip(state.conn_id)
        };
        if let Some((local_id, conn_id)) = registration {
            self.router.unregister(&local_id, conn_id);
        }
    }

    /// Stellt ein Event direkt zu, am Router vorbei
    #[cfg(test)]
    pub(crate) fn inject(&self, event: SignalingEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_status(
        state: &RwLock<LoopbackState>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        generation: u64,
        status: ConnectionStatus,
    ) {
        {
            let mut state = state.write();
            if state.generation != generation {
                return;
            }
            state.status = status.clone();
        }
        let _ = event_tx.send(SignalingEvent::Status(status));
    }
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    async fn connect(&self, local_id: &str) -> Result<(), SignalingError> {
        if self.is_connected() {
            self.disconnect();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let generation = {
            let mut state = self.state.write();
            state.generation += 1;
            state.local_id = Some(local_id.to_string());
            state.generation
        };

        Self::set_status(
            &self.state,
            &self.event_tx,
            generation,
            ConnectionStatus::Connected,
        );
        let conn_id = self.router.register(local_id, tx);
        self.state.write().conn_id = Some(conn_id);

        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let _ = event_tx.send(SignalingEvent::Message(envelope));
            }
            // Router hat die Registrierung verworfen
            Self::set_status(
                &state,
                &event_tx,
                generation,
                ConnectionStatus::Failed("connection closed by relay".to_string()),
            );
        });

        tracing::debug!("Loopback transport connected as '{}'", local_id);
        Ok(())
    }

    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let local_id = {
            let state = self.state.read();
            if state.status != ConnectionStatus::Connected {
                return Err(SignalingError::NotConnected);
            }
            state.local_id.clone().ok_or(SignalingError::NotConnected)?
        };
        self.router.route(&local_id, message);
        Ok(())
    }

    fn disconnect(&self) {
        let (registration, generation) = {
            let mut state = self.state.write();
            state.generation += 1;
            let registration = state.local_id.clone().zip(state.conn_id.take());
            (registration, state.generation)
        };
        if let Some((local_id, conn_id)) = registration {
            self.router.unregister(&local_id, conn_id);
        }
        Self::set_status(
            &self.state,
            &self.event_tx,
            generation,
            ConnectionStatus::Disconnected,
        );
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    fn status(&self) -> ConnectionStatus {
        self.state.read().status.clone()
    }

    fn local_id(&self) -> Option<String> {
        self.state.read().local_id.clone()
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("state", &*self.state.read())
            .finish()
    }
}
