//! Abstrakter Signaling-Transport
//!
//! Die Call Engine kennt nur dieses Trait. Implementierungen:
//! [`SignalingClient`](super::SignalingClient) (WebSocket) und
//! [`LoopbackTransport`](super::LoopbackTransport) (in-process).

use super::messages::{Envelope, SignalingMessage};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Verbindungsstatus des Transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// Verbindung verloren, nächster Versuch nach `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Getrennt (manuell oder vor dem ersten Connect)
    Disconnected,
    /// Reconnect-Versuche aufgebraucht
    Failed(String),
}

/// Events die vom Transport ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Status(ConnectionStatus),
    Message(Envelope),
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Verbindet unter der lokalen Identität
    async fn connect(&self, local_id: &str) -> Result<(), SignalingError>;

    /// Sendet sofort oder schlägt synchron fehl (nie stilles Verwerfen)
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Trennt ohne Reconnect
    fn disconnect(&self);

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;

    fn status(&self) -> ConnectionStatus;

    fn local_id(&self) -> Option<String>;

    fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }
}
