//! Signaling Module - Transport zum Relay
//!
//! Dieses Modul verwaltet:
//! - Wire-Format der Signaling-Nachrichten
//! - WebSocket-Verbindung mit Reconnect
//! - In-process Transport für eingebettete Relays

mod backoff;
mod client;
mod loopback;
mod messages;
mod transport;

pub use backoff::Backoff;
pub use client::SignalingClient;
pub use loopback::LoopbackTransport;
pub use messages::{Envelope, IceCandidate, SdpType, SessionDescription, SignalingMessage};
pub use transport::{ConnectionStatus, SignalingError, SignalingEvent, SignalingTransport};
