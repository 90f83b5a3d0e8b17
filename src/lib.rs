//! Call Core - Signaling und Anrufsteuerung für P2P Voice Calls
//!
//! Bausteine:
//! - Signaling-Transport (WebSocket mit Reconnect, oder in-process)
//! - Relay-Server, der Offer/Answer/Candidates zwischen Identitäten routet
//! - Call Engine: eine State Machine pro lokaler Identität über WebRTC
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use call_core::{CallConfig, Topic};
//!
//! call_core::init_tracing();
//! let manager = call_core::build_call_manager(CallConfig::from_env()?)?;
//! manager.subscribe(Topic::IncomingCall, |event| println!("{:?}", event));
//! manager.connect("alice").await?;
//! manager.start_call("bob").await?;
//! # Ok(())
//! # }
//! ```

pub mod call_engine;
pub mod config;
pub mod relay;
pub mod signaling;

pub use call_engine::{
    CallError, CallEvent, CallManager, CallPhase, CallState, EndReason, LocalMedia, MediaDevices,
    NullMediaDevices, PeerConnectionState, RemoteMedia, Topic, WebRtcPeerFactory,
};
pub use config::{CallConfig, ConfigError};
pub use relay::{RelayServer, Router};
pub use signaling::{
    ConnectionStatus, LoopbackTransport, SignalingClient, SignalingError, SignalingMessage,
    SignalingTransport,
};

use std::sync::Arc;

/// Initialisiert Logging (`RUST_LOG` plus Standard-Direktiven)
///
/// Mehrfacher Aufruf ist harmlos.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["call_core=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Baut einen [`CallManager`] mit WebSocket-Signaling und WebRTC
///
/// Mit dem Feature `device-audio` nimmt er das Standard-Mikrofon auf,
/// sonst liefert er stille Aufnahme-Handles.
pub fn build_call_manager(config: CallConfig) -> Result<CallManager, SignalingError> {
    let transport = Arc::new(SignalingClient::new(&config)?);
    let peers = Arc::new(WebRtcPeerFactory::from_config(&config));

    #[cfg(feature = "device-audio")]
    let media: Arc<dyn MediaDevices> = Arc::new(call_engine::CpalMediaDevices);
    #[cfg(not(feature = "device-audio"))]
    let media: Arc<dyn MediaDevices> = Arc::new(NullMediaDevices);

    tracing::info!("Call manager using signaling server {}", config.signaling_url);
    Ok(CallManager::new(config, transport, media, peers))
}
