//! Call Engine Module - Anrufsteuerung
//!
//! Dieses Modul verwaltet:
//! - State Machine pro lokaler Identität (`CallManager`)
//! - Peer Sessions und WebRTC Peer Connections
//! - Audio Capture (Mikrofon)
//! - Events für die UI

mod candidates;
mod engine;
mod media;
mod notifier;
mod peer;
mod state;
mod webrtc_peer;

#[cfg(test)]
pub(crate) mod test_support;

pub use candidates::{Admission, CandidateBuffer};
pub use engine::{CallError, CallManager};
#[cfg(feature = "device-audio")]
pub use media::CpalMediaDevices;
pub use media::{
    LocalMedia, MediaDevices, MediaError, NullMediaDevices, RemoteMedia, CHANNELS, FRAME_SIZE,
    SAMPLE_RATE,
};
pub use notifier::{CallEvent, EndReason, EventNotifier, ListenerId, Topic};
pub use peer::{PeerError, PeerEvent, PeerEventSink, PeerSession, PeerTransport, PeerTransportFactory};
pub use state::{CallPhase, CallRole, CallState, PeerConnectionState};
pub use webrtc_peer::{WebRtcPeer, WebRtcPeerFactory};
