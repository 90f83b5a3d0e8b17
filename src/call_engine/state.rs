//! Call State - Phasen der State Machine und der daraus abgeleitete Snapshot

use super::media::{LocalMedia, RemoteMedia};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Verbindungsstatus des Peer-Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wer den Anruf begonnen hat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Receiver,
}

/// Phasen eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    /// Ausgehender Anruf, Offer unterwegs
    Dialing { remote_id: String },
    /// Eingehender Anruf, wartet auf Annahme
    Ringing { remote_id: String },
    /// Offer/Answer ausgetauscht, ICE läuft
    Negotiating { remote_id: String },
    Active { remote_id: String },
    /// Kurzzeitig, danach `Idle`
    Ended,
    /// Kurzzeitig, danach `Idle`
    Failed { reason: String },
}

impl CallPhase {
    pub fn name(&self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::Dialing { .. } => "dialing",
            CallPhase::Ringing { .. } => "ringing",
            CallPhase::Negotiating { .. } => "negotiating",
            CallPhase::Active { .. } => "active",
            CallPhase::Ended => "ended",
            CallPhase::Failed { .. } => "failed",
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            CallPhase::Dialing { remote_id }
            | CallPhase::Ringing { remote_id }
            | CallPhase::Negotiating { remote_id }
            | CallPhase::Active { remote_id } => Some(remote_id),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CallPhase::Idle)
    }
}

/// Snapshot für die UI
///
/// Wird bei jeder Änderung neu aus der aktuellen Session abgeleitet,
/// nie in-place verändert.
#[derive(Debug, Clone, Default)]
pub struct CallState {
    pub phase: CallPhase,
    pub is_in_call: bool,
    pub connection_state: PeerConnectionState,
    pub local_media: Option<LocalMedia>,
    pub remote_media: Option<RemoteMedia>,
    pub remote_id: Option<String>,
    pub call_id: Option<Uuid>,
    pub connected_at: Option<DateTime<Utc>>,
    pub muted: bool,
}

impl CallState {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Gesprächsdauer seit `connected_at`
    pub fn duration(&self) -> Option<Duration> {
        let connected_at = self.connected_at?;
        (Utc::now() - connected_at).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_snapshot_is_empty() {
        let state = CallState::idle();
        assert!(state.phase.is_idle());
        assert!(!state.is_in_call);
        assert_eq!(state.connection_state, PeerConnectionState::New);
        assert!(state.local_media.is_none());
        assert!(state.remote_media.is_none());
        assert!(state.duration().is_none());
    }

    #[test]
    fn test_phase_remote_id() {
        let phase = CallPhase::Ringing {
            remote_id: "bob".to_string(),
        };
        assert_eq!(phase.remote_id(), Some("bob"));
        assert_eq!(phase.name(), "ringing");
        assert_eq!(CallPhase::Ended.remote_id(), None);
    }

    #[test]
    fn test_duration_since_connect() {
        let state = CallState {
            connected_at: Some(Utc::now() - chrono::Duration::seconds(5)),
            ..CallState::idle()
        };
        assert!(state.duration().unwrap() >= Duration::from_secs(5));
    }
}
