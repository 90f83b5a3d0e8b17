//! Message Types für das Signaling-Protokoll
//!
//! Ein JSON-Objekt pro WebSocket-Frame. SDP und ICE Candidates haben
//! die Form von `RTCSessionDescriptionInit` bzw. `RTCIceCandidateInit`,
//! damit Browser-Clients am selben Relay teilnehmen können.

use serde::{Deserialize, Serialize};

// ============================================================================
// SDP / ICE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session Description (Offer oder Answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// SIGNALING MESSAGES
// ============================================================================

/// Alle Nachrichten, die über das Relay laufen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// SDP Offer an den Angerufenen
    CallOffer {
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(rename = "sdpOffer")]
        sdp_offer: SessionDescription,
    },

    /// Antwort des Angerufenen; `sdp_answer` fehlt bei Ablehnung
    CallAnswer {
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(rename = "sdpAnswer", default)]
        sdp_answer: Option<SessionDescription>,
        accepted: bool,
    },

    /// Einzelner ICE Candidate
    IceCandidate {
        #[serde(rename = "targetId")]
        target_id: String,
        candidate: IceCandidate,
    },

    /// Auflegen
    EndCall {
        #[serde(rename = "targetId")]
        target_id: String,
    },

    /// Vom Relay: Anruf konnte nicht zugestellt werden
    CallFailed {
        reason: String,
        /// Nicht erreichbare Identität; fehlt bei älteren Relays
        #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    /// Vom Relay: aktuell verbundene Benutzer (nach dem Connect)
    ActiveUsers { users: Vec<String> },

    /// Vom Relay: ein Benutzer hat die Verbindung getrennt
    UserDisconnected {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

impl SignalingMessage {
    /// Ziel-Identität (nur für adressierte Nachrichten)
    pub fn target_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::CallOffer { target_id, .. }
            | SignalingMessage::CallAnswer { target_id, .. }
            | SignalingMessage::IceCandidate { target_id, .. }
            | SignalingMessage::EndCall { target_id } => Some(target_id),
            _ => None,
        }
    }

    /// Wire-Name, für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::CallOffer { .. } => "call-offer",
            SignalingMessage::CallAnswer { .. } => "call-answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::EndCall { .. } => "end-call",
            SignalingMessage::CallFailed { .. } => "call-failed",
            SignalingMessage::ActiveUsers { .. } => "active-users",
            SignalingMessage::UserDisconnected { .. } => "user-disconnected",
        }
    }

    /// Darf nicht stillschweigend verloren gehen
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            SignalingMessage::CallOffer { .. } | SignalingMessage::EndCall { .. }
        )
    }
}

/// Ein Frame auf dem Draht: Nachricht plus Absender
///
/// `from_id` wird vom Transport gesetzt, nie vom Aufrufer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "fromId", default)]
    pub from_id: String,
    #[serde(flatten)]
    pub message: SignalingMessage,
}

impl Envelope {
    pub fn new(from_id: impl Into<String>, message: SignalingMessage) -> Self {
        Self {
            from_id: from_id.into(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_format() {
        let envelope = Envelope::new(
            "alice",
            SignalingMessage::CallOffer {
                target_id: "bob".to_string(),
                sdp_offer: SessionDescription::offer("v=0"),
            },
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "call-offer",
                "fromId": "alice",
                "targetId": "bob",
                "sdpOffer": { "type": "offer", "sdp": "v=0" }
            })
        );
    }

    #[test]
    fn test_rejection_without_answer() {
        let raw = r#"{"type":"call-answer","fromId":"bob","targetId":"alice","accepted":false}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();

        assert_eq!(envelope.from_id, "bob");
        assert_eq!(
            envelope.message,
            SignalingMessage::CallAnswer {
                target_id: "alice".to_string(),
                sdp_answer: None,
                accepted: false,
            }
        );
    }

    #[test]
    fn test_browser_candidate_shape() {
        let raw = r#"{
            "type": "ice-candidate",
            "fromId": "bob",
            "targetId": "alice",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        }"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();

        match envelope.message {
            SignalingMessage::IceCandidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_missing_from_id_defaults_to_empty() {
        let raw = r#"{"type":"end-call","targetId":"bob"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.from_id, "");
        assert_eq!(envelope.message.target_id(), Some("bob"));
        assert!(envelope.message.is_critical());
    }

    #[test]
    fn test_relay_notices() {
        let failed: Envelope =
            serde_json::from_str(r#"{"type":"call-failed","reason":"user offline"}"#).unwrap();
        assert_eq!(failed.message.kind(), "call-failed");
        assert_eq!(failed.message.target_id(), None);
        assert_eq!(
            failed.message,
            SignalingMessage::CallFailed {
                reason: "user offline".to_string(),
                user_id: None,
            }
        );

        let offline: Envelope = serde_json::from_str(
            r#"{"type":"call-failed","reason":"user offline","userId":"bob"}"#,
        )
        .unwrap();
        assert_eq!(
            offline.message,
            SignalingMessage::CallFailed {
                reason: "user offline".to_string(),
                user_id: Some("bob".to_string()),
            }
        );

        let gone: Envelope =
            serde_json::from_str(r#"{"type":"user-disconnected","userId":"carol"}"#).unwrap();
        assert_eq!(
            gone.message,
            SignalingMessage::UserDisconnected {
                user_id: "carol".to_string()
            }
        );
    }
}
