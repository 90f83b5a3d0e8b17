//! Peer Session - kapselt genau eine ausgehandelte Peer-Verbindung
//!
//! Der eigentliche Transport steckt hinter [`PeerTransport`]; die
//! Produktions-Implementierung ist
//! [`WebRtcPeerFactory`](super::WebRtcPeerFactory).

use super::candidates::{Admission, CandidateBuffer};
use super::media::{LocalMedia, RemoteMedia};
use super::state::PeerConnectionState;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Renegotiation not supported: {0}")]
    Renegotiation(String),

    #[error("Peer session is closed")]
    Closed,
}

// ============================================================================
// PEER EVENTS
// ============================================================================

/// Events vom Peer-Transport
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokaler ICE Candidate, sofort an die Gegenseite weiterleiten
    LocalCandidate(IceCandidate),
    ConnectionState(PeerConnectionState),
    RemoteTrack(RemoteMedia),
}

/// Sender für Peer-Events, markiert mit der Epoche der Session
///
/// Events einer alten Session kommen so nie bei einer neuen an.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// `false` wenn niemand mehr zuhört
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send((self.epoch, event)).is_ok()
    }
}

// ============================================================================
// TRANSPORT TRAITS
// ============================================================================

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, description: &SessionDescription)
        -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Baut einen Transport mit angehängter lokaler Aufnahme
    async fn create(
        &self,
        local_media: &LocalMedia,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>, PeerError>;
}

// ============================================================================
// PEER SESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    New,
    AwaitingAnswer,
    Stable,
}

pub struct PeerSession {
    transport: Box<dyn PeerTransport>,
    local_media: LocalMedia,
    remote_media: Mutex<Option<RemoteMedia>>,
    negotiation: Mutex<Negotiation>,
    candidates: Mutex<CandidateBuffer>,
    /// Serialisiert das Anwenden von Candidates (Flush vs. direkt)
    apply_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl PeerSession {
    pub fn new(transport: Box<dyn PeerTransport>, local_media: LocalMedia) -> Self {
        Self {
            transport,
            local_media,
            remote_media: Mutex::new(None),
            negotiation: Mutex::new(Negotiation::New),
            candidates: Mutex::new(CandidateBuffer::new()),
            apply_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_media(&self) -> LocalMedia {
        self.local_media.clone()
    }

    pub fn remote_media(&self) -> Option<RemoteMedia> {
        self.remote_media.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Anrufer-Seite: Offer erzeugen
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        {
            let mut negotiation = self.negotiation.lock();
            if *negotiation != Negotiation::New {
                return Err(PeerError::Renegotiation(
                    "offer already created".to_string(),
                ));
            }
            *negotiation = Negotiation::AwaitingAnswer;
        }

        let offer = self.transport.create_offer().await?;
        tracing::debug!("Created SDP offer");
        Ok(offer)
    }

    /// Angerufenen-Seite: Remote Offer anwenden und Answer erzeugen
    pub async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if offer.kind != SdpType::Offer {
            return Err(PeerError::InvalidSdp("expected an offer".to_string()));
        }
        {
            let mut negotiation = self.negotiation.lock();
            if *negotiation != Negotiation::New {
                return Err(PeerError::Renegotiation(
                    "session already negotiated".to_string(),
                ));
            }
            *negotiation = Negotiation::Stable;
        }

        self.transport.set_remote_description(offer).await?;
        self.flush_candidates().await;

        let answer = self.transport.create_answer().await?;
        tracing::debug!("Created SDP answer");
        Ok(answer)
    }

    /// Anrufer-Seite: Answer der Gegenseite anwenden (genau einmal)
    pub async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        if answer.kind != SdpType::Answer {
            return Err(PeerError::InvalidSdp("expected an answer".to_string()));
        }
        {
            let mut negotiation = self.negotiation.lock();
            if *negotiation != Negotiation::AwaitingAnswer {
                return Err(PeerError::Renegotiation(
                    "session is not awaiting an answer".to_string(),
                ));
            }
            *negotiation = Negotiation::Stable;
        }

        self.transport.set_remote_description(answer).await?;
        self.flush_candidates().await;
        tracing::debug!("Applied SDP answer");
        Ok(())
    }

    /// Wendet den Candidate an oder puffert ihn bis zur Remote Description
    pub async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        let _guard = self.apply_lock.lock().await;

        let admission = self.candidates.lock().admit(candidate);
        match admission {
            Admission::ApplyNow => self.transport.add_ice_candidate(candidate).await,
            Admission::Buffered => {
                tracing::debug!("Buffered remote ICE candidate");
                Ok(())
            }
            Admission::Duplicate => {
                tracing::debug!("Ignoring duplicate ICE candidate");
                Ok(())
            }
        }
    }

    /// Übernimmt früh eingetroffene Candidates in Empfangsreihenfolge
    pub async fn absorb(&self, early: CandidateBuffer) -> Result<(), PeerError> {
        self.ensure_open()?;
        let _guard = self.apply_lock.lock().await;

        let apply_now = self.candidates.lock().absorb(early);
        for candidate in &apply_now {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn flush_candidates(&self) {
        let _guard = self.apply_lock.lock().await;

        let pending = self.candidates.lock().drain();
        if !pending.is_empty() {
            tracing::debug!("Applying {} buffered ICE candidates", pending.len());
        }
        for candidate in &pending {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply buffered ICE candidate: {}", e);
            }
        }
    }

    pub fn set_remote_media(&self, media: RemoteMedia) {
        if self.is_closed() {
            media.end();
            return;
        }
        if let Some(previous) = self.remote_media.lock().replace(media) {
            previous.end();
        }
    }

    /// Gibt Transport und Aufnahme frei; mehrfacher Aufruf ist ein No-op
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.local_media.stop();
        if let Some(remote) = self.remote_media.lock().take() {
            remote.end();
        }
        self.candidates.lock().clear();
        self.transport.close().await;

        tracing::info!("Peer session closed");
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("negotiation", &*self.negotiation.lock())
            .field("local_media", &self.local_media)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::test_support::{FakePeer, FakePeerFactory};

    async fn session() -> (PeerSession, std::sync::Arc<FakePeer>, LocalMedia) {
        let factory = FakePeerFactory::manual();
        let (tx, _rx) = mpsc::unbounded_channel();
        let media = LocalMedia::new("test");
        let transport = factory
            .create(&media, PeerEventSink::new(1, tx))
            .await
            .unwrap();
        let peer = factory.last().unwrap();
        (PeerSession::new(transport, media.clone()), peer, media)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.1 {} typ host", n, 5000 + n))
    }

    #[tokio::test]
    async fn test_candidates_flushed_after_remote_offer() {
        let (session, peer, _) = session().await;
        session.add_remote_candidate(&candidate(1)).await.unwrap();
        session.add_remote_candidate(&candidate(2)).await.unwrap();
        assert!(peer.applied_candidates().is_empty());

        let answer = session
            .accept_offer(&SessionDescription::offer("remote-offer"))
            .await
            .unwrap();
        assert_eq!(answer.kind, SdpType::Answer);
        assert_eq!(peer.applied_candidates(), vec![candidate(1), candidate(2)]);

        session.add_remote_candidate(&candidate(3)).await.unwrap();
        session.add_remote_candidate(&candidate(3)).await.unwrap();
        assert_eq!(
            peer.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
    }

    #[tokio::test]
    async fn test_candidates_flushed_after_remote_answer() {
        let (session, peer, _) = session().await;
        session.create_offer().await.unwrap();

        // Candidates des Angerufenen können vor seinem Answer ankommen
        session.add_remote_candidate(&candidate(1)).await.unwrap();
        session.add_remote_candidate(&candidate(2)).await.unwrap();
        assert!(peer.applied_candidates().is_empty());

        session
            .apply_answer(&SessionDescription::answer("remote-answer"))
            .await
            .unwrap();
        assert_eq!(
            peer.remote_description(),
            Some(SessionDescription::answer("remote-answer"))
        );
        assert_eq!(peer.applied_candidates(), vec![candidate(1), candidate(2)]);

        session.add_remote_candidate(&candidate(3)).await.unwrap();
        assert_eq!(
            peer.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
    }

    #[tokio::test]
    async fn test_apply_answer_twice_is_renegotiation() {
        let (session, _, _) = session().await;
        session.create_offer().await.unwrap();

        let answer = SessionDescription::answer("remote-answer");
        session.apply_answer(&answer).await.unwrap();
        assert!(matches!(
            session.apply_answer(&answer).await,
            Err(PeerError::Renegotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_answer_without_offer_fails() {
        let (session, _, _) = session().await;
        assert!(matches!(
            session
                .apply_answer(&SessionDescription::answer("remote-answer"))
                .await,
            Err(PeerError::Renegotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_type_is_checked() {
        let (session, _, _) = session().await;
        assert!(matches!(
            session
                .accept_offer(&SessionDescription::answer("wrong"))
                .await,
            Err(PeerError::InvalidSdp(_))
        ));
    }

    #[tokio::test]
    async fn test_close_releases_everything_once() {
        let (session, peer, media) = session().await;
        let remote = RemoteMedia::new("track", "stream", "audio/opus");
        session.set_remote_media(remote.clone());

        session.close().await;
        session.close().await;

        assert!(!media.is_live());
        assert!(!remote.is_live());
        assert!(session.remote_media().is_none());
        assert_eq!(peer.close_count(), 1);
        assert_eq!(
            session.add_remote_candidate(&candidate(1)).await,
            Err(PeerError::Closed)
        );
    }
}
