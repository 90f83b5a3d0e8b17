//! Fakes für Media Devices und Peer-Transport

use super::media::{LocalMedia, MediaDevices, MediaError, RemoteMedia};
use super::peer::{PeerError, PeerEvent, PeerEventSink, PeerTransport, PeerTransportFactory};
use super::state::PeerConnectionState;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

// ============================================================================
// MEDIA
// ============================================================================

pub struct FakeMediaDevices {
    handles: Mutex<Vec<LocalMedia>>,
    failure: Mutex<Option<MediaError>>,
    gate: watch::Sender<bool>,
}

impl FakeMediaDevices {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            handles: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            gate,
        })
    }

    /// Blockiert alle folgenden Aufnahmen bis `release`
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail_with(&self, error: MediaError) {
        *self.failure.lock() = Some(error);
    }

    pub fn handles(&self) -> Vec<LocalMedia> {
        self.handles.lock().clone()
    }

    pub fn all_stopped(&self) -> bool {
        self.handles.lock().iter().all(|media| !media.is_live())
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire_audio(&self) -> Result<LocalMedia, MediaError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let media = LocalMedia::new("fake");
        self.handles.lock().push(media.clone());
        Ok(media)
    }
}

// ============================================================================
// PEER TRANSPORT
// ============================================================================

#[derive(Default)]
struct FakePeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    connected: bool,
    closes: usize,
}

pub struct FakePeer {
    id: usize,
    sink: PeerEventSink,
    auto_connect: bool,
    state: Mutex<FakePeerState>,
}

impl FakePeer {
    pub fn emit(&self, event: PeerEvent) {
        self.sink.emit(event);
    }

    pub fn emit_state(&self, state: PeerConnectionState) {
        self.emit(PeerEvent::ConnectionState(state));
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 192.168.0.{} 50000 typ host",
                self.id, self.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Verbindet, sobald beide Descriptions gesetzt sind
    fn maybe_connect(&self) {
        let connect = {
            let mut state = self.state.lock();
            let ready = state.local.is_some() && state.remote.is_some() && !state.connected;
            if ready && self.auto_connect {
                state.connected = true;
                true
            } else {
                false
            }
        };
        if connect {
            self.emit_state(PeerConnectionState::Connecting);
            self.emit_state(PeerConnectionState::Connected);
            self.emit(PeerEvent::RemoteTrack(RemoteMedia::new(
                format!("track-{}", self.id),
                format!("stream-{}", self.id),
                "audio/opus",
            )));
        }
    }
}

#[async_trait]
impl PeerTransport for Arc<FakePeer> {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = SessionDescription::offer(format!("fake-offer-{}", self.id));
        self.state.lock().local = Some(offer.clone());
        self.emit(PeerEvent::LocalCandidate(self.local_candidate()));
        self.maybe_connect();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = SessionDescription::answer(format!("fake-answer-{}", self.id));
        self.state.lock().local = Some(answer.clone());
        self.emit(PeerEvent::LocalCandidate(self.local_candidate()));
        self.maybe_connect();
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        self.state.lock().remote = Some(description.clone());
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.state.lock().applied.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closes += 1;
        self.emit_state(PeerConnectionState::Closed);
    }
}

pub struct FakePeerFactory {
    auto_connect: bool,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    /// Peers verbinden automatisch nach Offer/Answer
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            auto_connect: true,
            peers: Mutex::new(Vec::new()),
        })
    }

    /// Peers bleiben in `new`, bis der Test Events auslöst
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            auto_connect: false,
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn all_closed(&self) -> bool {
        self.peers.lock().iter().all(|peer| peer.is_closed())
    }
}

#[async_trait]
impl PeerTransportFactory for FakePeerFactory {
    async fn create(
        &self,
        _local_media: &LocalMedia,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>, PeerError> {
        let mut peers = self.peers.lock();
        let peer = Arc::new(FakePeer {
            id: peers.len() + 1,
            sink: events,
            auto_connect: self.auto_connect,
            state: Mutex::new(FakePeerState::default()),
        });
        peers.push(Arc::clone(&peer));
        Ok(Box::new(peer))
    }
}
