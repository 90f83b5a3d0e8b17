//! Call Engine - State Machine für genau einen Anruf pro Identität
//!
//! [`CallManager`] ist ein Handle auf einen Actor-Task. Alle Übergänge und
//! alle Zugriffe auf die Peer Session laufen seriell im Actor. Mikrofon-
//! Zugriff und Offer/Answer-Erzeugung laufen in eigenen Tasks und melden
//! sich mit der Epoche ihrer Session zurück; Ergebnisse einer inzwischen
//! beendeten Session werden beim Eintreffen freigegeben.

use super::candidates::CandidateBuffer;
use super::media::{MediaDevices, MediaError, RemoteMedia};
use super::notifier::{CallEvent, EndReason, EventNotifier, ListenerId, Topic};
use super::peer::{PeerError, PeerEvent, PeerEventSink, PeerSession, PeerTransportFactory};
use super::state::{CallPhase, CallRole, CallState, PeerConnectionState};
use crate::config::CallConfig;
use crate::signaling::{
    ConnectionStatus, Envelope, IceCandidate, SessionDescription, SignalingError, SignalingEvent,
    SignalingMessage, SignalingTransport,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Not connected to signaling server")]
    TransportNotConnected,

    #[error("Signaling error: {0}")]
    Transport(#[from] SignalingError),

    #[error("Media access failed: {0}")]
    MediaAccess(#[from] MediaError),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Peer connection failed: {0}")]
    PeerTransportFailure(String),

    #[error("Call failed: {0}")]
    Remote(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("No incoming call from '{0}'")]
    NoIncomingCall(String),

    #[error("Call was cancelled")]
    Cancelled,

    #[error("Call engine has shut down")]
    Shutdown,
}

impl From<PeerError> for CallError {
    fn from(e: PeerError) -> Self {
        CallError::Negotiation(e.to_string())
    }
}

/// Obergrenzen für Candidates, die vor dem Offer eintreffen
const MAX_EARLY_SENDERS: usize = 8;
const MAX_EARLY_CANDIDATES: usize = 64;

// ============================================================================
// CALL MANAGER
// ============================================================================

type Reply = oneshot::Sender<Result<(), CallError>>;

enum Command {
    StartCall {
        remote_id: String,
        reply: Reply,
    },
    AnswerCall {
        remote_id: String,
        offer: Option<SessionDescription>,
        accept: bool,
        reply: Reply,
    },
    EndCall {
        remote_id: Option<String>,
        reply: Reply,
    },
    SetMuted {
        muted: bool,
        reply: Reply,
    },
}

/// Handle auf die Call Engine einer lokalen Identität
///
/// Klonbar; der Actor läuft, solange ein Handle existiert.
#[derive(Clone)]
pub struct CallManager {
    commands: mpsc::Sender<Command>,
    transport: Arc<dyn SignalingTransport>,
    notifier: Arc<EventNotifier>,
    state: Arc<RwLock<CallState>>,
}

impl CallManager {
    /// Startet den Actor. Muss innerhalb einer Tokio Runtime laufen.
    pub fn new(
        config: CallConfig,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerTransportFactory>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(EventNotifier::new());
        let state = Arc::new(RwLock::new(CallState::idle()));
        let signaling_rx = transport.subscribe();

        let actor = CallActor {
            config,
            transport: Arc::clone(&transport),
            media,
            peers,
            notifier: Arc::clone(&notifier),
            state: Arc::clone(&state),
            session: None,
            early: HashMap::new(),
            epoch: 0,
            internal_tx,
            peer_tx,
        };
        tokio::spawn(actor.run(command_rx, internal_rx, peer_rx, signaling_rx));

        Self {
            commands: command_tx,
            transport,
            notifier,
            state,
        }
    }

    /// Verbindet mit dem Signaling-Server unter `local_id`
    pub async fn connect(&self, local_id: &str) -> Result<(), CallError> {
        self.transport.connect(local_id).await?;
        Ok(())
    }

    /// Trennt vom Signaling-Server; ein laufender Anruf wird beendet
    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn local_id(&self) -> Option<String> {
        self.transport.local_id()
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Kehrt zurück, sobald das Offer verschickt ist.
    pub async fn start_call(&self, remote_id: &str) -> Result<(), CallError> {
        let remote_id = remote_id.to_string();
        self.request(|reply| Command::StartCall { remote_id, reply })
            .await
    }

    /// Beantwortet einen eingehenden Anruf
    ///
    /// Ohne `offer` wird das mit `incoming-call` gemeldete Offer verwendet.
    pub async fn answer_call(
        &self,
        remote_id: &str,
        offer: Option<SessionDescription>,
        accept: bool,
    ) -> Result<(), CallError> {
        let remote_id = remote_id.to_string();
        self.request(|reply| Command::AnswerCall {
            remote_id,
            offer,
            accept,
            reply,
        })
        .await
    }

    pub async fn accept_call(&self, remote_id: &str) -> Result<(), CallError> {
        self.answer_call(remote_id, None, true).await
    }

    pub async fn decline_call(&self, remote_id: &str) -> Result<(), CallError> {
        self.answer_call(remote_id, None, false).await
    }

    /// Legt auf. Lokale Ressourcen werden immer freigegeben; ein Fehler
    /// bedeutet, dass die Gegenseite nicht benachrichtigt werden konnte.
    pub async fn end_call(&self, remote_id: Option<&str>) -> Result<(), CallError> {
        let remote_id = remote_id.map(str::to_string);
        self.request(|reply| Command::EndCall { remote_id, reply })
            .await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply })
            .await
    }

    pub fn is_muted(&self) -> bool {
        self.state.read().muted
    }

    /// Aktueller Snapshot
    pub fn state(&self) -> CallState {
        self.state.read().clone()
    }

    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> ListenerId
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(topic, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn events(&self, topic: Topic) -> mpsc::UnboundedReceiver<CallEvent> {
        self.notifier.events(topic)
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)?
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("CallManager")
            .field("local_id", &self.transport.local_id())
            .field("phase", &state.phase)
            .field("is_muted", &state.muted)
            .finish()
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

struct CallSession {
    epoch: u64,
    call_id: Uuid,
    remote_id: String,
    role: CallRole,
    phase: CallPhase,
    connection_state: PeerConnectionState,
    peer: Option<Arc<PeerSession>>,
    /// Remote Candidates, solange noch keine Peer Session existiert
    candidates: CandidateBuffer,
    /// Lokale Candidates, bis Offer bzw. Answer verschickt ist
    outgoing: Vec<IceCandidate>,
    signaled: bool,
    /// Offer eines eingehenden Anrufs
    offer: Option<SessionDescription>,
    early_remote: Option<RemoteMedia>,
    connected_at: Option<DateTime<Utc>>,
    muted: bool,
    pending: Option<Reply>,
    ring_timer: Option<JoinHandle<()>>,
}

impl CallSession {
    fn new(epoch: u64, remote_id: String, role: CallRole, phase: CallPhase) -> Self {
        Self {
            epoch,
            call_id: Uuid::new_v4(),
            remote_id,
            role,
            phase,
            connection_state: PeerConnectionState::New,
            peer: None,
            candidates: CandidateBuffer::new(),
            outgoing: Vec::new(),
            signaled: false,
            offer: None,
            early_remote: None,
            connected_at: None,
            muted: false,
            pending: None,
            ring_timer: None,
        }
    }

    /// Weiß die Gegenseite schon von diesem Anruf?
    fn remote_knows(&self) -> bool {
        self.role == CallRole::Receiver || self.signaled
    }

    fn resolve(&mut self, result: Result<(), CallError>) {
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(result);
        }
    }
}

// ============================================================================
// ACTOR
// ============================================================================

type Prepared = Result<(Arc<PeerSession>, SessionDescription), CallError>;

enum Internal {
    OfferReady { epoch: u64, result: Prepared },
    AnswerReady { epoch: u64, result: Prepared },
    RingTimeout { epoch: u64 },
}

enum Outcome {
    Ended(EndReason),
    Failed(String),
}

struct CallActor {
    config: CallConfig,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerTransportFactory>,
    notifier: Arc<EventNotifier>,
    state: Arc<RwLock<CallState>>,
    session: Option<CallSession>,
    /// Candidates pro Identität, deren Offer noch nicht da ist
    early: HashMap<String, CandidateBuffer>,
    epoch: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    peer_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl CallActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut peer_rx: mpsc::UnboundedReceiver<(u64, PeerEvent)>,
        mut signaling_rx: broadcast::Receiver<SignalingEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(internal) = internal_rx.recv() => self.handle_internal(internal).await,
                Some((epoch, event)) = peer_rx.recv() => self.handle_peer_event(epoch, event).await,
                event = signaling_rx.recv() => match event {
                    Ok(SignalingEvent::Message(envelope)) => self.handle_message(envelope).await,
                    Ok(SignalingEvent::Status(status)) => self.handle_status(status).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.handle_lag(skipped).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        if self.session.is_some() {
            if let Err(e) = self.hang_up_remote() {
                tracing::warn!("Failed to send hangup on shutdown: {}", e);
            }
            self.finish(Outcome::Ended(EndReason::LocalHangup), CallError::Shutdown)
                .await;
        }
        tracing::debug!("Call engine stopped");
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall { remote_id, reply } => self.start_call(remote_id, reply),
            Command::AnswerCall {
                remote_id,
                offer,
                accept,
                reply,
            } => self.answer_call(remote_id, offer, accept, reply).await,
            Command::EndCall { remote_id, reply } => {
                let result = self.end_call(remote_id).await;
                let _ = reply.send(result);
            }
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.set_muted(muted));
            }
        }
    }

    fn start_call(&mut self, remote_id: String, reply: Reply) {
        if self.session.is_some() {
            let _ = reply.send(Err(CallError::AlreadyInCall));
            return;
        }
        if !self.transport.is_connected() {
            let _ = reply.send(Err(CallError::TransportNotConnected));
            return;
        }

        let epoch = self.next_epoch();
        let mut session = CallSession::new(
            epoch,
            remote_id.clone(),
            CallRole::Initiator,
            CallPhase::Dialing {
                remote_id: remote_id.clone(),
            },
        );
        session.pending = Some(reply);
        self.session = Some(session);
        self.early.clear();

        tracing::info!("Calling '{}'", remote_id);
        self.publish_state();

        let media = Arc::clone(&self.media);
        let peers = Arc::clone(&self.peers);
        let sink = PeerEventSink::new(epoch, self.peer_tx.clone());
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match open_peer(media, peers, sink).await {
                Ok(peer) => match peer.create_offer().await {
                    Ok(offer) => Ok((peer, offer)),
                    Err(e) => {
                        peer.close().await;
                        Err(e.into())
                    }
                },
                Err(e) => Err(e),
            };
            let _ = internal_tx.send(Internal::OfferReady { epoch, result });
        });
    }

    async fn answer_call(
        &mut self,
        remote_id: String,
        offer: Option<SessionDescription>,
        accept: bool,
        reply: Reply,
    ) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| matches!(&s.phase, CallPhase::Ringing { remote_id: r } if *r == remote_id))
        else {
            let _ = reply.send(Err(CallError::NoIncomingCall(remote_id)));
            return;
        };

        if !accept {
            let result = self.decline(EndReason::Declined).await;
            let _ = reply.send(result);
            return;
        }

        let Some(offer) = offer.or_else(|| session.offer.clone()) else {
            let _ = reply.send(Err(CallError::NoIncomingCall(remote_id)));
            return;
        };
        if let Some(timer) = session.ring_timer.take() {
            timer.abort();
        }
        session.phase = CallPhase::Negotiating {
            remote_id: remote_id.clone(),
        };
        session.pending = Some(reply);
        let epoch = session.epoch;

        tracing::info!("Accepting call from '{}'", remote_id);
        self.publish_state();

        let media = Arc::clone(&self.media);
        let peers = Arc::clone(&self.peers);
        let sink = PeerEventSink::new(epoch, self.peer_tx.clone());
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match open_peer(media, peers, sink).await {
                Ok(peer) => match peer.accept_offer(&offer).await {
                    Ok(answer) => Ok((peer, answer)),
                    Err(e) => {
                        peer.close().await;
                        Err(e.into())
                    }
                },
                Err(e) => Err(e),
            };
            let _ = internal_tx.send(Internal::AnswerReady { epoch, result });
        });
    }

    async fn end_call(&mut self, remote_id: Option<String>) -> Result<(), CallError> {
        let Some(session) = &self.session else {
            return Err(CallError::NoActiveCall);
        };
        if remote_id.is_some_and(|id| id != session.remote_id) {
            return Err(CallError::NoActiveCall);
        }
        if matches!(session.phase, CallPhase::Ringing { .. }) {
            return self.decline(EndReason::Declined).await;
        }

        tracing::info!("Ending call with '{}'", session.remote_id);
        let result = self.hang_up_remote().map_err(CallError::from);
        self.finish(Outcome::Ended(EndReason::LocalHangup), CallError::Cancelled)
            .await;
        result
    }

    fn set_muted(&mut self, muted: bool) -> Result<(), CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        session.muted = muted;
        if let Some(peer) = &session.peer {
            peer.local_media().set_muted(muted);
        }
        self.publish_state();
        Ok(())
    }

    /// Lehnt den klingelnden Anruf ab
    async fn decline(&mut self, reason: EndReason) -> Result<(), CallError> {
        let Some(remote_id) = self.session.as_ref().map(|s| s.remote_id.clone()) else {
            return Err(CallError::NoActiveCall);
        };

        let result = self
            .transport
            .send(SignalingMessage::CallAnswer {
                target_id: remote_id,
                sdp_answer: None,
                accepted: false,
            })
            .map_err(CallError::from);
        self.finish(Outcome::Ended(reason), CallError::Cancelled)
            .await;
        result
    }

    // ========================================================================
    // INTERNAL RESULTS
    // ========================================================================

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::OfferReady { epoch, result } => self.on_offer_ready(epoch, result).await,
            Internal::AnswerReady { epoch, result } => self.on_answer_ready(epoch, result).await,
            Internal::RingTimeout { epoch } => {
                let ringing = self.session.as_ref().is_some_and(|s| {
                    s.epoch == epoch && matches!(s.phase, CallPhase::Ringing { .. })
                });
                if ringing {
                    tracing::info!("Incoming call was not answered in time");
                    if let Err(e) = self.decline(EndReason::Unanswered).await {
                        tracing::warn!("Failed to reject unanswered call: {}", e);
                    }
                }
            }
        }
    }

    async fn on_offer_ready(&mut self, epoch: u64, result: Prepared) {
        let Some(session) = self.session.as_mut().filter(|s| s.epoch == epoch) else {
            release_stale(result).await;
            return;
        };

        let (peer, offer) = match result {
            Ok(prepared) => prepared,
            Err(error) => {
                self.fail(error.to_string(), error).await;
                return;
            }
        };

        peer.local_media().set_muted(session.muted);
        session.peer = Some(peer);
        let remote_id = session.remote_id.clone();
        let call_id = session.call_id;

        if let Err(e) = self.transport.send(SignalingMessage::CallOffer {
            target_id: remote_id.clone(),
            sdp_offer: offer,
        }) {
            self.fail(format!("failed to send call offer: {}", e), e.into())
                .await;
            return;
        }

        self.mark_signaled();
        self.notifier.emit(CallEvent::CallStarted {
            call_id,
            remote_id,
            role: CallRole::Initiator,
        });
        if let Some(session) = self.session.as_mut() {
            session.resolve(Ok(()));
        }
        self.publish_state();
    }

    async fn on_answer_ready(&mut self, epoch: u64, result: Prepared) {
        let Some(session) = self.session.as_mut().filter(|s| s.epoch == epoch) else {
            release_stale(result).await;
            return;
        };

        let (peer, answer) = match result {
            Ok(prepared) => prepared,
            Err(error) => {
                if let Err(e) = self.hang_up_remote() {
                    tracing::warn!("Failed to notify caller: {}", e);
                }
                self.fail(error.to_string(), error).await;
                return;
            }
        };

        peer.local_media().set_muted(session.muted);
        if let Some(remote) = session.early_remote.take() {
            peer.set_remote_media(remote);
        }
        let early = std::mem::take(&mut session.candidates);
        session.peer = Some(Arc::clone(&peer));
        let remote_id = session.remote_id.clone();
        let call_id = session.call_id;

        if let Err(e) = peer.absorb(early).await {
            tracing::warn!("Failed to apply early ICE candidates: {}", e);
        }

        if let Err(e) = self.transport.send(SignalingMessage::CallAnswer {
            target_id: remote_id.clone(),
            sdp_answer: Some(answer),
            accepted: true,
        }) {
            self.fail(format!("failed to send call answer: {}", e), e.into())
                .await;
            return;
        }

        self.mark_signaled();
        self.notifier.emit(CallEvent::CallStarted {
            call_id,
            remote_id: remote_id.clone(),
            role: CallRole::Receiver,
        });
        self.notifier
            .emit(CallEvent::CallAccepted { call_id, remote_id });
        if let Some(session) = self.session.as_mut() {
            session.resolve(Ok(()));
        }
        self.publish_state();
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    async fn handle_message(&mut self, envelope: Envelope) {
        let from = envelope.from_id;
        tracing::debug!("Received {} from '{}'", envelope.message.kind(), from);

        match envelope.message {
            SignalingMessage::CallOffer { sdp_offer, .. } => self.on_offer(from, sdp_offer),
            SignalingMessage::CallAnswer {
                sdp_answer,
                accepted,
                ..
            } => self.on_answer(from, sdp_answer, accepted).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(from, candidate).await
            }
            SignalingMessage::EndCall { .. } => {
                if self.is_current_remote(&from) {
                    self.finish(Outcome::Ended(EndReason::RemoteHangup), CallError::Cancelled)
                        .await;
                } else {
                    self.drop_early(&from);
                }
            }
            SignalingMessage::CallFailed { reason, user_id } => {
                // Ohne `userId` (ältere Relays) gilt die Meldung dem laufenden Anruf
                let dialing = self.session.as_ref().is_some_and(|s| {
                    matches!(s.phase, CallPhase::Dialing { .. })
                        && user_id.as_deref().map_or(true, |id| id == s.remote_id)
                });
                if dialing {
                    self.fail(reason.clone(), CallError::Remote(reason)).await;
                } else {
                    tracing::debug!("Ignoring call-failed for another call: {}", reason);
                }
            }
            SignalingMessage::ActiveUsers { users } => {
                tracing::debug!("{} other users online", users.len());
            }
            SignalingMessage::UserDisconnected { user_id } => {
                self.drop_early(&user_id);
                if self.is_current_remote(&user_id) {
                    self.finish(
                        Outcome::Ended(EndReason::RemoteDisconnected),
                        CallError::Cancelled,
                    )
                    .await;
                }
            }
        }
    }

    fn on_offer(&mut self, from: String, offer: SessionDescription) {
        if let Some(session) = self.session.as_mut() {
            if session.remote_id == from && matches!(session.phase, CallPhase::Ringing { .. }) {
                tracing::debug!("Updated pending offer from '{}'", from);
                session.offer = Some(offer);
                return;
            }

            tracing::info!("Rejecting call from '{}': busy", from);
            if let Err(e) = self.transport.send(SignalingMessage::CallAnswer {
                target_id: from,
                sdp_answer: None,
                accepted: false,
            }) {
                tracing::warn!("Failed to reject call: {}", e);
            }
            return;
        }

        let epoch = self.next_epoch();
        let mut session = CallSession::new(
            epoch,
            from.clone(),
            CallRole::Receiver,
            CallPhase::Ringing {
                remote_id: from.clone(),
            },
        );
        session.offer = Some(offer.clone());
        if let Some(buffer) = self.early.remove(&from) {
            session.candidates = buffer;
        }
        self.early.clear();

        let timeout = self.config.ring_timeout();
        let internal_tx = self.internal_tx.clone();
        session.ring_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal_tx.send(Internal::RingTimeout { epoch });
        }));

        let call_id = session.call_id;
        self.session = Some(session);

        tracing::info!("Incoming call from '{}'", from);
        self.publish_state();
        self.notifier.emit(CallEvent::IncomingCall {
            call_id,
            remote_id: from,
            offer,
        });
    }

    async fn on_answer(
        &mut self,
        from: String,
        sdp_answer: Option<SessionDescription>,
        accepted: bool,
    ) {
        let Some(session) = self.session.as_mut().filter(|s| {
            s.remote_id == from && matches!(s.phase, CallPhase::Dialing { .. })
        }) else {
            tracing::debug!("Ignoring unexpected call-answer from '{}'", from);
            return;
        };

        if !accepted {
            tracing::info!("Call rejected by '{}'", from);
            self.finish(Outcome::Ended(EndReason::Rejected), CallError::Cancelled)
                .await;
            return;
        }

        let Some(peer) = session.peer.clone() else {
            tracing::debug!("Ignoring call-answer before the offer was sent");
            return;
        };
        let Some(answer) = sdp_answer else {
            let reason = "call answer without session description".to_string();
            self.fail(reason.clone(), CallError::Negotiation(reason))
                .await;
            return;
        };

        session.phase = CallPhase::Negotiating {
            remote_id: from.clone(),
        };
        let call_id = session.call_id;
        self.publish_state();

        match peer.apply_answer(&answer).await {
            Ok(()) => {
                tracing::info!("Call accepted by '{}'", from);
                self.notifier.emit(CallEvent::CallAccepted {
                    call_id,
                    remote_id: from,
                });
            }
            Err(e) => {
                if let Err(send_err) = self.hang_up_remote() {
                    tracing::warn!("Failed to send hangup: {}", send_err);
                }
                self.fail(format!("failed to apply answer: {}", e), e.into())
                    .await;
            }
        }
    }

    async fn on_remote_candidate(&mut self, from: String, candidate: IceCandidate) {
        match self.session.as_mut() {
            Some(session) if session.remote_id == from => match session.peer.clone() {
                Some(peer) => {
                    if let Err(e) = peer.add_remote_candidate(&candidate).await {
                        tracing::warn!("Failed to apply ICE candidate: {}", e);
                    }
                }
                None => {
                    session.candidates.admit(&candidate);
                }
            },
            Some(_) => {
                tracing::debug!("Ignoring ICE candidate from '{}'", from);
            }
            None => self.admit_early(from, &candidate),
        }
    }

    /// Verlorene Signaling-Events (z.B. ein `end-call`) machen den
    /// laufenden Anruf unzuverlässig
    async fn handle_lag(&mut self, skipped: u64) {
        tracing::warn!("Call engine skipped {} signaling events", skipped);
        self.early.clear();
        if self.session.is_none() {
            return;
        }

        if let Err(e) = self.hang_up_remote() {
            tracing::warn!("Failed to send hangup: {}", e);
        }
        let reason = format!("lost {} signaling events", skipped);
        self.fail(
            reason.clone(),
            CallError::Transport(SignalingError::ConnectionFailed(reason)),
        )
        .await;
    }

    async fn handle_status(&mut self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connected => tracing::info!("Signaling connected"),
            ConnectionStatus::Connecting => tracing::debug!("Signaling connecting"),
            ConnectionStatus::Reconnecting { attempt, delay } => {
                tracing::info!("Signaling reconnecting (attempt {}, in {:?})", attempt, delay);
            }
            ConnectionStatus::Disconnected => {
                self.early.clear();
                if self.session.is_some() {
                    self.fail("signaling disconnected", CallError::TransportNotConnected)
                        .await;
                }
            }
            ConnectionStatus::Failed(reason) => {
                self.early.clear();
                if self.session.is_some() {
                    self.fail(
                        format!("signaling connection failed: {}", reason),
                        CallError::Transport(SignalingError::ConnectionFailed(reason)),
                    )
                    .await;
                }
            }
        }
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    async fn handle_peer_event(&mut self, epoch: u64, event: PeerEvent) {
        let Some(session) = self.session.as_mut().filter(|s| s.epoch == epoch) else {
            tracing::trace!("Dropping peer event of a finished session");
            return;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if session.signaled {
                    send_candidate(&*self.transport, &session.remote_id, candidate);
                } else {
                    session.outgoing.push(candidate);
                }
            }
            PeerEvent::RemoteTrack(media) => {
                tracing::info!("Remote audio track from '{}'", session.remote_id);
                match &session.peer {
                    Some(peer) => peer.set_remote_media(media),
                    None => {
                        if let Some(previous) = session.early_remote.replace(media) {
                            previous.end();
                        }
                    }
                }
                self.publish_state();
            }
            PeerEvent::ConnectionState(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, state: PeerConnectionState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.connection_state = state;

        match state {
            PeerConnectionState::Connected => {
                if let CallPhase::Negotiating { remote_id } = &session.phase {
                    tracing::info!("Call with '{}' is active", remote_id);
                    session.phase = CallPhase::Active {
                        remote_id: remote_id.clone(),
                    };
                    session.connected_at = Some(Utc::now());
                }
                self.publish_state();
            }
            PeerConnectionState::Failed => {
                if let Err(e) = self.hang_up_remote() {
                    tracing::warn!("Failed to send hangup: {}", e);
                }
                self.fail(
                    "peer connection failed",
                    CallError::PeerTransportFailure("ice connection failed".to_string()),
                )
                .await;
            }
            PeerConnectionState::Closed
                if matches!(
                    session.phase,
                    CallPhase::Negotiating { .. } | CallPhase::Active { .. }
                ) =>
            {
                if let Err(e) = self.hang_up_remote() {
                    tracing::warn!("Failed to send hangup: {}", e);
                }
                self.finish(Outcome::Ended(EndReason::PeerClosed), CallError::Cancelled)
                    .await;
            }
            _ => self.publish_state(),
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    fn is_current_remote(&self, remote_id: &str) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.remote_id == remote_id)
    }

    /// Candidate vor dem Offer
    fn admit_early(&mut self, from: String, candidate: &IceCandidate) {
        if !self.early.contains_key(&from) && self.early.len() >= MAX_EARLY_SENDERS {
            tracing::warn!(
                "Ignoring ICE candidate from '{}': {} callers already pending",
                from,
                MAX_EARLY_SENDERS
            );
            return;
        }

        let buffer = self.early.entry(from).or_default();
        if buffer.len() >= MAX_EARLY_CANDIDATES {
            tracing::warn!("Early ICE candidate buffer full, ignoring candidate");
            return;
        }
        buffer.admit(candidate);
    }

    fn drop_early(&mut self, remote_id: &str) {
        self.early.remove(remote_id);
    }

    /// Schickt gesammelte lokale Candidates hinterher
    fn mark_signaled(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.signaled = true;
        for candidate in std::mem::take(&mut session.outgoing) {
            send_candidate(&*self.transport, &session.remote_id, candidate);
        }
    }

    /// `end-call` an die Gegenseite, falls sie vom Anruf weiß
    fn hang_up_remote(&self) -> Result<(), SignalingError> {
        match &self.session {
            Some(session) if session.remote_knows() => {
                self.transport.send(SignalingMessage::EndCall {
                    target_id: session.remote_id.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn fail(&mut self, reason: impl Into<String>, error: CallError) {
        self.finish(Outcome::Failed(reason.into()), error).await;
    }

    /// Einziger Abbau-Pfad: gibt alles frei, meldet genau ein
    /// `call-ended` oder `call-failed` und kehrt nach `Idle` zurück
    async fn finish(&mut self, outcome: Outcome, pending_error: CallError) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Some(timer) = session.ring_timer.take() {
            timer.abort();
        }
        session.resolve(Err(pending_error));
        session.candidates.clear();
        session.outgoing.clear();
        if let Some(remote) = session.early_remote.take() {
            remote.end();
        }
        let had_peer = session.peer.is_some();
        if let Some(peer) = session.peer.take() {
            peer.close().await;
        }

        let duration = session
            .connected_at
            .and_then(|at| (Utc::now() - at).to_std().ok());
        let remote_id = session.remote_id;
        let call_id = session.call_id;

        let (phase, event) = match outcome {
            Outcome::Ended(reason) => {
                tracing::info!("Call with '{}' ended: {}", remote_id, reason);
                (
                    CallPhase::Ended,
                    CallEvent::CallEnded {
                        call_id,
                        remote_id: remote_id.clone(),
                        reason,
                        duration,
                    },
                )
            }
            Outcome::Failed(reason) => {
                tracing::warn!("Call with '{}' failed: {}", remote_id, reason);
                (
                    CallPhase::Failed {
                        reason: reason.clone(),
                    },
                    CallEvent::CallFailed {
                        call_id,
                        remote_id: remote_id.clone(),
                        reason,
                    },
                )
            }
        };

        self.set_state(CallState {
            phase,
            connection_state: if had_peer {
                PeerConnectionState::Closed
            } else {
                PeerConnectionState::New
            },
            remote_id: Some(remote_id),
            call_id: Some(call_id),
            ..CallState::idle()
        });
        self.notifier.emit(event);
        self.set_state(CallState::idle());
    }

    fn snapshot(&self) -> CallState {
        let Some(session) = &self.session else {
            return CallState::idle();
        };
        let peer = session.peer.as_ref();
        CallState {
            phase: session.phase.clone(),
            is_in_call: peer.is_some(),
            connection_state: session.connection_state,
            local_media: peer.map(|p| p.local_media()),
            remote_media: peer.and_then(|p| p.remote_media()),
            remote_id: Some(session.remote_id.clone()),
            call_id: Some(session.call_id),
            connected_at: session.connected_at,
            muted: session.muted,
        }
    }

    fn publish_state(&self) {
        self.set_state(self.snapshot());
    }

    fn set_state(&self, state: CallState) {
        *self.state.write() = state.clone();
        self.notifier.emit(CallEvent::StateChanged(state));
    }
}

/// Mikrofon öffnen und Peer-Transport bauen
async fn open_peer(
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerTransportFactory>,
    sink: PeerEventSink,
) -> Result<Arc<PeerSession>, CallError> {
    let local_media = media.acquire_audio().await?;
    match peers.create(&local_media, sink).await {
        Ok(transport) => Ok(Arc::new(PeerSession::new(transport, local_media))),
        Err(e) => {
            local_media.stop();
            Err(CallError::PeerTransportFailure(e.to_string()))
        }
    }
}

async fn release_stale(result: Prepared) {
    if let Ok((peer, _)) = result {
        tracing::debug!("Releasing peer session of a cancelled call");
        peer.close().await;
    }
}

fn send_candidate(transport: &dyn SignalingTransport, remote_id: &str, candidate: IceCandidate) {
    if let Err(e) = transport.send(SignalingMessage::IceCandidate {
        target_id: remote_id.to_string(),
        candidate,
    }) {
        tracing::warn!("Failed to forward ICE candidate: {}", e);
    }
}
