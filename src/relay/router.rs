//! Routing-Tabelle des Relays
//!
//! Hält pro Identität genau eine Verbindung und den aktuellen Gesprächspartner.
//! Wird vom WebSocket-Server und vom in-process Transport geteilt.

use crate::signaling::{Envelope, SignalingMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Absender-ID für Nachrichten, die vom Relay selbst stammen
pub const RELAY_ID: &str = "";

pub type ConnectionId = u64;

/// Ergebnis von [`Router::route`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// Ziel nicht verbunden
    TargetOffline,
    /// Nachricht ist nur vom Relay erlaubt oder hat kein Ziel
    Ignored,
}

struct Registration {
    conn_id: ConnectionId,
    tx: mpsc::UnboundedSender<Envelope>,
    partner: Option<String>,
}

#[derive(Default)]
struct RouterState {
    peers: HashMap<String, Registration>,
    next_id: ConnectionId,
}

impl RouterState {
    fn deliver(&self, user_id: &str, envelope: Envelope) -> bool {
        match self.peers.get(user_id) {
            Some(peer) => peer.tx.send(envelope).is_ok(),
            None => false,
        }
    }

    fn set_partner(&mut self, user_id: &str, partner: Option<String>) {
        if let Some(peer) = self.peers.get_mut(user_id) {
            peer.partner = partner;
        }
    }

    fn partner_of(&self, user_id: &str) -> Option<&str> {
        self.peers.get(user_id).and_then(|p| p.partner.as_deref())
    }

    /// Löst die Paarung nur, wenn sie noch auf `partner` zeigt
    fn clear_partner_if(&mut self, user_id: &str, partner: &str) {
        if self.partner_of(user_id) == Some(partner) {
            self.set_partner(user_id, None);
        }
    }
}

/// Routing-Tabelle
#[derive(Default)]
pub struct Router {
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert eine Verbindung; eine ältere Verbindung derselben
    /// Identität wird ersetzt. Schickt `active-users` an die neue Verbindung.
    pub fn register(&self, user_id: &str, tx: mpsc::UnboundedSender<Envelope>) -> ConnectionId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let conn_id = state.next_id;

        let replaced = state.peers.insert(
            user_id.to_string(),
            Registration {
                conn_id,
                tx,
                partner: None,
            },
        );
        if replaced.is_some() {
            tracing::info!("Replacing existing connection for '{}'", user_id);
        }

        let mut users: Vec<String> = state
            .peers
            .keys()
            .filter(|id| id.as_str() != user_id)
            .cloned()
            .collect();
        users.sort();
        state.deliver(
            user_id,
            Envelope::new(RELAY_ID, SignalingMessage::ActiveUsers { users }),
        );

        tracing::info!("'{}' connected ({} online)", user_id, state.peers.len());
        conn_id
    }

    /// Entfernt eine Verbindung. Ein laufender Gesprächspartner bekommt
    /// `end-call`, alle anderen `user-disconnected`.
    pub fn unregister(&self, user_id: &str, conn_id: ConnectionId) -> bool {
        let mut state = self.state.lock();

        let is_current = state
            .peers
            .get(user_id)
            .map(|peer| peer.conn_id == conn_id)
            .unwrap_or(false);
        if !is_current {
            return false;
        }

        let removed = state.peers.remove(user_id);
        if let Some(partner) = removed.and_then(|r| r.partner) {
            if state.partner_of(&partner) == Some(user_id) {
                state.deliver(
                    &partner,
                    Envelope::new(
                        user_id,
                        SignalingMessage::EndCall {
                            target_id: partner.clone(),
                        },
                    ),
                );
                state.set_partner(&partner, None);
            }
        }

        for peer in state.peers.values() {
            let _ = peer.tx.send(Envelope::new(
                RELAY_ID,
                SignalingMessage::UserDisconnected {
                    user_id: user_id.to_string(),
                },
            ));
        }

        tracing::info!("'{}' disconnected ({} online)", user_id, state.peers.len());
        true
    }

    /// Leitet eine Nachricht von `from_id` an ihr Ziel weiter
    pub fn route(&self, from_id: &str, message: SignalingMessage) -> RouteOutcome {
        let mut state = self.state.lock();

        let Some(target_id) = message.target_id().map(str::to_string) else {
            tracing::debug!("Ignoring {} from '{}'", message.kind(), from_id);
            return RouteOutcome::Ignored;
        };

        match &message {
            SignalingMessage::CallOffer { .. } => {
                if !state.peers.contains_key(&target_id) {
                    tracing::info!("'{}' called '{}' who is offline", from_id, target_id);
                    state.deliver(
                        from_id,
                        Envelope::new(
                            RELAY_ID,
                            SignalingMessage::CallFailed {
                                reason: "user offline".to_string(),
                                user_id: Some(target_id.clone()),
                            },
                        ),
                    );
                    return RouteOutcome::TargetOffline;
                }
                state.set_partner(from_id, Some(target_id.clone()));
            }
            SignalingMessage::CallAnswer { accepted, .. } => {
                if *accepted {
                    state.set_partner(from_id, Some(target_id.clone()));
                    state.set_partner(&target_id, Some(from_id.to_string()));
                } else {
                    // Besetzt-Ablehnung darf eine laufende Paarung nicht lösen
                    state.clear_partner_if(&target_id, from_id);
                    state.clear_partner_if(from_id, &target_id);
                }
            }
            SignalingMessage::EndCall { .. } => {
                state.clear_partner_if(&target_id, from_id);
                state.clear_partner_if(from_id, &target_id);
            }
            _ => {}
        }

        let kind = message.kind();
        if state.deliver(&target_id, Envelope::new(from_id, message)) {
            tracing::debug!("Routed {} '{}' -> '{}'", kind, from_id, target_id);
            RouteOutcome::Delivered
        } else {
            tracing::debug!("Dropped {} for offline '{}'", kind, target_id);
            RouteOutcome::TargetOffline
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.state.lock().peers.contains_key(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.state.lock().peers.len()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("online", &self.online_count())
            .finish()
    }
}
