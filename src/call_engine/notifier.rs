//! Event Notifier - Publish/Subscribe für die UI
//!
//! Sechs Topics, ein geschlossenes [`CallEvent`] Enum. Listener laufen
//! synchron auf dem Task der Call Engine und sollten kurz sein; wer
//! länger arbeiten will, nimmt [`EventNotifier::events`].

use super::state::{CallRole, CallState};
use crate::signaling::SessionDescription;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// TOPICS & EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    StateChanged,
    CallStarted,
    CallAccepted,
    CallEnded,
    CallFailed,
    IncomingCall,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::StateChanged,
        Topic::CallStarted,
        Topic::CallAccepted,
        Topic::CallEnded,
        Topic::CallFailed,
        Topic::IncomingCall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::StateChanged => "state-changed",
            Topic::CallStarted => "call-started",
            Topic::CallAccepted => "call-accepted",
            Topic::CallEnded => "call-ended",
            Topic::CallFailed => "call-failed",
            Topic::IncomingCall => "incoming-call",
        }
    }
}

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Lokal aufgelegt
    LocalHangup,
    /// Gegenseite hat aufgelegt
    RemoteHangup,
    /// Eingehender Anruf lokal abgelehnt
    Declined,
    /// Ausgehender Anruf von der Gegenseite abgelehnt
    Rejected,
    /// Eingehender Anruf nicht rechtzeitig angenommen
    Unanswered,
    /// Peer-Transport wurde geschlossen
    PeerClosed,
    /// Gegenseite hat die Verbindung zum Relay verloren
    RemoteDisconnected,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::LocalHangup => "local hangup",
            EndReason::RemoteHangup => "remote hangup",
            EndReason::Declined => "declined",
            EndReason::Rejected => "rejected",
            EndReason::Unanswered => "unanswered",
            EndReason::PeerClosed => "peer closed",
            EndReason::RemoteDisconnected => "remote disconnected",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alle Events, die die Call Engine veröffentlicht
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    CallStarted {
        call_id: Uuid,
        remote_id: String,
        role: CallRole,
    },
    CallAccepted {
        call_id: Uuid,
        remote_id: String,
    },
    CallEnded {
        call_id: Uuid,
        remote_id: String,
        reason: EndReason,
        /// Nur gesetzt, wenn der Anruf aktiv war
        duration: Option<Duration>,
    },
    CallFailed {
        call_id: Uuid,
        remote_id: String,
        reason: String,
    },
    IncomingCall {
        call_id: Uuid,
        remote_id: String,
        offer: SessionDescription,
    },
}

impl CallEvent {
    pub fn topic(&self) -> Topic {
        match self {
            CallEvent::StateChanged(_) => Topic::StateChanged,
            CallEvent::CallStarted { .. } => Topic::CallStarted,
            CallEvent::CallAccepted { .. } => Topic::CallAccepted,
            CallEvent::CallEnded { .. } => Topic::CallEnded,
            CallEvent::CallFailed { .. } => Topic::CallFailed,
            CallEvent::IncomingCall { .. } => Topic::IncomingCall,
        }
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&CallEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: ListenerId,
    listeners: HashMap<Topic, Vec<(ListenerId, Listener)>>,
    channels: HashMap<Topic, Vec<mpsc::UnboundedSender<CallEvent>>>,
}

#[derive(Default)]
pub struct EventNotifier {
    registry: Mutex<Registry>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> ListenerId
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .listeners
            .entry(topic)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Darf auch aus einem Listener heraus aufgerufen werden
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock();
        let mut removed = false;
        for listeners in registry.listeners.values_mut() {
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            removed |= listeners.len() != before;
        }
        removed
    }

    /// Events eines Topics als Channel; endet beim Droppen des Receivers
    pub fn events(&self, topic: Topic) -> mpsc::UnboundedReceiver<CallEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry
            .lock()
            .channels
            .entry(topic)
            .or_default()
            .push(tx);
        rx
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        self.registry
            .lock()
            .listeners
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Stellt ein Event allen zum Zeitpunkt des Aufrufs registrierten
    /// Listenern zu. Der Lock ist während der Listener-Aufrufe frei.
    pub(crate) fn emit(&self, event: CallEvent) {
        let topic = event.topic();
        let snapshot: Vec<Listener> = {
            let mut registry = self.registry.lock();
            if let Some(channels) = registry.channels.get_mut(&topic) {
                channels.retain(|tx| tx.send(event.clone()).is_ok());
            }
            registry
                .listeners
                .get(&topic)
                .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        tracing::trace!("Emitting {} to {} listeners", topic.as_str(), snapshot.len());
        for listener in snapshot {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("EventNotifier")
            .field("listeners", &registry.listeners.values().map(Vec::len).sum::<usize>())
            .field("channels", &registry.channels.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn started(n: u128) -> CallEvent {
        CallEvent::CallStarted {
            call_id: Uuid::from_u128(n),
            remote_id: "bob".to_string(),
            role: CallRole::Initiator,
        }
    }

    #[test]
    fn test_listener_sees_each_emission_once() {
        let notifier = EventNotifier::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        notifier.subscribe(Topic::CallStarted, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        notifier.emit(started(1));
        notifier.emit(CallEvent::StateChanged(CallState::idle()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_during_own_invocation() {
        let notifier = Arc::new(EventNotifier::new());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let own_id = Arc::new(Mutex::new(None::<ListenerId>));
        let (n, f, slot) = (Arc::clone(&notifier), Arc::clone(&first), Arc::clone(&own_id));
        let id = notifier.subscribe(Topic::CallStarted, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot.lock() {
                n.unsubscribe(id);
            }
        });
        *own_id.lock() = Some(id);

        let s = Arc::clone(&second);
        notifier.subscribe(Topic::CallStarted, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        notifier.emit(started(1));
        notifier.emit(started(2));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(notifier.listener_count(Topic::CallStarted), 1);
    }

    #[test]
    fn test_delivery_in_emission_order() {
        let notifier = EventNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        notifier.subscribe(Topic::CallStarted, move |event| {
            if let CallEvent::CallStarted { call_id, .. } = event {
                s.lock().push(call_id.as_u128());
            }
        });

        for n in 1..=5 {
            notifier.emit(started(n));
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_event_channel_prunes_dropped_receivers() {
        let notifier = EventNotifier::new();
        let mut rx = notifier.events(Topic::CallStarted);
        let dropped = notifier.events(Topic::CallStarted);
        drop(dropped);

        notifier.emit(started(7));

        match rx.recv().await.unwrap() {
            CallEvent::CallStarted { call_id, .. } => assert_eq!(call_id.as_u128(), 7),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(notifier.registry.lock().channels[&Topic::CallStarted].len(), 1);
    }
}
