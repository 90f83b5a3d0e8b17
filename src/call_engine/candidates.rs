//! Puffer für ICE Candidates, die vor der Remote Description eintreffen

use crate::signaling::IceCandidate;
use std::collections::{HashSet, VecDeque};

/// Was mit einem eingehenden Candidate passieren soll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Remote Description fehlt noch, Candidate wurde gepuffert
    Buffered,
    /// Remote Description ist gesetzt, sofort anwenden
    ApplyNow,
    /// Exakt derselbe Candidate wurde schon gesehen
    Duplicate,
}

/// FIFO pro Call Session
///
/// Wird genau einmal geleert, direkt nachdem die Remote Description
/// gesetzt wurde. Danach gehen alle Candidates direkt durch.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    seen: HashSet<IceCandidate>,
    drained: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, candidate: &IceCandidate) -> Admission {
        if !self.seen.insert(candidate.clone()) {
            return Admission::Duplicate;
        }
        if self.drained {
            Admission::ApplyNow
        } else {
            self.pending.push_back(candidate.clone());
            Admission::Buffered
        }
    }

    /// Gibt alle gepufferten Candidates in Empfangsreihenfolge zurück
    ///
    /// Nur der erste Aufruf liefert etwas.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        if self.drained {
            return Vec::new();
        }
        self.drained = true;
        self.pending.drain(..).collect()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Verwirft alles (Session-Ende)
    pub fn clear(&mut self) {
        self.pending.clear();
        self.seen.clear();
    }

    /// Übernimmt noch nicht angewandte Candidates eines anderen Puffers
    pub fn absorb(&mut self, other: CandidateBuffer) -> Vec<IceCandidate> {
        let mut apply_now = Vec::new();
        for candidate in other.pending {
            if self.admit(&candidate) == Admission::ApplyNow {
                apply_now.push(candidate);
            }
        }
        apply_now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n))
    }

    #[test]
    fn test_drains_in_receipt_order() {
        let mut buffer = CandidateBuffer::new();
        for n in [3, 1, 2] {
            assert_eq!(buffer.admit(&candidate(n)), Admission::Buffered);
        }

        assert_eq!(buffer.drain(), vec![candidate(3), candidate(1), candidate(2)]);
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_applies_directly_after_drain() {
        let mut buffer = CandidateBuffer::new();
        buffer.admit(&candidate(1));
        buffer.drain();

        assert_eq!(buffer.admit(&candidate(2)), Admission::ApplyNow);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_exact_duplicates_suppressed() {
        let mut buffer = CandidateBuffer::new();
        assert_eq!(buffer.admit(&candidate(1)), Admission::Buffered);
        assert_eq!(buffer.admit(&candidate(1)), Admission::Duplicate);
        buffer.drain();
        assert_eq!(buffer.admit(&candidate(1)), Admission::Duplicate);

        // gleiche Zeile, anderes sdpMid ist kein Duplikat
        let mut variant = candidate(1);
        variant.sdp_mid = Some("0".to_string());
        assert_eq!(buffer.admit(&variant), Admission::ApplyNow);
    }

    #[test]
    fn test_absorb_keeps_order() {
        let mut early = CandidateBuffer::new();
        early.admit(&candidate(1));
        early.admit(&candidate(2));

        let mut session = CandidateBuffer::new();
        assert!(session.absorb(early).is_empty());
        assert_eq!(session.len(), 2);
        assert_eq!(session.drain(), vec![candidate(1), candidate(2)]);
    }

    #[test]
    fn test_clear_discards_pending() {
        let mut buffer = CandidateBuffer::new();
        buffer.admit(&candidate(1));
        buffer.clear();
        assert!(buffer.drain().is_empty());
    }
}
