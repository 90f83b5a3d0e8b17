//! Exponentielles Backoff für Reconnects

use crate::config::ReconnectPolicy;
use std::time::Duration;

/// Zähler für Reconnect-Versuche
///
/// Verzögerung = base * 2^versuch, gedeckelt auf `max_delay`.
/// Nach `max_attempts` Versuchen liefert `next_delay` `None`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Anzahl bereits vergebener Versuche
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Verzögerung für den nächsten Versuch, `None` wenn aufgebraucht
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }

        let factor = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        let delay_ms = self
            .policy
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.policy.max_delay_ms);

        self.attempt += 1;
        Some(Duration::from_millis(delay_ms))
    }

    /// Nach erfolgreichem Reconnect
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u64, max: u64, attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay_ms: base,
            max_delay_ms: max,
            max_attempts: attempts,
        }
    }

    #[test]
    fn test_delays_double_until_cap() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
    }

    #[test]
    fn test_strictly_increasing_then_capped() {
        let mut backoff = Backoff::new(policy(100, 1_000, 8));
        let delays: Vec<Duration> = std::iter::from_fn(|| backoff.next_delay()).collect();

        assert_eq!(delays.len(), 8);
        let cap = Duration::from_millis(1_000);
        for pair in delays.windows(2) {
            if pair[0] < cap {
                assert!(pair[1] > pair[0], "{:?} should grow", pair);
            } else {
                assert_eq!(pair[1], cap);
            }
        }
        assert_eq!(*delays.last().unwrap(), cap);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = Backoff::new(policy(50, 10_000, 5));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_bounded_attempts() {
        let mut backoff = Backoff::new(policy(10, 100, 2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let mut backoff = Backoff::new(policy(1_000, 30_000, 100));
        let last = std::iter::from_fn(|| backoff.next_delay()).last();
        assert_eq!(last, Some(Duration::from_millis(30_000)));
    }
}
