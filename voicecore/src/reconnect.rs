//! Reconnection policy for the signaling channel.
//!
//! The policy is sans-IO: the signaling actor reports opens and failures and
//! receives a decision naming the endpoint index and delay for the next
//! attempt.

use crate::backoff::{Backoff, BackoffConfig};
use crate::net::close_code;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Connect to `uri_index` after `delay`.
    Retry {
        uri_index: usize,
        delay: Duration,
        /// True when the attempt moved to a different endpoint.
        fallback: bool,
        attempt: u32,
    },
    /// Retries are exhausted.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    uri_count: usize,
    repeat_uris: bool,
    max_attempts: u32,
    backoff: Backoff,
    index: usize,
    ever_opened: bool,
    attempts: u32,
    /// Times the list wrapped back to the first endpoint without an open.
    wraps: u32,
}

impl ReconnectPolicy {
    pub fn new(
        uri_count: usize,
        repeat_uris: bool,
        max_attempts: u32,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            uri_count: uri_count.max(1),
            repeat_uris,
            max_attempts,
            backoff: Backoff::new(backoff),
            index: 0,
            ever_opened: false,
            attempts: 0,
            wraps: 0,
        }
    }

    /// Index of the endpoint the next attempt should use.
    pub fn current_index(&self) -> usize {
        self.index
    }

    pub fn has_opened(&self) -> bool {
        self.ever_opened
    }

    /// Starts over from the preferred endpoint, as on an explicit `open()`.
    pub fn restart(&mut self) {
        self.index = 0;
        self.ever_opened = false;
        self.attempts = 0;
        self.wraps = 0;
        self.backoff.reset();
    }

    pub fn on_open(&mut self) {
        self.ever_opened = true;
        self.attempts = 0;
        self.wraps = 0;
        self.backoff.reset();
    }

    pub fn on_failure(&mut self, code: u16) -> ReconnectDecision {
        self.on_failure_with(code, &mut rand::rng())
    }

    pub fn on_failure_with<R: Rng + ?Sized>(&mut self, code: u16, rng: &mut R) -> ReconnectDecision {
        if !self.ever_opened && close_code::is_fallback_trigger(code) {
            if let Some(next) = self.next_index() {
                if next == 0 {
                    self.wraps += 1;
                }
                self.index = next;
                self.attempts = 0;
                self.backoff.reset();
                return ReconnectDecision::Retry {
                    uri_index: next,
                    delay: self.backoff.next_delay_with(rng),
                    fallback: true,
                    attempt: 0,
                };
            }
        }

        if self.attempts >= self.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        self.attempts += 1;
        ReconnectDecision::Retry {
            uri_index: self.index,
            delay: self.backoff.next_delay_with(rng),
            fallback: false,
            attempt: self.attempts,
        }
    }

    fn next_index(&self) -> Option<usize> {
        if self.index + 1 < self.uri_count {
            Some(self.index + 1)
        } else if self.repeat_uris && self.uri_count > 1 && self.wraps < self.max_attempts {
            Some(0)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(uris: usize, repeat: bool) -> ReconnectPolicy {
        ReconnectPolicy::new(uris, repeat, 3, BackoffConfig::default())
    }

    fn index_of(decision: &ReconnectDecision) -> Option<usize> {
        match decision {
            ReconnectDecision::Retry { uri_index, .. } => Some(*uri_index),
            ReconnectDecision::GiveUp => None,
        }
    }

    #[test]
    fn abnormal_closes_walk_the_list_then_stay_on_last() {
        let mut p = policy(3, false);
        let seen: Vec<_> = (0..4).map(|_| index_of(&p.on_failure(1006))).collect();
        assert_eq!(seen, vec![Some(1), Some(2), Some(2), Some(2)]);
    }

    #[test]
    fn wraps_only_when_configured() {
        let mut p = policy(3, true);
        let seen: Vec<_> = (0..5).map(|_| index_of(&p.on_failure(1015))).collect();
        assert_eq!(seen, vec![Some(1), Some(2), Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn wrapping_stops_once_attempts_run_out() {
        let mut p = policy(2, true);
        let mut seen = Vec::new();
        loop {
            let decision = p.on_failure(1006);
            seen.push(index_of(&decision));
            if decision == ReconnectDecision::GiveUp {
                break;
            }
            assert!(seen.len() < 50, "never gave up: {seen:?}");
        }
        // Three wraps, then the usual retries on the last endpoint.
        assert_eq!(
            seen,
            vec![
                Some(1),
                Some(0),
                Some(1),
                Some(0),
                Some(1),
                Some(0),
                Some(1),
                Some(1),
                Some(1),
                Some(1),
                None,
            ]
        );
    }

    #[test]
    fn restart_resets_the_wrap_count() {
        let mut p = policy(2, true);
        for _ in 0..6 {
            p.on_failure(1006);
        }
        p.restart();
        let seen: Vec<_> = (0..2).map(|_| index_of(&p.on_failure(1006))).collect();
        assert_eq!(seen, vec![Some(1), Some(0)]);
    }

    #[test]
    fn other_codes_retry_the_same_uri() {
        let mut p = policy(3, false);
        assert_eq!(index_of(&p.on_failure(1011)), Some(0));
        assert_eq!(index_of(&p.on_failure(1000)), Some(0));
    }

    #[test]
    fn after_open_every_failure_stays_put() {
        let mut p = policy(3, true);
        p.on_failure(1006);
        p.on_open();
        for _ in 0..3 {
            assert_eq!(index_of(&p.on_failure(1006)), Some(1));
        }
        assert_eq!(p.on_failure(1006), ReconnectDecision::GiveUp);
    }

    #[test]
    fn fallback_resets_backoff() {
        let mut p = ReconnectPolicy::new(
            2,
            false,
            10,
            BackoffConfig {
                jitter: 0.0,
                ..BackoffConfig::default()
            },
        );
        p.on_failure(1011);
        p.on_failure(1011);
        match p.on_failure(1006) {
            ReconnectDecision::Retry {
                uri_index,
                delay,
                fallback,
                ..
            } => {
                assert_eq!(uri_index, 1);
                assert!(fallback);
                assert_eq!(delay, Duration::from_millis(100));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn restart_returns_to_preferred_uri() {
        let mut p = policy(2, false);
        p.on_failure(1006);
        p.on_open();
        p.restart();
        assert_eq!(p.current_index(), 0);
        assert!(!p.has_opened());
    }
}
