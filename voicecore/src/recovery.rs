//! Media recovery policy driven by peer connection state.
//!
//! The call actor feeds connection-state transitions and timer expiries in,
//! and carries out the returned [`RecoveryAction`]s (arming timers, sending
//! ICE restart offers, failing the call).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecoveryConfig {
    /// How long `Disconnected` may last without inbound traffic.
    pub disconnect_grace: Duration,
    /// Total time allowed since the first failure before giving up.
    pub budget: Duration,
    /// Interval between ICE restart attempts while recovering.
    pub retry_interval: Duration,
}

impl Default for MediaRecoveryConfig {
    fn default() -> Self {
        Self {
            disconnect_grace: Duration::from_millis(3_000),
            budget: Duration::from_millis(30_000),
            retry_interval: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Nothing,
    /// Start (or restart) the disconnect grace timer.
    ArmGrace(Duration),
    CancelGrace,
    /// First failure: enter `Reconnecting`, restart ICE, and arm the
    /// budget deadline and the retry timer.
    StartReconnecting { deadline: Instant, retry_in: Duration },
    /// Restart ICE again and re-arm the retry timer.
    RestartIce { retry_in: Duration },
    /// Media is flowing again.
    Recovered,
    /// The budget is spent.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct MediaRecovery {
    config: MediaRecoveryConfig,
    failure_started: Option<Instant>,
}

impl MediaRecovery {
    pub fn new(config: MediaRecoveryConfig) -> Self {
        Self {
            config,
            failure_started: None,
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.failure_started.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.failure_started.map(|t| t + self.config.budget)
    }

    pub fn on_state(&mut self, state: IceConnectionState, now: Instant) -> RecoveryAction {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if self.failure_started.take().is_some() {
                    RecoveryAction::Recovered
                } else {
                    RecoveryAction::CancelGrace
                }
            }
            IceConnectionState::Disconnected if !self.is_recovering() => {
                RecoveryAction::ArmGrace(self.config.disconnect_grace)
            }
            IceConnectionState::Failed => self.begin_restart(now),
            _ => RecoveryAction::Nothing,
        }
    }

    /// The grace timer expired. `traffic_seen` tells whether inbound bytes
    /// increased while it was running.
    pub fn on_grace_elapsed(&mut self, traffic_seen: bool, now: Instant) -> RecoveryAction {
        if traffic_seen {
            RecoveryAction::ArmGrace(self.config.disconnect_grace)
        } else {
            self.begin_restart(now)
        }
    }

    pub fn on_retry_elapsed(&mut self, now: Instant) -> RecoveryAction {
        if self.is_recovering() {
            self.begin_restart(now)
        } else {
            RecoveryAction::Nothing
        }
    }

    pub fn on_deadline(&mut self, now: Instant) -> RecoveryAction {
        match self.deadline() {
            Some(deadline) if now >= deadline => RecoveryAction::GiveUp,
            _ => RecoveryAction::Nothing,
        }
    }

    fn begin_restart(&mut self, now: Instant) -> RecoveryAction {
        match self.failure_started {
            None => {
                self.failure_started = Some(now);
                RecoveryAction::StartReconnecting {
                    deadline: now + self.config.budget,
                    retry_in: self.config.retry_interval,
                }
            }
            Some(started) if now.duration_since(started) >= self.config.budget => {
                RecoveryAction::GiveUp
            }
            Some(_) => RecoveryAction::RestartIce {
                retry_in: self.config.retry_interval,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recovery() -> MediaRecovery {
        MediaRecovery::new(MediaRecoveryConfig::default())
    }

    #[test]
    fn disconnected_waits_for_grace() {
        let mut r = recovery();
        let now = Instant::now();
        assert_eq!(
            r.on_state(IceConnectionState::Disconnected, now),
            RecoveryAction::ArmGrace(Duration::from_secs(3))
        );
        assert_eq!(
            r.on_state(IceConnectionState::Connected, now),
            RecoveryAction::CancelGrace
        );
        assert!(!r.is_recovering());
    }

    #[test]
    fn grace_with_traffic_keeps_watching() {
        let mut r = recovery();
        let now = Instant::now();
        assert!(matches!(
            r.on_grace_elapsed(true, now),
            RecoveryAction::ArmGrace(_)
        ));
        assert!(matches!(
            r.on_grace_elapsed(false, now),
            RecoveryAction::StartReconnecting { .. }
        ));
    }

    #[test]
    fn budget_is_measured_from_first_failure() {
        let mut r = recovery();
        let t0 = Instant::now();
        match r.on_state(IceConnectionState::Failed, t0) {
            RecoveryAction::StartReconnecting { deadline, retry_in } => {
                assert_eq!(deadline, t0 + Duration::from_secs(30));
                assert_eq!(retry_in, Duration::from_secs(5));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            r.on_state(IceConnectionState::Failed, t0 + Duration::from_secs(12)),
            RecoveryAction::RestartIce { .. }
        ));
        assert!(matches!(
            r.on_retry_elapsed(t0 + Duration::from_secs(25)),
            RecoveryAction::RestartIce { .. }
        ));
        assert_eq!(
            r.on_deadline(t0 + Duration::from_secs(29)),
            RecoveryAction::Nothing
        );
        assert_eq!(
            r.on_retry_elapsed(t0 + Duration::from_secs(30)),
            RecoveryAction::GiveUp
        );
    }

    #[test]
    fn reconnect_clears_the_budget() {
        let mut r = recovery();
        let t0 = Instant::now();
        r.on_state(IceConnectionState::Failed, t0);
        assert_eq!(
            r.on_state(IceConnectionState::Connected, t0 + Duration::from_secs(4)),
            RecoveryAction::Recovered
        );
        assert!(r.deadline().is_none());
        assert!(matches!(
            r.on_state(IceConnectionState::Failed, t0 + Duration::from_secs(40)),
            RecoveryAction::StartReconnecting { .. }
        ));
    }
}
