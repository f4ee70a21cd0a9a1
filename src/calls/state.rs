//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use voicecore::types::call::{CallDirection, CallParameters};

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// `disconnect()` on this side.
    LocalHangup,
    /// The other party hung up.
    RemoteHangup,
    /// The caller gave up before the call was answered.
    Cancelled,
    Rejected,
    /// Closed locally without telling the server.
    Ignored,
    /// Another call was accepted.
    Replaced,
    /// Media could not be recovered.
    MediaFailed,
    Error,
}

/// Current state of a call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CallState {
    /// Inbound: waiting for `accept()` or `reject()`.
    Pending { received_at: DateTime<Utc> },
    /// Outbound: invite sent. Inbound: accepted, waiting for media.
    Connecting { since: DateTime<Utc> },
    /// Outbound: the callee is ringing.
    Ringing { since: DateTime<Utc> },
    /// Media flowing.
    Open { connected_at: DateTime<Utc> },
    /// Media lost, ICE restart in progress.
    Reconnecting {
        connected_at: DateTime<Utc>,
        since: DateTime<Utc>,
    },
    Closed {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Media has connected at least once and the call has not ended.
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::Reconnecting { .. })
    }

    pub fn is_setting_up(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Ringing { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Connecting { .. } => "connecting",
            Self::Ringing { .. } => "ringing",
            Self::Open { .. } => "open",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Closed { .. } => "closed",
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    Accepted,
    RingingReceived,
    MediaConnected,
    MediaInterrupted,
    MediaRestored,
    Ended { reason: EndReason },
}

/// A call's fixed parameters plus its current state.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub parameters: Arc<CallParameters>,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

impl CallInfo {
    pub fn new_outgoing(parameters: CallParameters) -> Self {
        let now = Utc::now();
        Self {
            parameters: Arc::new(parameters),
            state: CallState::Connecting { since: now },
            created_at: now,
        }
    }

    pub fn new_incoming(parameters: CallParameters) -> Self {
        let now = Utc::now();
        Self {
            parameters: Arc::new(parameters),
            state: CallState::Pending { received_at: now },
            created_at: now,
        }
    }

    pub fn call_sid(&self) -> &str {
        &self.parameters.call_sid
    }

    pub fn is_initiator(&self) -> bool {
        self.parameters.direction == CallDirection::Outgoing
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let now = Utc::now();
        let new_state = match (&self.state, transition) {
            (CallState::Pending { .. }, CallTransition::Accepted) => {
                CallState::Connecting { since: now }
            }
            (CallState::Connecting { .. }, CallTransition::RingingReceived) if self.is_initiator() => {
                CallState::Ringing { since: now }
            }
            (
                CallState::Connecting { .. } | CallState::Ringing { .. },
                CallTransition::MediaConnected,
            ) => CallState::Open { connected_at: now },
            (CallState::Open { connected_at }, CallTransition::MediaInterrupted) => {
                CallState::Reconnecting {
                    connected_at: *connected_at,
                    since: now,
                }
            }
            (CallState::Reconnecting { connected_at, .. }, CallTransition::MediaRestored) => {
                CallState::Open {
                    connected_at: *connected_at,
                }
            }
            (
                CallState::Open { connected_at } | CallState::Reconnecting { connected_at, .. },
                CallTransition::Ended { reason },
            ) => CallState::Closed {
                reason,
                ended_at: now,
                duration_secs: Some(now.signed_duration_since(*connected_at).num_seconds()),
            },
            (
                CallState::Pending { .. } | CallState::Connecting { .. } | CallState::Ringing { .. },
                CallTransition::Ended { reason },
            ) => CallState::Closed {
                reason,
                ended_at: now,
                duration_secs: None,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
