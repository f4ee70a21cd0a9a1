use super::actor::{CallActor, CallChannels, CallContext};
use super::state::{CallInfo, CallState, EndReason};
use crate::error::VoiceError;
use crate::peer::PeerConnection;
use crate::types::events::{CHANNEL_CAPACITY, CallEvent};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc, watch};
use voicecore::errors::TwilioError;
use voicecore::protocol::SignalingMessage;
use voicecore::stats::{RtcSample, WarningEvent};
use voicecore::types::call::{CallDirection, CallParameters};

pub(crate) enum CallCommand {
    Accept,
    Reject,
    Ignore,
    Disconnect,
    Mute(bool),
    SendDigits(String),
    /// A control message addressed to this call.
    Signal(SignalingMessage),
    /// Ended by the device, e.g. replaced by another call.
    Terminate(EndReason),
}

/// Everything recorded about a finished call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub parameters: CallParameters,
    pub reason: EndReason,
    pub duration_secs: Option<i64>,
    pub error: Option<TwilioError>,
    pub samples: Vec<RtcSample>,
    pub warnings: Vec<WarningEvent>,
}

/// Handle to one call. Cloning is cheap; all clones drive the same call.
///
/// Methods never fail once the call exists except when the call has
/// already shut down. Failures during the call arrive as [`CallEvent`]s.
#[derive(Clone)]
pub struct CallSession {
    parameters: Arc<CallParameters>,
    commands: mpsc::UnboundedSender<CallCommand>,
    state: watch::Receiver<CallState>,
    summary: watch::Receiver<Option<Arc<CallSummary>>>,
    events: broadcast::Sender<CallEvent>,
    muted: Arc<AtomicBool>,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("call_sid", &self.parameters.call_sid)
            .field("direction", &self.parameters.direction)
            .field("state", &self.state.borrow().name())
            .finish()
    }
}

fn valid_digits(digits: &str) -> bool {
    !digits.is_empty()
        && digits
            .chars()
            .all(|c| matches!(c, '0'..='9' | '*' | '#' | 'w' | 'W'))
}

impl CallSession {
    /// Starts the call actor. Outbound calls send their invite right away.
    pub(crate) fn spawn(
        ctx: CallContext,
        peer: Arc<dyn PeerConnection>,
        info: CallInfo,
        remote_offer: Option<String>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(info.state.clone());
        let (summary_tx, summary) = watch::channel(None);
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let muted = Arc::new(AtomicBool::new(false));
        let parameters = info.parameters.clone();

        let channels = CallChannels {
            commands: command_rx,
            state: state_tx,
            summary: summary_tx,
            events: events.clone(),
            muted: muted.clone(),
        };
        let actor = CallActor::new(ctx, peer, info, remote_offer, channels);
        tokio::spawn(actor.run());

        Self {
            parameters,
            commands,
            state,
            summary,
            events,
            muted,
        }
    }

    pub(crate) fn command(&self, cmd: CallCommand) -> Result<(), VoiceError> {
        self.commands
            .send(cmd)
            .map_err(|_| VoiceError::Closed("call"))
    }

    pub fn call_sid(&self) -> &str {
        &self.parameters.call_sid
    }

    pub fn parameters(&self) -> &CallParameters {
        &self.parameters
    }

    pub fn direction(&self) -> CallDirection {
        self.parameters.direction
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Events emitted after this call; earlier ones are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Answers a pending inbound call. Any other active call is
    /// disconnected first.
    pub fn accept(&self) -> Result<(), VoiceError> {
        self.command(CallCommand::Accept)
    }

    pub fn reject(&self) -> Result<(), VoiceError> {
        self.command(CallCommand::Reject)
    }

    /// Closes a pending inbound call locally; the caller keeps ringing
    /// until it gives up.
    pub fn ignore(&self) -> Result<(), VoiceError> {
        self.command(CallCommand::Ignore)
    }

    pub fn disconnect(&self) -> Result<(), VoiceError> {
        self.command(CallCommand::Disconnect)
    }

    pub fn mute(&self, muted: bool) -> Result<(), VoiceError> {
        self.command(CallCommand::Mute(muted))
    }

    /// Sends DTMF. Valid characters are `0-9`, `*`, `#`, and `w`/`W` for a
    /// pause.
    pub fn send_digits(&self, digits: &str) -> Result<(), VoiceError> {
        if !valid_digits(digits) {
            return Err(VoiceError::InvalidArgument(format!(
                "invalid DTMF digits: {digits:?}"
            )));
        }
        self.command(CallCommand::SendDigits(digits.to_string()))
    }

    /// Waits for the call to end and returns its summary.
    pub async fn wait_closed(&self) -> Option<Arc<CallSummary>> {
        let mut rx = self.summary.clone();
        loop {
            if let Some(summary) = rx.borrow_and_update().clone() {
                return Some(summary);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}
