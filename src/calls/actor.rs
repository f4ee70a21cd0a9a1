use super::error::CallError;
use super::session::{CallCommand, CallSummary};
use super::state::{CallInfo, CallState, CallTransition, EndReason};
use crate::config::DeviceOptions;
use crate::insights::{InsightsEvent, InsightsLevel, InsightsSink};
use crate::peer::{PeerConnection, PeerError};
use crate::signaling::SignalingTransport;
use crate::timers::Timers;
use crate::types::events::CallEvent;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use voicecore::errors::{TwilioError, codes};
use voicecore::protocol::SignalingMessage;
use voicecore::recovery::{IceConnectionState, MediaRecovery, MediaRecoveryConfig, RecoveryAction};
use voicecore::stats::{QualityMonitor, QualityThresholds, WarningEvent};

/// What a call tells the device that owns it.
pub(crate) enum DeviceNotice {
    /// Sent before answering; the device clears any other active call and
    /// replies.
    BeforeAccept {
        call_sid: String,
        reply: oneshot::Sender<()>,
    },
    Closed {
        call_sid: String,
    },
}

/// Shared collaborators handed to every call.
#[derive(Clone)]
pub(crate) struct CallContext {
    pub signaling: SignalingTransport,
    pub insights: Arc<dyn InsightsSink>,
    pub device: mpsc::UnboundedSender<DeviceNotice>,
    pub recovery: MediaRecoveryConfig,
    pub thresholds: QualityThresholds,
    pub sample_interval: Duration,
}

impl CallContext {
    pub fn new(
        options: &DeviceOptions,
        signaling: SignalingTransport,
        insights: Arc<dyn InsightsSink>,
        device: mpsc::UnboundedSender<DeviceNotice>,
    ) -> Self {
        Self {
            signaling,
            insights,
            device,
            recovery: options.media_recovery(),
            thresholds: options.thresholds.clone(),
            sample_interval: Duration::from_millis(options.sample_interval_ms),
        }
    }
}

/// The sending halves the actor publishes through.
pub(crate) struct CallChannels {
    pub commands: mpsc::UnboundedReceiver<CallCommand>,
    pub state: watch::Sender<CallState>,
    pub summary: watch::Sender<Option<Arc<CallSummary>>>,
    pub events: broadcast::Sender<CallEvent>,
    pub muted: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CallTimer {
    MediaGrace,
    RestartDeadline,
    RestartRetry,
    Sample,
}

pub(crate) struct CallActor {
    info: CallInfo,
    ctx: CallContext,
    peer: Arc<dyn PeerConnection>,
    channels: CallChannels,
    ice: watch::Receiver<IceConnectionState>,
    recovery: MediaRecovery,
    monitor: QualityMonitor,
    timers: Timers<CallTimer>,
    remote_offer: Option<String>,
    /// A remote description has been applied (answer or early media).
    remote_applied: bool,
    /// Outbound: `answer` arrived. Inbound: `accept()` succeeded.
    answered: bool,
    /// Inbound bytes when the grace timer was armed.
    grace_bytes: u64,
}

impl CallActor {
    pub fn new(
        ctx: CallContext,
        peer: Arc<dyn PeerConnection>,
        info: CallInfo,
        remote_offer: Option<String>,
        channels: CallChannels,
    ) -> Self {
        Self {
            ice: peer.connection_state(),
            recovery: MediaRecovery::new(ctx.recovery),
            monitor: QualityMonitor::new(ctx.thresholds.clone()),
            info,
            ctx,
            peer,
            channels,
            timers: Timers::new(),
            remote_offer,
            remote_applied: false,
            answered: false,
            grace_bytes: 0,
        }
    }

    pub async fn run(mut self) {
        debug!(
            target: "Call",
            "[{}] Call started ({:?})",
            self.sid(),
            self.info.parameters.direction
        );
        if self.info.is_initiator() {
            self.send_invite().await;
        }
        while !self.info.state.is_closed() {
            tokio::select! {
                cmd = self.channels.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => self.hang_up(EndReason::LocalHangup).await,
                },
                Ok(()) = self.ice.changed() => {
                    let ice = *self.ice.borrow_and_update();
                    self.on_ice_state(ice).await;
                }
                timer = self.timers.expired() => self.on_timer(timer).await,
            }
        }
        debug!(target: "Call", "[{}] Call actor has shut down.", self.sid());
    }

    fn sid(&self) -> &str {
        self.info.call_sid()
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.channels.events.send(event);
    }

    fn send(&self, msg: SignalingMessage) {
        if let Err(e) = self.ctx.signaling.send(msg) {
            warn!(target: "Call", "[{}] Could not send: {e}", self.sid());
        }
    }

    fn transition(&mut self, transition: CallTransition) -> bool {
        match self.info.apply_transition(transition) {
            Ok(()) => {
                debug!(target: "Call", "[{}] State -> {}", self.sid(), self.info.state.name());
                self.channels.state.send_replace(self.info.state.clone());
                true
            }
            Err(e) => {
                warn!(target: "Call", "[{}] {e}", self.sid());
                false
            }
        }
    }

    async fn send_invite(&mut self) {
        match self.peer.create_offer(false).await {
            Ok(sdp) => {
                info!(target: "Call", "[{}] Placing outgoing call", self.sid());
                let params = self.info.parameters.custom.to_query();
                self.send(SignalingMessage::outbound_invite(self.sid(), sdp, params));
            }
            Err(e) => self.fail(CallError::from_peer(e)).await,
        }
    }

    async fn handle_command(&mut self, cmd: CallCommand) {
        let pending = self.info.state.is_pending();
        match cmd {
            CallCommand::Accept => self.accept().await,
            CallCommand::Reject | CallCommand::Disconnect if pending => {
                info!(target: "Call", "[{}] Rejecting incoming call", self.sid());
                let reject = SignalingMessage::reject(self.sid());
                self.finish(EndReason::Rejected, None, Some(reject)).await;
            }
            CallCommand::Reject => {
                debug!(target: "Call", "[{}] reject() ignored while {}", self.sid(), self.info.state.name());
            }
            CallCommand::Disconnect => self.hang_up(EndReason::LocalHangup).await,
            CallCommand::Ignore if pending => {
                info!(target: "Call", "[{}] Ignoring incoming call", self.sid());
                self.finish(EndReason::Ignored, None, None).await;
            }
            CallCommand::Ignore => {
                debug!(target: "Call", "[{}] ignore() ignored while {}", self.sid(), self.info.state.name());
            }
            CallCommand::Mute(muted) => {
                if self.channels.muted.swap(muted, Ordering::SeqCst) != muted {
                    self.peer.set_muted(muted).await;
                    self.emit(CallEvent::Muted(muted));
                }
            }
            CallCommand::SendDigits(digits) => {
                if !self.info.state.is_established() {
                    debug!(target: "Call", "[{}] Dropping digits, media not connected", self.sid());
                } else if let Err(e) = self.peer.send_digits(&digits).await {
                    warn!(target: "Call", "[{}] Failed to send digits: {e}", self.sid());
                }
            }
            CallCommand::Signal(msg) => self.on_signal(msg).await,
            CallCommand::Terminate(reason) if pending => self.finish(reason, None, None).await,
            CallCommand::Terminate(reason) => self.hang_up(reason).await,
        }
    }

    async fn accept(&mut self) {
        if !self.info.state.is_pending() {
            debug!(target: "Call", "[{}] accept() ignored while {}", self.sid(), self.info.state.name());
            return;
        }

        let (reply, cleared) = oneshot::channel();
        let notice = DeviceNotice::BeforeAccept {
            call_sid: self.sid().to_string(),
            reply,
        };
        if self.ctx.device.send(notice).is_ok() {
            let _ = cleared.await;
        }

        let Some(offer) = self.remote_offer.take() else {
            let err = PeerError::RemoteDescription("no remote offer".to_string());
            self.fail(CallError::RemoteDescription(err)).await;
            return;
        };
        match self.peer.create_answer(&offer).await {
            Ok(sdp) => {
                info!(target: "Call", "[{}] Accepted incoming call", self.sid());
                self.send(SignalingMessage::answer(self.sid(), sdp));
                self.remote_applied = true;
                self.answered = true;
                self.transition(CallTransition::Accepted);
                self.emit(CallEvent::Accepted);
                self.maybe_open();
            }
            Err(e) => self.fail(CallError::from_peer(e)).await,
        }
    }

    async fn on_signal(&mut self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Ringing(ringing) => {
                if !self.info.is_initiator() || !matches!(self.info.state, CallState::Connecting { .. }) {
                    debug!(target: "Call", "[{}] Ignoring ringing while {}", self.sid(), self.info.state.name());
                    return;
                }
                info!(target: "Call", "[{}] Ringing", self.sid());
                self.transition(CallTransition::RingingReceived);
                self.emit(CallEvent::Ringing);
                if let Some(sdp) = ringing.sdp {
                    self.apply_remote(&sdp).await;
                }
            }
            SignalingMessage::Answer(answer) => {
                if self.info.state.is_established() {
                    if let Err(e) = self.peer.apply_answer(&answer.sdp).await {
                        warn!(target: "Call", "[{}] ICE restart answer rejected: {e}", self.sid());
                    }
                } else if self.info.is_initiator() && self.info.state.is_setting_up() && !self.answered {
                    if !self.remote_applied && !self.apply_remote(&answer.sdp).await {
                        return;
                    }
                    info!(target: "Call", "[{}] Call answered", self.sid());
                    self.answered = true;
                    self.emit(CallEvent::Accepted);
                    self.maybe_open();
                } else {
                    debug!(target: "Call", "[{}] Ignoring answer while {}", self.sid(), self.info.state.name());
                }
            }
            SignalingMessage::Reinvite(offer) if self.info.state.is_established() => {
                match self.peer.create_answer(&offer.sdp).await {
                    Ok(sdp) => self.send(SignalingMessage::answer(self.sid(), sdp)),
                    Err(e) => self.fail(CallError::from_peer(e)).await,
                }
            }
            SignalingMessage::Hangup(hangup) => {
                info!(target: "Call", "[{}] Remote party hung up", self.sid());
                let error = hangup
                    .error
                    .map(|e| TwilioError::new(e.code, e.message));
                self.finish(EndReason::RemoteHangup, error, None).await;
            }
            SignalingMessage::Cancel(_) => {
                info!(target: "Call", "[{}] Call cancelled by caller", self.sid());
                self.finish(EndReason::Cancelled, None, None).await;
            }
            SignalingMessage::Error(err) => {
                let error = TwilioError::new(err.error.code, err.error.message);
                error!(target: "Call", "[{}] Server reported {error}", self.sid());
                self.fail(CallError::Remote(error)).await;
            }
            SignalingMessage::Connected(_) => {
                debug!(target: "Call", "[{}] Server acknowledged the call", self.sid());
            }
            other => {
                debug!(target: "Call", "[{}] Ignoring '{}'", self.sid(), other.message_type());
            }
        }
    }

    /// Returns `false` if the call failed.
    async fn apply_remote(&mut self, sdp: &str) -> bool {
        match self.peer.apply_answer(sdp).await {
            Ok(()) => {
                self.remote_applied = true;
                true
            }
            Err(e) => {
                self.fail(CallError::RemoteDescription(e)).await;
                false
            }
        }
    }

    /// Opens the call once it is answered and media is connected, in
    /// whichever order those happen.
    fn maybe_open(&mut self) {
        let connected = self.ice.borrow().is_connected();
        if !(self.info.state.is_setting_up() && self.answered && connected) {
            return;
        }
        if self.transition(CallTransition::MediaConnected) {
            info!(target: "Call", "[{}] Media connected", self.sid());
            self.emit(CallEvent::Connected);
            self.timers.arm(CallTimer::Sample, self.ctx.sample_interval);
        }
    }

    async fn on_ice_state(&mut self, ice: IceConnectionState) {
        debug!(target: "Call", "[{}] ICE {:?}", self.sid(), ice);
        if self.info.state.is_established() {
            let action = self.recovery.on_state(ice, Instant::now());
            self.apply_recovery(action).await;
        } else if self.info.state.is_setting_up() {
            if ice.is_connected() {
                self.maybe_open();
            } else if ice == IceConnectionState::Failed {
                self.fail(CallError::MediaConnectionFailed(
                    "ICE failed before media connected".to_string(),
                ))
                .await;
            }
        }
    }

    async fn apply_recovery(&mut self, action: RecoveryAction) {
        match action {
            RecoveryAction::Nothing => {}
            RecoveryAction::ArmGrace(after) => {
                self.grace_bytes = self.bytes_received().await;
                debug!(target: "Call", "[{}] Media disconnected, waiting {after:?} for traffic", self.sid());
                self.timers.arm(CallTimer::MediaGrace, after);
            }
            RecoveryAction::CancelGrace => self.timers.cancel(CallTimer::MediaGrace),
            RecoveryAction::StartReconnecting { deadline, retry_in } => {
                warn!(target: "Call", "[{}] Media connection lost, restarting ICE", self.sid());
                self.timers.cancel(CallTimer::MediaGrace);
                if self.transition(CallTransition::MediaInterrupted) {
                    self.emit(CallEvent::Reconnecting(TwilioError::new(
                        codes::MEDIA_CONNECTION_FAILED,
                        "media connection lost, reconnecting",
                    )));
                }
                self.timers.arm_at(CallTimer::RestartDeadline, deadline);
                self.timers.arm(CallTimer::RestartRetry, retry_in);
                self.restart_ice().await;
            }
            RecoveryAction::RestartIce { retry_in } => {
                debug!(target: "Call", "[{}] Retrying ICE restart", self.sid());
                self.timers.arm(CallTimer::RestartRetry, retry_in);
                self.restart_ice().await;
            }
            RecoveryAction::Recovered => {
                self.timers.cancel(CallTimer::MediaGrace);
                self.timers.cancel(CallTimer::RestartDeadline);
                self.timers.cancel(CallTimer::RestartRetry);
                if self.transition(CallTransition::MediaRestored) {
                    info!(target: "Call", "[{}] Media reconnected", self.sid());
                    self.emit(CallEvent::Reconnected);
                }
            }
            RecoveryAction::GiveUp => {
                error!(
                    target: "Call",
                    "[{}] Media not recovered within {:?}, disconnecting",
                    self.sid(),
                    self.ctx.recovery.budget
                );
                self.fail(CallError::MediaConnectionFailed(
                    "ICE restart did not recover media".to_string(),
                ))
                .await;
            }
        }
    }

    async fn restart_ice(&mut self) {
        match self.peer.create_offer(true).await {
            Ok(sdp) => self.send(SignalingMessage::reinvite(self.sid(), sdp)),
            Err(e) => self.fail(CallError::LocalDescription(e)).await,
        }
    }

    async fn bytes_received(&self) -> u64 {
        self.peer
            .stats()
            .await
            .map(|s| s.bytes_received)
            .unwrap_or(0)
    }

    async fn on_timer(&mut self, timer: CallTimer) {
        let now = Instant::now();
        let action = match timer {
            CallTimer::MediaGrace => {
                let still_disconnected = *self.ice.borrow() == IceConnectionState::Disconnected;
                if !self.info.state.is_open() || !still_disconnected {
                    return;
                }
                let traffic_seen = self.bytes_received().await > self.grace_bytes;
                self.recovery.on_grace_elapsed(traffic_seen, now)
            }
            CallTimer::RestartRetry => self.recovery.on_retry_elapsed(now),
            CallTimer::RestartDeadline => self.recovery.on_deadline(now),
            CallTimer::Sample => {
                self.take_sample().await;
                return;
            }
        };
        self.apply_recovery(action).await;
    }

    async fn take_sample(&mut self) {
        if !self.info.state.is_established() {
            return;
        }
        self.timers.arm(CallTimer::Sample, self.ctx.sample_interval);
        let stats = match self.peer.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                debug!(target: "Quality", "[{}] Statistics unavailable: {e}", self.sid());
                return;
            }
        };

        let outcome = self.monitor.push(stats);
        self.emit(CallEvent::Sample(Arc::new(outcome.sample)));
        for event in outcome.events {
            let (name, level) = match &event {
                WarningEvent::Raised(w) => {
                    warn!(target: "Quality", "[{}] Warning raised: {}", self.sid(), w.name);
                    ("warning-raised", InsightsLevel::Warning)
                }
                WarningEvent::Cleared(w) => {
                    info!(target: "Quality", "[{}] Warning cleared: {}", self.sid(), w.name);
                    ("warning-cleared", InsightsLevel::Info)
                }
            };
            self.ctx.insights.publish(
                InsightsEvent::new("network-quality-warning", name, level)
                    .with_call(self.sid())
                    .with_payload(event.warning()),
            );
            match event {
                WarningEvent::Raised(w) => self.emit(CallEvent::Warning(Arc::new(w))),
                WarningEvent::Cleared(w) => self.emit(CallEvent::WarningCleared(Arc::new(w))),
            }
        }
    }

    async fn fail(&mut self, err: CallError) {
        let reason = match err {
            CallError::MediaConnectionFailed(_) => EndReason::MediaFailed,
            _ => EndReason::Error,
        };
        let error = err.to_twilio();
        error!(target: "Call", "[{}] Call failed: {error}", self.sid());
        let hangup = SignalingMessage::hangup(self.sid());
        self.finish(reason, Some(error), Some(hangup)).await;
    }

    async fn hang_up(&mut self, reason: EndReason) {
        info!(target: "Call", "[{}] Hanging up", self.sid());
        let hangup = SignalingMessage::hangup(self.sid());
        self.finish(reason, None, Some(hangup)).await;
    }

    /// Ends the call: the remote notice is queued before the peer is torn
    /// down, then timers, events and the summary follow.
    async fn finish(
        &mut self,
        reason: EndReason,
        error: Option<TwilioError>,
        notify: Option<SignalingMessage>,
    ) {
        if self.info.state.is_closed() {
            return;
        }
        if let Some(msg) = notify {
            self.send(msg);
        }
        self.timers.clear();
        self.peer.close().await;

        if let Some(error) = &error {
            self.emit(CallEvent::Error(error.clone()));
        }
        match reason {
            EndReason::Cancelled => self.emit(CallEvent::Cancelled),
            EndReason::Rejected => self.emit(CallEvent::Rejected),
            EndReason::Ignored => {}
            _ => self.emit(CallEvent::Disconnected),
        }
        self.transition(CallTransition::Ended { reason });

        let duration_secs = match self.info.state {
            CallState::Closed { duration_secs, .. } => duration_secs,
            _ => None,
        };
        let summary = Arc::new(CallSummary {
            parameters: (*self.info.parameters).clone(),
            reason,
            duration_secs,
            error,
            samples: self.monitor.history().to_vec(),
            warnings: self.monitor.warning_log().to_vec(),
        });
        info!(target: "Call", "[{}] Call closed ({reason:?})", self.sid());

        let level = if summary.error.is_some() {
            InsightsLevel::Error
        } else {
            InsightsLevel::Info
        };
        self.ctx.insights.publish(
            InsightsEvent::new("call", "summary", level)
                .with_call(self.sid())
                .with_payload(&*summary),
        );
        self.channels.summary.send_replace(Some(summary.clone()));
        self.emit(CallEvent::Closed(summary));
        let _ = self.ctx.device.send(DeviceNotice::Closed {
            call_sid: self.sid().to_string(),
        });
    }
}
