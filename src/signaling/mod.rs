//! Control channel to the signaling service.
//!
//! One actor task owns the websocket and everything about it: the current
//! [`TransportSession`], the outgoing queue, the reconnect policy and the
//! heartbeat deadline. [`SignalingTransport`] is a cheap, cloneable handle
//! that talks to the actor through a command queue.
//!
//! # Reconnection
//!
//! - Local `close()`/`destroy()` never reconnects.
//! - An abnormal close (1006, including failed or timed out connects) or a
//!   TLS failure (1015) before the channel was ever open moves on to the
//!   next endpoint.
//! - Any other failure retries the same endpoint with capped exponential
//!   backoff until `max_reconnect_attempts` is spent.

mod router;

use crate::config::DeviceOptions;
use crate::error::VoiceError;
use crate::insights::{InsightsEvent, InsightsLevel, InsightsSink};
use crate::timers::Timers;
use futures_util::future::BoxFuture;
use log::{debug, error, info, trace, warn};
use router::MessageRouter;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use voicecore::backoff::BackoffConfig;
use voicecore::errors::{TwilioError, codes};
use voicecore::net::{Transport, TransportEvent, TransportFactory, close_code};
use voicecore::protocol::{MessageType, SignalingMessage};
use voicecore::reconnect::{ReconnectDecision, ReconnectPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TransportState {
    Closed,
    Connecting {
        uri: String,
    },
    Open {
        uri: String,
    },
    Reconnecting {
        uri: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Reconnection gave up. `open()` starts over.
    Failed {
        reason: String,
    },
}

impl TransportState {
    pub fn is_open(&self) -> bool {
        matches!(self, TransportState::Open { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportState::Closed => "closed",
            TransportState::Connecting { .. } => "connecting",
            TransportState::Open { .. } => "open",
            TransportState::Reconnecting { .. } => "reconnecting",
            TransportState::Failed { .. } => "failed",
        }
    }
}

#[derive(Clone)]
pub struct SignalingConfig {
    /// Endpoints in preference order.
    pub uris: Vec<String>,
    /// Sent in a `listen` message every time the channel opens.
    pub token: String,
    pub backoff: BackoffConfig,
    pub max_reconnect_attempts: u32,
    pub repeat_uris: bool,
    pub connect_timeout: Duration,
    pub heartbeat_timeout: Duration,
}

impl fmt::Debug for SignalingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingConfig")
            .field("uris", &self.uris)
            .field("token", &"<redacted>")
            .field("backoff", &self.backoff)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("repeat_uris", &self.repeat_uris)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .finish()
    }
}

impl SignalingConfig {
    pub fn new(uris: Vec<String>, token: impl Into<String>) -> Self {
        Self::from_options(&DeviceOptions::default(), uris, token)
    }

    pub fn from_options(options: &DeviceOptions, uris: Vec<String>, token: impl Into<String>) -> Self {
        Self {
            uris,
            token: token.into(),
            backoff: options.backoff(),
            max_reconnect_attempts: options.max_reconnect_attempts,
            repeat_uris: options.repeat_uris,
            connect_timeout: Duration::from_millis(options.connect_timeout_ms),
            heartbeat_timeout: Duration::from_millis(options.heartbeat_timeout_ms),
        }
    }
}

enum SignalingCommand {
    Open,
    Close,
    Destroy,
    Send(SignalingMessage),
    Subscribe {
        types: Vec<MessageType>,
        tx: mpsc::UnboundedSender<SignalingMessage>,
    },
    UpdateToken(String),
}

/// Handle to the signaling actor.
#[derive(Clone)]
pub struct SignalingTransport {
    commands: mpsc::UnboundedSender<SignalingCommand>,
    state: watch::Receiver<TransportState>,
    uris: Arc<Vec<String>>,
}

impl fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingTransport")
            .field("state", &*self.state.borrow())
            .field("uris", &self.uris)
            .finish()
    }
}

impl SignalingTransport {
    /// Spawns the actor. The channel stays closed until [`open`](Self::open).
    pub fn spawn(
        config: SignalingConfig,
        factory: Arc<dyn TransportFactory>,
        insights: Arc<dyn InsightsSink>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(TransportState::Closed);
        let uris = Arc::new(config.uris.clone());
        let actor = SignalingActor {
            policy: ReconnectPolicy::new(
                config.uris.len(),
                config.repeat_uris,
                config.max_reconnect_attempts,
                config.backoff,
            ),
            config,
            factory,
            insights,
            commands: command_rx,
            state: state_tx,
            session: None,
            connecting: None,
            queue: VecDeque::new(),
            router: MessageRouter::new(),
            timers: Timers::new(),
            wants_open: false,
        };
        tokio::spawn(actor.run());
        Self {
            commands,
            state,
            uris,
        }
    }

    fn command(&self, cmd: SignalingCommand) -> Result<(), VoiceError> {
        self.commands
            .send(cmd)
            .map_err(|_| VoiceError::Closed("signaling transport"))
    }

    pub fn open(&self) -> Result<(), VoiceError> {
        self.command(SignalingCommand::Open)
    }

    pub fn close(&self) -> Result<(), VoiceError> {
        self.command(SignalingCommand::Close)
    }

    /// Closes the channel, drops every subscription and stops the actor.
    pub fn destroy(&self) {
        let _ = self.command(SignalingCommand::Destroy);
    }

    /// Sends now if the channel is open, otherwise queues until it is.
    pub fn send(&self, msg: SignalingMessage) -> Result<(), VoiceError> {
        self.command(SignalingCommand::Send(msg))
    }

    pub fn update_token(&self, token: impl Into<String>) -> Result<(), VoiceError> {
        self.command(SignalingCommand::UpdateToken(token.into()))
    }

    /// Receives every incoming message of the given types.
    pub fn subscribe(&self, types: &[MessageType]) -> mpsc::UnboundedReceiver<SignalingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.command(SignalingCommand::Subscribe {
            types: types.to_vec(),
            tx,
        });
        rx
    }

    pub fn state(&self) -> TransportState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.clone()
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    /// Resolves with the connected URI once the channel is open.
    pub async fn wait_open(&self) -> Result<String, VoiceError> {
        let mut rx = self.state.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                TransportState::Open { uri } => return Ok(uri),
                TransportState::Failed { reason } => {
                    return Err(TwilioError::new(codes::SIGNALING_CONNECTION_ERROR, reason).into());
                }
                _ => {}
            }
            rx.changed()
                .await
                .map_err(|_| VoiceError::Closed("signaling transport"))?;
        }
    }
}

/// The live connection. A new one is created for every successful connect.
struct TransportSession {
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    uri: String,
    next_seq: u64,
}

type ConnectResult = Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;

struct PendingConnect {
    uri: String,
    future: BoxFuture<'static, ConnectResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SignalingTimer {
    Reconnect,
    Heartbeat,
}

struct SignalingActor {
    config: SignalingConfig,
    factory: Arc<dyn TransportFactory>,
    insights: Arc<dyn InsightsSink>,
    commands: mpsc::UnboundedReceiver<SignalingCommand>,
    state: watch::Sender<TransportState>,
    policy: ReconnectPolicy,
    session: Option<TransportSession>,
    connecting: Option<PendingConnect>,
    queue: VecDeque<SignalingMessage>,
    router: MessageRouter,
    timers: Timers<SignalingTimer>,
    wants_open: bool,
}

async fn connect_result(pending: &mut Option<PendingConnect>) -> ConnectResult {
    match pending {
        Some(pending) => (&mut pending.future).await,
        None => std::future::pending().await,
    }
}

async fn next_event(session: &mut Option<TransportSession>) -> Option<TransportEvent> {
    match session {
        Some(session) => session.events.recv().await,
        None => std::future::pending().await,
    }
}

impl SignalingActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                result = connect_result(&mut self.connecting) => self.on_connect_result(result).await,
                event = next_event(&mut self.session) => self.on_transport_event(event).await,
                timer = self.timers.expired() => self.on_timer(timer).await,
            }
        }
        self.close_channel().await;
        self.router.clear();
        debug!(target: "Signaling", "Signaling actor has shut down.");
    }

    async fn handle_command(&mut self, cmd: SignalingCommand) -> bool {
        match cmd {
            SignalingCommand::Open => self.open_channel(),
            SignalingCommand::Close => self.close_channel().await,
            SignalingCommand::Destroy => return false,
            SignalingCommand::Send(msg) => self.enqueue(msg).await,
            SignalingCommand::Subscribe { types, tx } => self.router.subscribe(&types, tx),
            SignalingCommand::UpdateToken(token) => {
                self.config.token = token;
                if self.session.is_some() {
                    self.send_listen().await;
                }
            }
        }
        true
    }

    fn open_channel(&mut self) {
        if self.wants_open {
            debug!(target: "Signaling", "open() while already {}", self.state.borrow().name());
            return;
        }
        self.wants_open = true;
        self.policy.restart();
        self.start_connect();
    }

    async fn close_channel(&mut self) {
        self.wants_open = false;
        self.connecting = None;
        self.timers.clear();
        if let Some(session) = self.session.take() {
            info!(target: "Signaling", "Closing connection to {}", session.uri);
            session.transport.disconnect().await;
        }
        if !self.queue.is_empty() {
            debug!(target: "Signaling", "Discarding {} queued messages on close", self.queue.len());
            self.queue.clear();
        }
        self.set_state(TransportState::Closed);
    }

    fn start_connect(&mut self) {
        let Some(uri) = self.config.uris.get(self.policy.current_index()).cloned() else {
            error!(target: "Signaling", "No signaling endpoints configured");
            self.wants_open = false;
            self.set_state(TransportState::Failed {
                reason: "no signaling endpoints configured".to_string(),
            });
            return;
        };

        info!(target: "Signaling", "Connecting to {uri}");
        self.set_state(TransportState::Connecting { uri: uri.clone() });

        let factory = self.factory.clone();
        let timeout = self.config.connect_timeout;
        let target = uri.clone();
        let future = Box::pin(async move {
            match tokio::time::timeout(timeout, factory.create_transport(&target)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("connect to {target} timed out after {timeout:?}")),
            }
        });
        self.connecting = Some(PendingConnect { uri, future });
    }

    async fn on_connect_result(&mut self, result: ConnectResult) {
        let Some(pending) = self.connecting.take() else {
            return;
        };
        match result {
            Ok((transport, events)) => {
                info!(target: "Signaling", "Connected to {}", pending.uri);
                self.policy.on_open();
                self.session = Some(TransportSession {
                    transport,
                    events,
                    uri: pending.uri.clone(),
                    next_seq: 0,
                });
                self.timers.arm(SignalingTimer::Heartbeat, self.config.heartbeat_timeout);
                self.set_state(TransportState::Open { uri: pending.uri });
                self.send_listen().await;
                self.flush_queue().await;
            }
            Err(e) => {
                warn!(target: "Signaling", "Connection to {} failed: {e}", pending.uri);
                self.on_failure(close_code::ABNORMAL, &e.to_string());
            }
        }
    }

    async fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(text)) => {
                self.timers.arm(SignalingTimer::Heartbeat, self.config.heartbeat_timeout);
                if text.trim().is_empty() {
                    trace!(target: "Signaling", "<-- heartbeat");
                    return;
                }
                match SignalingMessage::decode(&text) {
                    Ok(msg) => {
                        trace!(target: "Signaling", "<-- {}", msg.message_type());
                        if let SignalingMessage::Unknown { kind, .. } = &msg {
                            debug!(target: "Signaling", "Received unknown message type '{kind}'");
                        }
                        if !self.router.dispatch(&msg) {
                            debug!(target: "Signaling", "No subscriber for '{}'", msg.message_type());
                        }
                    }
                    Err(e) => warn!(target: "Signaling", "Dropping malformed message: {e}"),
                }
            }
            Some(TransportEvent::Closed { code, reason }) => {
                info!(target: "Signaling", "Connection closed by remote (code {code}) {reason}");
                self.session = None;
                self.on_failure(code, &reason);
            }
            None => {
                warn!(target: "Signaling", "Transport event stream ended unexpectedly");
                self.session = None;
                self.on_failure(close_code::ABNORMAL, "event stream ended");
            }
        }
    }

    async fn on_timer(&mut self, timer: SignalingTimer) {
        match timer {
            SignalingTimer::Reconnect => {
                if self.wants_open && self.session.is_none() && self.connecting.is_none() {
                    self.start_connect();
                }
            }
            SignalingTimer::Heartbeat => {
                let Some(session) = self.session.take() else {
                    return;
                };
                warn!(
                    target: "Signaling",
                    "No traffic from {} for {:?}, reconnecting",
                    session.uri,
                    self.config.heartbeat_timeout
                );
                session.transport.disconnect().await;
                self.on_failure(close_code::ABNORMAL, "heartbeat timeout");
            }
        }
    }

    fn on_failure(&mut self, code: u16, reason: &str) {
        self.timers.cancel(SignalingTimer::Heartbeat);
        if !self.wants_open {
            self.set_state(TransportState::Closed);
            return;
        }
        match self.policy.on_failure(code) {
            ReconnectDecision::Retry {
                uri_index,
                delay,
                fallback,
                attempt,
            } => {
                let uri = self.config.uris.get(uri_index).cloned().unwrap_or_default();
                if fallback {
                    info!(target: "Signaling", "Endpoint unreachable (code {code}), falling back to {uri}");
                } else {
                    info!(target: "Signaling", "Will reconnect to {uri} in {delay:?} (attempt {attempt})");
                }
                self.timers.arm(SignalingTimer::Reconnect, delay);
                self.set_state(TransportState::Reconnecting {
                    uri,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            ReconnectDecision::GiveUp => {
                error!(
                    target: "Signaling",
                    "Giving up after {} reconnect attempts: {reason}",
                    self.config.max_reconnect_attempts
                );
                self.wants_open = false;
                self.set_state(TransportState::Failed {
                    reason: reason.to_string(),
                });
            }
        }
    }

    async fn enqueue(&mut self, msg: SignalingMessage) {
        if self.session.is_some() && self.queue.is_empty() {
            self.send_now(msg, true).await;
        } else {
            debug!(
                target: "Signaling",
                "Queued '{}' until the channel is open ({} pending)",
                msg.message_type(),
                self.queue.len() + 1
            );
            self.queue.push_back(msg);
        }
    }

    async fn send_listen(&mut self) {
        if !self.config.token.is_empty() {
            let listen = SignalingMessage::listen(self.config.token.clone());
            self.send_now(listen, false).await;
        }
    }

    async fn flush_queue(&mut self) {
        if !self.queue.is_empty() {
            debug!(target: "Signaling", "Flushing {} queued messages", self.queue.len());
        }
        while let Some(msg) = self.queue.pop_front() {
            if !self.send_now(msg, true).await {
                break;
            }
        }
    }

    /// Returns `false` if the transport failed; the message is put back at
    /// the head of the queue when `requeue` is set.
    async fn send_now(&mut self, msg: SignalingMessage, requeue: bool) -> bool {
        let Some(session) = self.session.as_mut() else {
            if requeue {
                self.queue.push_front(msg);
            }
            return false;
        };
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(target: "Signaling", "Failed to encode '{}': {e}", msg.message_type());
                return true;
            }
        };
        session.next_seq += 1;
        let seq = session.next_seq;
        match session.transport.send(&text).await {
            Ok(()) => {
                trace!(target: "Signaling", "--> #{seq} {}", msg.message_type());
                true
            }
            Err(e) => {
                warn!(target: "Signaling", "Send of '{}' failed: {e}", msg.message_type());
                if requeue {
                    self.queue.push_front(msg);
                }
                if let Some(session) = self.session.take() {
                    session.transport.disconnect().await;
                }
                self.on_failure(close_code::ABNORMAL, &e.to_string());
                false
            }
        }
    }

    fn set_state(&mut self, next: TransportState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if !changed {
            return;
        }
        debug!(target: "Signaling", "State -> {:?}", next);
        let level = match next {
            TransportState::Failed { .. } => InsightsLevel::Error,
            TransportState::Reconnecting { .. } => InsightsLevel::Warning,
            _ => InsightsLevel::Info,
        };
        self.insights.publish(
            InsightsEvent::new("connection", next.name(), level).with_payload(&next),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::LogInsightsSink;
    use crate::transport::mock::MockTransportFactory;

    fn spawn(factory: &MockTransportFactory, uris: &[&str]) -> SignalingTransport {
        let config = SignalingConfig::new(uris.iter().map(|u| u.to_string()).collect(), "token");
        SignalingTransport::spawn(config, Arc::new(factory.clone()), Arc::new(LogInsightsSink))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_and_sends_listen_first() {
        let factory = MockTransportFactory::new();
        let signaling = spawn(&factory, &["wss://a/signal"]);
        signaling.send(SignalingMessage::register(true)).unwrap();
        signaling.open().unwrap();
        assert_eq!(signaling.wait_open().await.unwrap(), "wss://a/signal");

        let conn = factory.last_connection().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(
            conn.sent_types(),
            vec![MessageType::Listen, MessageType::Register]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_silence_reconnects_same_uri() {
        let factory = MockTransportFactory::new();
        let signaling = spawn(&factory, &["wss://a/signal", "wss://b/signal"]);
        signaling.open().unwrap();
        signaling.wait_open().await.unwrap();

        let mut state = signaling.subscribe_state();
        tokio::time::sleep(Duration::from_secs(16)).await;
        state.changed().await.unwrap();
        signaling.wait_open().await.unwrap();

        assert_eq!(factory.attempts(), vec!["wss://a/signal", "wss://a/signal"]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_counts_as_unreachable() {
        let factory = MockTransportFactory::new();
        factory.hang("wss://a/signal");
        let signaling = spawn(&factory, &["wss://a/signal", "wss://b/signal"]);
        signaling.open().unwrap();
        assert_eq!(signaling.wait_open().await.unwrap(), "wss://b/signal");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_retries() {
        let factory = MockTransportFactory::new();
        factory.fail_always("wss://a/signal");
        let signaling = spawn(&factory, &["wss://a/signal"]);
        signaling.open().unwrap();
        let err = signaling.wait_open().await.unwrap_err();
        assert_eq!(err.twilio().map(|e| e.code), Some(53000));
        assert_eq!(factory.attempts().len(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn local_close_does_not_reconnect() {
        let factory = MockTransportFactory::new();
        let signaling = spawn(&factory, &["wss://a/signal"]);
        signaling.open().unwrap();
        signaling.wait_open().await.unwrap();
        signaling.close().unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(signaling.state(), TransportState::Closed);
        assert_eq!(factory.attempts().len(), 1);
    }
}
