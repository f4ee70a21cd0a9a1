//! Presence registration on top of the signaling channel.

use crate::error::VoiceError;
use crate::insights::{InsightsEvent, InsightsLevel, InsightsSink};
use crate::signaling::{SignalingTransport, TransportState};
use crate::timers::Timers;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use voicecore::errors::{TwilioError, codes};
use voicecore::protocol::{MessageType, SignalingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Destroyed,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
            RegistrationState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

type Reply = oneshot::Sender<Result<(), VoiceError>>;

enum RegistryCommand {
    Register(Reply),
    Unregister(Reply),
    UpdateToken(String),
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RegistryTimer {
    Refresh,
}

/// Handle to the registration actor.
#[derive(Clone)]
pub struct SessionRegistry {
    commands: mpsc::UnboundedSender<RegistryCommand>,
    state: watch::Receiver<RegistrationState>,
}

impl SessionRegistry {
    pub fn spawn(
        signaling: SignalingTransport,
        refresh_interval: Duration,
        insights: Arc<dyn InsightsSink>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(RegistrationState::Unregistered);
        let actor = RegistryActor {
            messages: signaling.subscribe(&[
                MessageType::Ready,
                MessageType::Offline,
                MessageType::Error,
            ]),
            transport: signaling.subscribe_state(),
            signaling,
            commands: command_rx,
            state: state_tx,
            insights,
            refresh_interval,
            timers: Timers::new(),
            pending_register: None,
            pending_unregister: None,
            wants_presence: false,
            halted: false,
            resend_on_open: false,
            transport_open: false,
        };
        tokio::spawn(actor.run());
        Self { commands, state }
    }

    async fn request(&self, make: impl FnOnce(Reply) -> RegistryCommand) -> Result<(), VoiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| VoiceError::Closed("session registry"))?;
        rx.await.map_err(|_| VoiceError::Closed("session registry"))?
    }

    /// Advertises availability for inbound calls. Resolves once the server
    /// confirms with `ready`.
    pub async fn register(&self) -> Result<(), VoiceError> {
        self.request(RegistryCommand::Register).await
    }

    /// Withdraws availability. Resolves once the server confirms with
    /// `offline`.
    pub async fn unregister(&self) -> Result<(), VoiceError> {
        self.request(RegistryCommand::Unregister).await
    }

    /// Replaces the access token and lifts a halt caused by an
    /// authorization error.
    pub fn update_token(&self, token: impl Into<String>) -> Result<(), VoiceError> {
        self.commands
            .send(RegistryCommand::UpdateToken(token.into()))
            .map_err(|_| VoiceError::Closed("session registry"))
    }

    pub fn destroy(&self) {
        let _ = self.commands.send(RegistryCommand::Destroy);
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RegistrationState> {
        self.state.clone()
    }
}

struct RegistryActor {
    signaling: SignalingTransport,
    commands: mpsc::UnboundedReceiver<RegistryCommand>,
    messages: mpsc::UnboundedReceiver<SignalingMessage>,
    transport: watch::Receiver<TransportState>,
    state: watch::Sender<RegistrationState>,
    insights: Arc<dyn InsightsSink>,
    refresh_interval: Duration,
    timers: Timers<RegistryTimer>,
    pending_register: Option<Reply>,
    pending_unregister: Option<Reply>,
    /// The application wants to be registered; drives re-registration.
    wants_presence: bool,
    /// Set by an authorization error; cleared by a new token.
    halted: bool,
    /// A register was in flight when the channel dropped.
    resend_on_open: bool,
    transport_open: bool,
}

impl RegistryActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(RegistryCommand::Destroy) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(msg) = self.messages.recv() => self.on_message(msg),
                Ok(()) = self.transport.changed() => {
                    let state = self.transport.borrow_and_update().clone();
                    self.on_transport_state(state);
                }
                timer = self.timers.expired() => self.on_timer(timer),
            }
        }
        self.shutdown();
    }

    fn current(&self) -> RegistrationState {
        *self.state.borrow()
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register(reply) => {
                let state = self.current();
                if state != RegistrationState::Unregistered {
                    let _ = reply.send(Err(VoiceError::InvalidState(format!(
                        "register() called while {state}"
                    ))));
                    return;
                }
                self.pending_register = Some(reply);
                self.wants_presence = true;
                self.begin_register();
            }
            RegistryCommand::Unregister(reply) => {
                let state = self.current();
                if state != RegistrationState::Registered {
                    let _ = reply.send(Err(VoiceError::InvalidState(format!(
                        "unregister() called while {state}"
                    ))));
                    return;
                }
                info!(target: "Registry", "Unregistering");
                self.wants_presence = false;
                self.timers.cancel(RegistryTimer::Refresh);
                if let Err(e) = self.signaling.send(SignalingMessage::register(false)) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.pending_unregister = Some(reply);
            }
            RegistryCommand::UpdateToken(token) => {
                if self.halted {
                    info!(target: "Registry", "New token received, registration re-enabled");
                }
                self.halted = false;
                if let Err(e) = self.signaling.update_token(token) {
                    warn!(target: "Registry", "Could not forward token: {e}");
                    return;
                }
                if self.wants_presence
                    && self.transport_open
                    && self.current() == RegistrationState::Unregistered
                {
                    self.begin_register();
                }
            }
            RegistryCommand::Destroy => {}
        }
    }

    fn begin_register(&mut self) {
        info!(target: "Registry", "Registering for inbound calls");
        let sent = self
            .signaling
            .open()
            .and_then(|()| self.signaling.send(SignalingMessage::register(true)));
        if let Err(e) = sent {
            self.fail_register(e);
            return;
        }
        self.resend_on_open = false;
        self.set_state(RegistrationState::Registering);
    }

    fn fail_register(&mut self, error: VoiceError) {
        warn!(target: "Registry", "Registration failed: {error}");
        if let Some(reply) = self.pending_register.take() {
            let _ = reply.send(Err(error));
        }
        self.resend_on_open = false;
        self.set_state(RegistrationState::Unregistered);
    }

    fn on_message(&mut self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Ready(_) => match self.current() {
                RegistrationState::Registering => {
                    info!(target: "Registry", "Registered");
                    self.timers.arm(RegistryTimer::Refresh, self.refresh_interval);
                    self.set_state(RegistrationState::Registered);
                    if let Some(reply) = self.pending_register.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
                state => debug!(target: "Registry", "Ignoring ready while {state}"),
            },
            SignalingMessage::Offline(_) => match self.current() {
                RegistrationState::Registered => {
                    self.timers.cancel(RegistryTimer::Refresh);
                    self.set_state(RegistrationState::Unregistered);
                    match self.pending_unregister.take() {
                        Some(reply) => {
                            info!(target: "Registry", "Unregistered");
                            let _ = reply.send(Ok(()));
                        }
                        None => {
                            warn!(target: "Registry", "Server reported offline, will re-register on reconnect");
                        }
                    }
                }
                RegistrationState::Registering => {
                    self.fail_register(
                        TwilioError::new(codes::CONNECTION_ERROR, "registration refused by server").into(),
                    );
                }
                state => debug!(target: "Registry", "Ignoring offline while {state}"),
            },
            SignalingMessage::Error(err) if err.callsid.is_none() => {
                let error = TwilioError::new(err.error.code, err.error.message);
                if !error.is_authorization() {
                    return;
                }
                warn!(target: "Registry", "Authorization failed, halting registration until a new token: {error}");
                self.halted = true;
                self.timers.cancel(RegistryTimer::Refresh);
                match self.current() {
                    RegistrationState::Registering => self.fail_register(error.into()),
                    RegistrationState::Registered => self.set_state(RegistrationState::Unregistered),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn on_transport_state(&mut self, transport: TransportState) {
        let was_open = self.transport_open;
        self.transport_open = transport.is_open();

        match transport {
            TransportState::Open { .. } => match self.current() {
                RegistrationState::Unregistered if self.wants_presence && !self.halted => {
                    info!(target: "Registry", "Channel recovered, re-registering");
                    self.begin_register();
                }
                RegistrationState::Registering if self.resend_on_open => {
                    debug!(target: "Registry", "Re-sending register lost with the previous connection");
                    self.resend_on_open = false;
                    let _ = self.signaling.send(SignalingMessage::register(true));
                }
                _ => {}
            },
            TransportState::Failed { reason } => {
                if self.current() == RegistrationState::Registering {
                    self.fail_register(TwilioError::new(codes::SIGNALING_CONNECTION_ERROR, reason).into());
                } else {
                    self.drop_registration();
                }
            }
            _ if was_open => match self.current() {
                RegistrationState::Registered => self.drop_registration(),
                RegistrationState::Registering => self.resend_on_open = true,
                _ => {}
            },
            _ => {}
        }
    }

    fn drop_registration(&mut self) {
        if self.current() != RegistrationState::Registered {
            return;
        }
        warn!(target: "Registry", "Signaling channel lost while registered");
        self.timers.cancel(RegistryTimer::Refresh);
        self.set_state(RegistrationState::Unregistered);
        if let Some(reply) = self.pending_unregister.take() {
            // Unregistering over a dead channel still ends unregistered.
            let _ = reply.send(Ok(()));
        }
    }

    fn on_timer(&mut self, timer: RegistryTimer) {
        match timer {
            RegistryTimer::Refresh => {
                if self.current() != RegistrationState::Registered {
                    return;
                }
                debug!(target: "Registry", "Refreshing presence");
                let _ = self.signaling.send(SignalingMessage::register(true));
                self.timers.arm(RegistryTimer::Refresh, self.refresh_interval);
            }
        }
    }

    fn set_state(&mut self, next: RegistrationState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(target: "Registry", "State -> {next}");
            self.insights.publish(
                InsightsEvent::new("registration", next.to_string(), InsightsLevel::Info),
            );
        }
    }

    fn shutdown(&mut self) {
        self.timers.clear();
        self.messages.close();
        if let Some(reply) = self.pending_register.take() {
            let _ = reply.send(Err(VoiceError::Closed("session registry")));
        }
        if let Some(reply) = self.pending_unregister.take() {
            let _ = reply.send(Err(VoiceError::Closed("session registry")));
        }
        self.set_state(RegistrationState::Destroyed);
        debug!(target: "Registry", "Registry actor has shut down.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::LogInsightsSink;
    use crate::signaling::SignalingConfig;
    use crate::transport::mock::{MockConnection, MockTransportFactory, registrar};
    use voicecore::protocol::{ErrorBody, ErrorMessage, Extra};

    fn setup(factory: &MockTransportFactory) -> (SignalingTransport, SessionRegistry) {
        let mut config = SignalingConfig::new(vec!["wss://a/signal".to_string()], "token");
        config.heartbeat_timeout = Duration::from_secs(3600);
        let signaling =
            SignalingTransport::spawn(config, Arc::new(factory.clone()), Arc::new(LogInsightsSink));
        let registry = SessionRegistry::spawn(
            signaling.clone(),
            Duration::from_secs(30),
            Arc::new(LogInsightsSink),
        );
        (signaling, registry)
    }

    async fn wait_for(registry: &SessionRegistry, want: RegistrationState) {
        let mut rx = registry.subscribe_state();
        while *rx.borrow_and_update() != want {
            rx.changed().await.unwrap();
        }
    }

    fn register_count(conn: &MockConnection) -> usize {
        conn.sent()
            .iter()
            .filter(|m| matches!(m, SignalingMessage::Register(r) if r.media.audio))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn register_resolves_on_ready() {
        let factory = MockTransportFactory::new().with_responder(registrar);
        let (_signaling, registry) = setup(&factory);

        registry.register().await.unwrap();
        assert_eq!(registry.state(), RegistrationState::Registered);

        let conn = factory.last_connection().unwrap();
        assert_eq!(
            conn.sent_types(),
            vec![MessageType::Listen, MessageType::Register]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn register_twice_is_rejected_without_side_effects() {
        let factory = MockTransportFactory::new().with_responder(registrar);
        let (_signaling, registry) = setup(&factory);
        registry.register().await.unwrap();

        let err = registry.register().await.unwrap_err();
        assert!(matches!(err, VoiceError::InvalidState(_)));
        assert_eq!(registry.state(), RegistrationState::Registered);
        assert_eq!(register_count(&factory.last_connection().unwrap()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_requires_registered() {
        let factory = MockTransportFactory::new().with_responder(registrar);
        let (_signaling, registry) = setup(&factory);
        assert!(matches!(
            registry.unregister().await,
            Err(VoiceError::InvalidState(_))
        ));

        registry.register().await.unwrap();
        registry.unregister().await.unwrap();
        assert_eq!(registry.state(), RegistrationState::Unregistered);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_resends_presence() {
        let factory = MockTransportFactory::new().with_responder(registrar);
        let (_signaling, registry) = setup(&factory);
        registry.register().await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(register_count(&factory.last_connection().unwrap()), 3);
        assert_eq!(registry.state(), RegistrationState::Registered);
    }

    #[tokio::test(start_paused = true)]
    async fn re_registers_after_transport_recovers() {
        let factory = MockTransportFactory::new().with_responder(registrar);
        let (_signaling, registry) = setup(&factory);
        registry.register().await.unwrap();

        factory.last_connection().unwrap().close(1006);
        wait_for(&registry, RegistrationState::Unregistered).await;
        wait_for(&registry, RegistrationState::Registered).await;

        let connections = factory.connections();
        assert_eq!(connections.len(), 2);
        assert_eq!(register_count(&connections[1]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_error_halts_registration() {
        let factory = MockTransportFactory::new().with_responder(|conn, msg| {
            if let SignalingMessage::Register(_) = msg {
                conn.deliver(SignalingMessage::Error(ErrorMessage {
                    callsid: None,
                    error: ErrorBody {
                        code: 20104,
                        message: "token expired".to_string(),
                        extra: Extra::new(),
                    },
                    extra: Extra::new(),
                }));
            }
        });
        let (_signaling, registry) = setup(&factory);

        let err = registry.register().await.unwrap_err();
        assert_eq!(err.twilio().map(|e| e.code), Some(20104));
        assert_eq!(registry.state(), RegistrationState::Unregistered);

        factory.last_connection().unwrap().close(1006);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(registry.state(), RegistrationState::Unregistered);
        assert_eq!(register_count(&factory.last_connection().unwrap()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_terminal() {
        let factory = MockTransportFactory::new().with_responder(registrar);
        let (_signaling, registry) = setup(&factory);
        registry.destroy();
        wait_for(&registry, RegistrationState::Destroyed).await;
        assert!(matches!(
            registry.register().await,
            Err(VoiceError::Closed(_))
        ));
    }
}
