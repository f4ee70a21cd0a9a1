//! The application-facing device.
//!
//! A [`Device`] owns one signaling channel, one registry and every call
//! made or received through them. Use [`Device::builder`] to inject the
//! transport, peer connection and telemetry capabilities.

use crate::calls::{CallCommand, CallContext, CallInfo, CallSession, DeviceNotice, EndReason};
use crate::config::DeviceOptions;
use crate::error::VoiceError;
use crate::insights::{InsightsSink, LogInsightsSink};
use crate::peer::{NullPeerConnectionFactory, PeerConnectionFactory};
use crate::registry::{RegistrationState, SessionRegistry};
use crate::signaling::{SignalingConfig, SignalingTransport, TransportState};
use crate::transport::{TokioWebSocketTransportFactory, TransportFactory};
use crate::types::events::{
    Destroyed, DeviceError, EventBus, IncomingCall, Registered, Registering, RegistrationChanged,
    TransportStateChanged, Unregistered,
};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use voicecore::errors::{TwilioError, codes};
use voicecore::protocol::{Invite, MessageType, SignalingMessage};
use voicecore::types::call::{CallParameters, CustomParameters};

/// How long `destroy()` and a replacing `accept()` wait for a call to hang up.
const CALL_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const CALL_MESSAGES: &[MessageType] = &[
    MessageType::Invite,
    MessageType::Answer,
    MessageType::Hangup,
    MessageType::Cancel,
    MessageType::Ringing,
    MessageType::Connected,
    MessageType::Reinvite,
    MessageType::Error,
    MessageType::Close,
];

#[derive(Default)]
pub struct DeviceBuilder {
    token: Option<String>,
    options: Option<DeviceOptions>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    peer_factory: Option<Arc<dyn PeerConnectionFactory>>,
    insights: Option<Arc<dyn InsightsSink>>,
}

impl DeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_options(mut self, options: DeviceOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Defaults to websockets over tokio.
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Defaults to peers that negotiate but never carry audio.
    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    /// Defaults to logging every event at debug level.
    pub fn with_insights_sink(mut self, sink: Arc<dyn InsightsSink>) -> Self {
        self.insights = Some(sink);
        self
    }

    /// Spawns the device's actors. Must be called within a tokio runtime.
    pub fn build(self) -> Result<Device, VoiceError> {
        let token = self
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| VoiceError::InvalidArgument("an access token is required".to_string()))?;
        let options = self.options.unwrap_or_default();
        options.validate()?;
        let uris = options.signaling_uris()?;
        info!("Signaling endpoints: {}", uris.join(", "));

        let transport_factory = self
            .transport_factory
            .unwrap_or_else(|| Arc::new(TokioWebSocketTransportFactory::new()));
        let peer_factory = self
            .peer_factory
            .unwrap_or_else(|| Arc::new(NullPeerConnectionFactory));
        let insights = self.insights.unwrap_or_else(|| Arc::new(LogInsightsSink));

        let signaling = SignalingTransport::spawn(
            SignalingConfig::from_options(&options, uris, token),
            transport_factory,
            insights.clone(),
        );
        let registry = SessionRegistry::spawn(
            signaling.clone(),
            Duration::from_secs(options.registration_refresh_secs),
            insights.clone(),
        );
        let events = Arc::new(EventBus::new());

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let actor = DeviceActor {
            call_context: CallContext::new(&options, signaling.clone(), insights, notices_tx),
            messages: signaling.subscribe(CALL_MESSAGES),
            transport: signaling.subscribe_state(),
            registration: registry.subscribe_state(),
            signaling: signaling.clone(),
            registry: registry.clone(),
            peer_factory,
            events: events.clone(),
            allow_incoming_while_busy: options.allow_incoming_while_busy,
            commands: command_rx,
            notices,
            calls: IndexMap::new(),
            active: None,
        };
        tokio::spawn(actor.run());

        Ok(Device {
            inner: Arc::new(DeviceInner {
                commands,
                signaling,
                registry,
                events,
                options,
            }),
        })
    }
}

enum DeviceCommand {
    Connect {
        custom: CustomParameters,
        reply: oneshot::Sender<Result<CallSession, VoiceError>>,
    },
    ActiveCall(oneshot::Sender<Option<CallSession>>),
    Calls(oneshot::Sender<Vec<CallSession>>),
    Destroy(oneshot::Sender<()>),
}

struct DeviceInner {
    commands: mpsc::UnboundedSender<DeviceCommand>,
    signaling: SignalingTransport,
    registry: SessionRegistry,
    events: Arc<EventBus>,
    options: DeviceOptions,
}

/// Cheap to clone; all clones drive the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::new()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> DeviceCommand) -> Result<T, VoiceError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(make(tx))
            .map_err(|_| VoiceError::Closed("device"))?;
        rx.await.map_err(|_| VoiceError::Closed("device"))
    }

    /// Opens the signaling channel if needed and advertises availability for
    /// inbound calls. Fails with `InvalidState` unless unregistered.
    pub async fn register(&self) -> Result<(), VoiceError> {
        self.inner.registry.register().await
    }

    pub async fn unregister(&self) -> Result<(), VoiceError> {
        self.inner.registry.unregister().await
    }

    /// Places an outbound call. Fails with `InvalidState` while another call
    /// is active; everything after that is reported on the call's events.
    pub async fn connect(&self, params: CustomParameters) -> Result<CallSession, VoiceError> {
        self.request(|reply| DeviceCommand::Connect {
            custom: params,
            reply,
        })
        .await?
    }

    pub fn update_token(&self, token: impl Into<String>) -> Result<(), VoiceError> {
        self.inner.registry.update_token(token)
    }

    pub async fn active_call(&self) -> Option<CallSession> {
        self.request(DeviceCommand::ActiveCall).await.ok().flatten()
    }

    /// Every call that has not closed yet, oldest first.
    pub async fn calls(&self) -> Vec<CallSession> {
        self.request(DeviceCommand::Calls).await.unwrap_or_default()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.inner.registry.state()
    }

    pub fn transport_state(&self) -> TransportState {
        self.inner.signaling.state()
    }

    /// Signaling endpoints in preference order.
    pub fn uris(&self) -> &[String] {
        self.inner.signaling.uris()
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.inner.options
    }

    /// Hangs up every call, then tears down registration and signaling.
    pub async fn destroy(&self) {
        let _ = self.request(DeviceCommand::Destroy).await;
    }
}

struct DeviceActor {
    signaling: SignalingTransport,
    registry: SessionRegistry,
    peer_factory: Arc<dyn PeerConnectionFactory>,
    call_context: CallContext,
    events: Arc<EventBus>,
    allow_incoming_while_busy: bool,
    commands: mpsc::UnboundedReceiver<DeviceCommand>,
    notices: mpsc::UnboundedReceiver<DeviceNotice>,
    messages: mpsc::UnboundedReceiver<SignalingMessage>,
    transport: watch::Receiver<TransportState>,
    registration: watch::Receiver<RegistrationState>,
    calls: IndexMap<String, CallSession>,
    /// The call holding the device: outbound from `connect()`, inbound
    /// from `accept()`.
    active: Option<String>,
}

impl DeviceActor {
    async fn run(mut self) {
        let mut last_registration = *self.registration.borrow();
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(DeviceCommand::Destroy(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(notice) = self.notices.recv() => self.on_notice(notice),
                Some(msg) = self.messages.recv() => self.on_message(msg),
                Ok(()) = self.transport.changed() => {
                    let state = self.transport.borrow_and_update().clone();
                    self.on_transport_state(state);
                }
                Ok(()) = self.registration.changed() => {
                    let state = *self.registration.borrow_and_update();
                    self.on_registration_state(last_registration, state);
                    last_registration = state;
                }
            }
        }
        debug!("Device actor has shut down.");
    }

    fn handle_command(&mut self, cmd: DeviceCommand) {
        match cmd {
            DeviceCommand::Connect { custom, reply } => {
                let _ = reply.send(self.connect(custom));
            }
            DeviceCommand::ActiveCall(reply) => {
                let active = self.active.as_ref().and_then(|sid| self.calls.get(sid)).cloned();
                let _ = reply.send(active);
            }
            DeviceCommand::Calls(reply) => {
                let _ = reply.send(self.calls.values().cloned().collect());
            }
            DeviceCommand::Destroy(_) => {}
        }
    }

    fn connect(&mut self, custom: CustomParameters) -> Result<CallSession, VoiceError> {
        if let Some(active) = &self.active {
            return Err(VoiceError::InvalidState(format!(
                "call {active} is already active"
            )));
        }
        self.signaling.open()?;

        let info = CallInfo::new_outgoing(CallParameters::outgoing(custom));
        let sid = info.call_sid().to_string();
        info!("Starting outgoing call {sid}");
        let call = CallSession::spawn(
            self.call_context.clone(),
            self.peer_factory.create(),
            info,
            None,
        );
        self.calls.insert(sid.clone(), call.clone());
        self.active = Some(sid);
        Ok(call)
    }

    fn on_invite(&mut self, invite: Invite) {
        let sid = invite.callsid.clone();
        if self.calls.contains_key(&sid) {
            debug!("Duplicate invite for {sid}");
            return;
        }
        if self.active.is_some() && !self.allow_incoming_while_busy {
            info!("Device busy, ignoring incoming call {sid}");
            return;
        }

        let parameters = CallParameters::from_invite(&invite);
        info!(
            "Incoming call {sid} from {}",
            parameters.from.as_deref().unwrap_or("unknown")
        );
        let call = CallSession::spawn(
            self.call_context.clone(),
            self.peer_factory.create(),
            CallInfo::new_incoming(parameters),
            Some(invite.sdp),
        );
        self.calls.insert(sid, call.clone());
        let _ = self.events.incoming.send(Arc::new(IncomingCall { call }));
    }

    fn on_message(&mut self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Invite(invite) => self.on_invite(invite),
            SignalingMessage::Close(_) => {
                warn!("Server closed the session");
                self.report(
                    TwilioError::new(codes::CONNECTION_ERROR, "session closed by server"),
                    None,
                );
            }
            SignalingMessage::Error(err) if err.callsid.is_none() => {
                let error = TwilioError::new(err.error.code, err.error.message);
                warn!("Server reported {error}");
                self.report(error, None);
            }
            msg => {
                let Some(sid) = msg.call_sid().map(str::to_string) else {
                    debug!("Dropping '{}' without a callsid", msg.message_type());
                    return;
                };
                match self.calls.get(&sid) {
                    Some(call) => {
                        let _ = call.command(CallCommand::Signal(msg));
                    }
                    None => {
                        if let SignalingMessage::Error(err) = msg {
                            let error = TwilioError::new(err.error.code, err.error.message);
                            self.report(error, Some(sid));
                        } else {
                            debug!("No call {sid} for '{}'", msg.message_type());
                        }
                    }
                }
            }
        }
    }

    fn on_notice(&mut self, notice: DeviceNotice) {
        match notice {
            DeviceNotice::BeforeAccept { call_sid, reply } => {
                let previous = self.active.replace(call_sid.clone());
                let replaced = previous
                    .filter(|p| *p != call_sid)
                    .and_then(|p| self.calls.get(&p).cloned());
                let Some(call) = replaced else {
                    let _ = reply.send(());
                    return;
                };
                info!("Disconnecting {} to accept {call_sid}", call.call_sid());
                let _ = call.command(CallCommand::Terminate(EndReason::Replaced));
                // The answer must not reach the server before the hangup.
                tokio::spawn(async move {
                    if tokio::time::timeout(CALL_TEARDOWN_TIMEOUT, call.wait_closed())
                        .await
                        .is_err()
                    {
                        warn!("Call {} did not close in time", call.call_sid());
                    }
                    let _ = reply.send(());
                });
            }
            DeviceNotice::Closed { call_sid } => {
                self.calls.shift_remove(&call_sid);
                if self.active.as_deref() == Some(call_sid.as_str()) {
                    self.active = None;
                }
            }
        }
    }

    fn on_transport_state(&mut self, state: TransportState) {
        if let TransportState::Failed { reason } = &state {
            self.report(
                TwilioError::new(codes::SIGNALING_CONNECTION_ERROR, reason.clone()),
                None,
            );
        }
        let _ = self
            .events
            .transport_state
            .send(Arc::new(TransportStateChanged { state }));
    }

    fn on_registration_state(&mut self, previous: RegistrationState, state: RegistrationState) {
        let _ = self
            .events
            .registration_state
            .send(Arc::new(RegistrationChanged { state }));
        match state {
            RegistrationState::Registering => {
                let _ = self.events.registering.send(Arc::new(Registering));
            }
            RegistrationState::Registered => {
                let _ = self.events.registered.send(Arc::new(Registered));
            }
            RegistrationState::Unregistered if previous == RegistrationState::Registered => {
                let _ = self.events.unregistered.send(Arc::new(Unregistered));
            }
            _ => {}
        }
    }

    fn report(&self, error: TwilioError, call_sid: Option<String>) {
        let _ = self
            .events
            .error
            .send(Arc::new(DeviceError { error, call_sid }));
    }

    async fn teardown(&mut self) {
        info!("Destroying device with {} open calls", self.calls.len());
        let calls: Vec<CallSession> = self.calls.values().cloned().collect();
        for call in &calls {
            let _ = call.command(CallCommand::Terminate(EndReason::LocalHangup));
        }
        for call in &calls {
            if tokio::time::timeout(CALL_TEARDOWN_TIMEOUT, call.wait_closed())
                .await
                .is_err()
            {
                warn!("Call {} did not close in time", call.call_sid());
            }
        }
        self.calls.clear();
        self.active = None;
        self.registry.destroy();
        self.signaling.destroy();
        let _ = self.events.destroyed.send(Arc::new(Destroyed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::CallState;
    use crate::peer::mock::MockPeerConnectionFactory;
    use crate::transport::mock::{MockConnection, MockTransportFactory, registrar};
    use crate::types::events::CallEvent;
    use voicecore::protocol::{CallRef, Extra};

    struct Harness {
        device: Device,
        transport: MockTransportFactory,
        peers: Arc<MockPeerConnectionFactory>,
    }

    fn harness(options: DeviceOptions) -> Harness {
        let transport = MockTransportFactory::new().with_responder(registrar);
        let peers = Arc::new(MockPeerConnectionFactory::new());
        let device = Device::builder()
            .with_token("token")
            .with_options(options)
            .with_transport_factory(Arc::new(transport.clone()))
            .with_peer_factory(peers.clone())
            .build()
            .unwrap();
        Harness {
            device,
            transport,
            peers,
        }
    }

    fn quiet_options() -> DeviceOptions {
        DeviceOptions {
            heartbeat_timeout_ms: 3_600_000,
            ..DeviceOptions::default()
        }
    }

    fn invite(sid: &str) -> SignalingMessage {
        SignalingMessage::Invite(Invite {
            callsid: sid.to_string(),
            sdp: "v=0 remote-offer".to_string(),
            parameters: Some(
                serde_json::json!({"CallSid": sid, "From": "client:alice"})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            ),
            twilio: None,
            extra: Extra::new(),
        })
    }

    async fn wait_state(call: &CallSession, done: impl Fn(&CallState) -> bool) {
        let mut rx = call.subscribe_state();
        while !done(&rx.borrow_and_update()) {
            rx.changed().await.unwrap();
        }
    }

    async fn wait_sent(conn: &MockConnection, kind: MessageType, count: usize) -> Vec<MessageType> {
        for _ in 0..1000 {
            let sent = conn.sent_types();
            if sent.iter().filter(|t| **t == kind).count() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("never sent {count} '{kind}' messages: {:?}", conn.sent_types());
    }

    #[test]
    fn build_requires_token() {
        let result = Device::builder().build();
        assert!(matches!(result, Err(VoiceError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_call_accept_and_remote_hangup() {
        let h = harness(quiet_options());
        let mut incoming = h.device.events().incoming.subscribe();
        h.device.register().await.unwrap();

        let conn = h.transport.last_connection().unwrap();
        conn.deliver(invite("CA1"));
        let call = incoming.recv().await.unwrap().call.clone();
        assert_eq!(call.parameters().from.as_deref(), Some("client:alice"));
        assert!(call.state().is_pending());

        call.accept().unwrap();
        wait_state(&call, CallState::is_open).await;
        assert_eq!(
            h.peers.last().unwrap().remote_offers(),
            vec!["v=0 remote-offer".to_string()]
        );
        assert_eq!(
            h.device.active_call().await.map(|c| c.call_sid().to_string()),
            Some("CA1".to_string())
        );
        assert!(conn.sent_types().contains(&MessageType::Answer));

        conn.deliver(SignalingMessage::hangup("CA1"));
        let summary = call.wait_closed().await.unwrap();
        assert_eq!(summary.reason, EndReason::RemoteHangup);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(h.device.active_call().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_active_is_rejected() {
        let h = harness(quiet_options());
        let call = h
            .device
            .connect(CustomParameters::new().with("To", "client:bob"))
            .await
            .unwrap();
        assert!(call.call_sid().starts_with("TJS"));

        let err = h.device.connect(CustomParameters::new()).await.unwrap_err();
        assert!(matches!(err, VoiceError::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_device_ignores_invites() {
        let h = harness(quiet_options());
        let mut incoming = h.device.events().incoming.subscribe();
        let _call = h.device.connect(CustomParameters::new()).await.unwrap();
        h.device.register().await.unwrap();

        h.transport.last_connection().unwrap().deliver(invite("CA2"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(incoming.try_recv().is_err());
        assert_eq!(h.device.calls().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn accepting_replaces_the_active_call() {
        let options = DeviceOptions {
            allow_incoming_while_busy: true,
            ..quiet_options()
        };
        let h = harness(options);
        let mut incoming = h.device.events().incoming.subscribe();
        h.device.register().await.unwrap();
        let conn = h.transport.last_connection().unwrap();

        conn.deliver(invite("CA1"));
        let first = incoming.recv().await.unwrap().call.clone();
        first.accept().unwrap();
        wait_state(&first, CallState::is_open).await;

        conn.deliver(invite("CA2"));
        let second = incoming.recv().await.unwrap().call.clone();
        second.accept().unwrap();

        let summary = first.wait_closed().await.unwrap();
        assert_eq!(summary.reason, EndReason::Replaced);
        wait_state(&second, CallState::is_open).await;

        let sent = wait_sent(&conn, MessageType::Answer, 2).await;
        let hangup = sent.iter().position(|t| *t == MessageType::Hangup).unwrap();
        let second_answer = sent
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == MessageType::Answer)
            .nth(1)
            .map(|(i, _)| i)
            .unwrap();
        assert!(hangup < second_answer, "answered before hanging up: {sent:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replaced_call_hangs_up_before_the_new_answer() {
        for round in 0..20 {
            let options = DeviceOptions {
                allow_incoming_while_busy: true,
                ..quiet_options()
            };
            let h = harness(options);
            let mut incoming = h.device.events().incoming.subscribe();
            h.device.register().await.unwrap();
            let conn = h.transport.last_connection().unwrap();

            conn.deliver(invite("CA1"));
            let first = incoming.recv().await.unwrap().call.clone();
            first.accept().unwrap();
            wait_state(&first, CallState::is_open).await;

            conn.deliver(invite("CA2"));
            let second = incoming.recv().await.unwrap().call.clone();
            second.accept().unwrap();
            wait_state(&second, CallState::is_open).await;

            let answers_then_hangup: Vec<MessageType> = wait_sent(&conn, MessageType::Answer, 2)
                .await
                .into_iter()
                .filter(|t| matches!(t, MessageType::Answer | MessageType::Hangup))
                .collect();
            assert_eq!(
                answers_then_hangup,
                vec![MessageType::Answer, MessageType::Hangup, MessageType::Answer],
                "round {round}"
            );
            h.device.destroy().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_closes_pending_call() {
        let h = harness(quiet_options());
        let mut incoming = h.device.events().incoming.subscribe();
        h.device.register().await.unwrap();
        let conn = h.transport.last_connection().unwrap();

        conn.deliver(invite("CA3"));
        let call = incoming.recv().await.unwrap().call.clone();
        let mut events = call.subscribe();
        conn.deliver(SignalingMessage::Cancel(CallRef::new("CA3")));

        assert!(matches!(events.recv().await.unwrap(), CallEvent::Cancelled));
        assert!(matches!(events.recv().await.unwrap(), CallEvent::Closed(_)));
        assert!(!conn.sent_types().contains(&MessageType::Hangup));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_hangs_up_and_emits_destroyed() {
        let h = harness(quiet_options());
        let mut destroyed = h.device.events().destroyed.subscribe();
        let call = h.device.connect(CustomParameters::new()).await.unwrap();
        h.device.register().await.unwrap();

        h.device.destroy().await;
        assert!(destroyed.recv().await.is_ok());
        let summary = call.wait_closed().await.unwrap();
        assert_eq!(summary.reason, EndReason::LocalHangup);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let sent = h.transport.last_connection().unwrap().sent_types();
        assert_eq!(sent.last(), Some(&MessageType::Hangup));
        assert!(matches!(
            h.device.register().await,
            Err(VoiceError::Closed(_))
        ));
    }
}
