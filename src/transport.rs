pub use twilio_voice_tokio_transport::TokioWebSocketTransportFactory;
pub use voicecore::net::{Transport, TransportEvent, TransportFactory, close_code};

/// In-memory transports with scripted connect outcomes, for tests.
pub mod mock {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use voicecore::protocol::{MessageType, SignalingMessage};

    const EVENT_CHANNEL_CAPACITY: usize = 256;

    /// Called for every message a client sends; may reply through the
    /// connection.
    pub type Responder = Arc<dyn Fn(&MockConnection, &SignalingMessage) + Send + Sync>;

    /// The server side of one accepted connection.
    #[derive(Clone)]
    pub struct MockConnection {
        id: usize,
        uri: String,
        sent: Arc<Mutex<Vec<SignalingMessage>>>,
        events: mpsc::Sender<TransportEvent>,
        open: Arc<AtomicBool>,
    }

    impl MockConnection {
        pub fn id(&self) -> usize {
            self.id
        }

        pub fn uri(&self) -> &str {
            &self.uri
        }

        pub fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        /// Messages received from the client, in order.
        pub fn sent(&self) -> Vec<SignalingMessage> {
            self.sent.lock().map(|s| s.clone()).unwrap_or_default()
        }

        pub fn sent_types(&self) -> Vec<MessageType> {
            self.sent().iter().map(SignalingMessage::message_type).collect()
        }

        pub fn deliver(&self, msg: SignalingMessage) -> bool {
            match msg.encode() {
                Ok(text) => self.deliver_raw(&text),
                Err(_) => false,
            }
        }

        pub fn deliver_raw(&self, text: &str) -> bool {
            self.is_open()
                && self
                    .events
                    .try_send(TransportEvent::Message(text.to_string()))
                    .is_ok()
        }

        pub fn heartbeat(&self) -> bool {
            self.deliver_raw("\n")
        }

        /// Closes the connection from the server side.
        pub fn close(&self, code: u16) {
            if self.open.swap(false, Ordering::SeqCst) {
                let _ = self.events.try_send(TransportEvent::Closed {
                    code,
                    reason: String::new(),
                });
            }
        }
    }

    struct MockTransport {
        connection: MockConnection,
        responder: Option<Responder>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, text: &str) -> Result<(), anyhow::Error> {
            if !self.connection.is_open() {
                return Err(anyhow::anyhow!("Socket is closed"));
            }
            let msg = SignalingMessage::decode(text)?;
            if let Ok(mut sent) = self.connection.sent.lock() {
                sent.push(msg.clone());
            }
            if let Some(responder) = &self.responder {
                responder(&self.connection, &msg);
            }
            Ok(())
        }

        async fn disconnect(&self) {
            self.connection.open.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FactoryState {
        attempts: Vec<String>,
        failures: HashMap<String, usize>,
        hanging: HashSet<String>,
        connections: Vec<MockConnection>,
    }

    #[derive(Clone, Default)]
    pub struct MockTransportFactory {
        state: Arc<Mutex<FactoryState>>,
        responder: Option<Responder>,
    }

    impl MockTransportFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_responder<F>(mut self, responder: F) -> Self
        where
            F: Fn(&MockConnection, &SignalingMessage) + Send + Sync + 'static,
        {
            self.responder = Some(Arc::new(responder));
            self
        }

        fn with_state<R>(&self, f: impl FnOnce(&mut FactoryState) -> R) -> R {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut state)
        }

        /// The next `times` attempts on `uri` fail.
        pub fn fail(&self, uri: &str, times: usize) {
            self.with_state(|s| s.failures.insert(uri.to_string(), times));
        }

        pub fn fail_always(&self, uri: &str) {
            self.fail(uri, usize::MAX);
        }

        /// Attempts on `uri` never complete.
        pub fn hang(&self, uri: &str) {
            self.with_state(|s| s.hanging.insert(uri.to_string()));
        }

        pub fn heal(&self, uri: &str) {
            self.with_state(|s| {
                s.failures.remove(uri);
                s.hanging.remove(uri);
            });
        }

        /// Every URI a connection was attempted to, in order.
        pub fn attempts(&self) -> Vec<String> {
            self.with_state(|s| s.attempts.clone())
        }

        pub fn connections(&self) -> Vec<MockConnection> {
            self.with_state(|s| s.connections.clone())
        }

        pub fn last_connection(&self) -> Option<MockConnection> {
            self.with_state(|s| s.connections.last().cloned())
        }
    }

    enum Outcome {
        Accept,
        Fail,
        Hang,
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
            uri: &str,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            let outcome = self.with_state(|s| {
                s.attempts.push(uri.to_string());
                if s.hanging.contains(uri) {
                    return Outcome::Hang;
                }
                match s.failures.get_mut(uri) {
                    Some(remaining) if *remaining > 0 => {
                        if *remaining != usize::MAX {
                            *remaining -= 1;
                        }
                        Outcome::Fail
                    }
                    _ => Outcome::Accept,
                }
            });

            match outcome {
                Outcome::Hang => std::future::pending().await,
                Outcome::Fail => Err(anyhow::anyhow!("connection to {uri} refused")),
                Outcome::Accept => {
                    let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
                    let connection = self.with_state(|s| {
                        let connection = MockConnection {
                            id: s.connections.len(),
                            uri: uri.to_string(),
                            sent: Arc::new(Mutex::new(Vec::new())),
                            events,
                            open: Arc::new(AtomicBool::new(true)),
                        };
                        s.connections.push(connection.clone());
                        connection
                    });
                    let transport = MockTransport {
                        connection,
                        responder: self.responder.clone(),
                    };
                    Ok((Arc::new(transport), rx))
                }
            }
        }
    }

    /// Answers `register` with `ready` or `offline`, like the registrar.
    pub fn registrar(connection: &MockConnection, msg: &SignalingMessage) {
        if let SignalingMessage::Register(register) = msg {
            let reply = if register.media.audio {
                SignalingMessage::Ready(Default::default())
            } else {
                SignalingMessage::Offline(Default::default())
            };
            connection.deliver(reply);
        }
    }
}
