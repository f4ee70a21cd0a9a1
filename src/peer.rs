//! The peer connection capability.
//!
//! Media transport, ICE and DTLS live behind [`PeerConnection`]; calls only
//! see offers and answers, connection-state changes and statistics.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use voicecore::recovery::IceConnectionState;
use voicecore::stats::RtcStats;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("failed to create or apply local description: {0}")]
    LocalDescription(String),
    #[error("failed to apply remote description: {0}")]
    RemoteDescription(String),
    #[error("statistics unavailable: {0}")]
    Stats(String),
    #[error("failed to send digits: {0}")]
    Dtmf(String),
    #[error("peer connection is closed")]
    Closed,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates and applies a local offer.
    async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError>;

    /// Applies a remote offer, then creates and applies the local answer.
    async fn create_answer(&self, remote_offer: &str) -> Result<String, PeerError>;

    async fn apply_answer(&self, remote_answer: &str) -> Result<(), PeerError>;

    /// Cumulative statistics since the connection was created.
    async fn stats(&self) -> Result<RtcStats, PeerError>;

    fn connection_state(&self) -> watch::Receiver<IceConnectionState>;

    async fn set_muted(&self, muted: bool);

    async fn send_digits(&self, digits: &str) -> Result<(), PeerError>;

    async fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(&self) -> Arc<dyn PeerConnection>;
}

/// A peer connection without media. Signaling works, audio never flows.
pub struct NullPeerConnection {
    state: watch::Sender<IceConnectionState>,
}

impl NullPeerConnection {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(IceConnectionState::New),
        }
    }

    fn description(kind: &str) -> String {
        format!("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns={kind}\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 0\r\n")
    }
}

impl Default for NullPeerConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnection for NullPeerConnection {
    async fn create_offer(&self, _ice_restart: bool) -> Result<String, PeerError> {
        Ok(Self::description("offer"))
    }

    async fn create_answer(&self, _remote_offer: &str) -> Result<String, PeerError> {
        Ok(Self::description("answer"))
    }

    async fn apply_answer(&self, _remote_answer: &str) -> Result<(), PeerError> {
        Ok(())
    }

    async fn stats(&self) -> Result<RtcStats, PeerError> {
        Ok(RtcStats::default())
    }

    fn connection_state(&self) -> watch::Receiver<IceConnectionState> {
        self.state.subscribe()
    }

    async fn set_muted(&self, _muted: bool) {}

    async fn send_digits(&self, _digits: &str) -> Result<(), PeerError> {
        Ok(())
    }

    async fn close(&self) {
        self.state.send_replace(IceConnectionState::Closed);
    }
}

#[derive(Debug, Default)]
pub struct NullPeerConnectionFactory;

impl PeerConnectionFactory for NullPeerConnectionFactory {
    fn create(&self) -> Arc<dyn PeerConnection> {
        Arc::new(NullPeerConnection::new())
    }
}

/// Scripted peer connections for tests.
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Script {
        stats: RtcStats,
        offers: Vec<bool>,
        remote_offers: Vec<String>,
        applied_answers: Vec<String>,
        digits: String,
        muted: bool,
        closed: bool,
        manual: bool,
        fail_local: bool,
        fail_remote: bool,
    }

    /// Connects as soon as a remote description is applied, unless
    /// switched to manual mode.
    pub struct MockPeerConnection {
        state: watch::Sender<IceConnectionState>,
        script: Mutex<Script>,
    }

    impl MockPeerConnection {
        pub fn new() -> Self {
            Self {
                state: watch::Sender::new(IceConnectionState::New),
                script: Mutex::new(Script::default()),
            }
        }

        fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut script)
        }

        pub fn set_state(&self, state: IceConnectionState) {
            self.state.send_replace(state);
        }

        pub fn state(&self) -> IceConnectionState {
            *self.state.borrow()
        }

        /// Stop connecting automatically when descriptions are applied.
        pub fn set_manual(&self, manual: bool) {
            self.with_script(|s| s.manual = manual);
        }

        pub fn fail_local_description(&self, fail: bool) {
            self.with_script(|s| s.fail_local = fail);
        }

        pub fn fail_remote_description(&self, fail: bool) {
            self.with_script(|s| s.fail_remote = fail);
        }

        pub fn update_stats(&self, f: impl FnOnce(&mut RtcStats)) {
            self.with_script(|s| f(&mut s.stats));
        }

        /// The `ice_restart` flag of every offer created so far.
        pub fn offers(&self) -> Vec<bool> {
            self.with_script(|s| s.offers.clone())
        }

        pub fn remote_offers(&self) -> Vec<String> {
            self.with_script(|s| s.remote_offers.clone())
        }

        pub fn applied_answers(&self) -> Vec<String> {
            self.with_script(|s| s.applied_answers.clone())
        }

        pub fn digits(&self) -> String {
            self.with_script(|s| s.digits.clone())
        }

        pub fn is_muted(&self) -> bool {
            self.with_script(|s| s.muted)
        }

        pub fn is_closed(&self) -> bool {
            self.with_script(|s| s.closed)
        }

        fn connect_unless_manual(&self) {
            if !self.with_script(|s| s.manual) {
                self.set_state(IceConnectionState::Connected);
            }
        }
    }

    impl Default for MockPeerConnection {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl PeerConnection for MockPeerConnection {
        async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError> {
            self.with_script(|s| {
                if s.fail_local {
                    return Err(PeerError::LocalDescription("scripted failure".to_string()));
                }
                s.offers.push(ice_restart);
                let restart = if ice_restart { " ice-restart" } else { "" };
                Ok(format!("v=0 mock-offer-{}{restart}", s.offers.len()))
            })
        }

        async fn create_answer(&self, remote_offer: &str) -> Result<String, PeerError> {
            self.with_script(|s| {
                if s.fail_remote {
                    return Err(PeerError::RemoteDescription("scripted failure".to_string()));
                }
                if s.fail_local {
                    return Err(PeerError::LocalDescription("scripted failure".to_string()));
                }
                s.remote_offers.push(remote_offer.to_string());
                Ok(())
            })?;
            self.connect_unless_manual();
            Ok("v=0 mock-answer".to_string())
        }

        async fn apply_answer(&self, remote_answer: &str) -> Result<(), PeerError> {
            self.with_script(|s| {
                if s.fail_remote {
                    return Err(PeerError::RemoteDescription("scripted failure".to_string()));
                }
                s.applied_answers.push(remote_answer.to_string());
                Ok(())
            })?;
            self.connect_unless_manual();
            Ok(())
        }

        async fn stats(&self) -> Result<RtcStats, PeerError> {
            self.with_script(|s| {
                if s.closed {
                    Err(PeerError::Closed)
                } else {
                    Ok(s.stats.clone())
                }
            })
        }

        fn connection_state(&self) -> watch::Receiver<IceConnectionState> {
            self.state.subscribe()
        }

        async fn set_muted(&self, muted: bool) {
            self.with_script(|s| s.muted = muted);
        }

        async fn send_digits(&self, digits: &str) -> Result<(), PeerError> {
            self.with_script(|s| s.digits.push_str(digits));
            Ok(())
        }

        async fn close(&self) {
            self.with_script(|s| s.closed = true);
            self.set_state(IceConnectionState::Closed);
        }
    }

    /// Hands out [`MockPeerConnection`]s and keeps them for inspection.
    #[derive(Default)]
    pub struct MockPeerConnectionFactory {
        created: Mutex<Vec<Arc<MockPeerConnection>>>,
    }

    impl MockPeerConnectionFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn created(&self) -> Vec<Arc<MockPeerConnection>> {
            self.created
                .lock()
                .map(|c| c.clone())
                .unwrap_or_default()
        }

        pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
            self.created().pop()
        }
    }

    impl PeerConnectionFactory for MockPeerConnectionFactory {
        fn create(&self) -> Arc<dyn PeerConnection> {
            let peer = Arc::new(MockPeerConnection::new());
            if let Ok(mut created) = self.created.lock() {
                created.push(peer.clone());
            }
            peer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockPeerConnection;
    use super::*;

    #[tokio::test]
    async fn mock_connects_when_answer_applied() {
        let peer = MockPeerConnection::new();
        let mut state = peer.connection_state();
        peer.create_offer(false).await.unwrap();
        peer.apply_answer("v=0").await.unwrap();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), IceConnectionState::Connected);
    }

    #[tokio::test]
    async fn mock_manual_mode_stays_put() {
        let peer = MockPeerConnection::new();
        peer.set_manual(true);
        peer.create_answer("v=0 offer").await.unwrap();
        assert_eq!(peer.state(), IceConnectionState::New);
        assert_eq!(peer.remote_offers(), vec!["v=0 offer".to_string()]);
    }

    #[tokio::test]
    async fn mock_scripted_failures() {
        let peer = MockPeerConnection::new();
        peer.fail_remote_description(true);
        assert!(matches!(
            peer.apply_answer("v=0").await,
            Err(PeerError::RemoteDescription(_))
        ));
        peer.fail_local_description(true);
        assert!(matches!(
            peer.create_offer(true).await,
            Err(PeerError::LocalDescription(_))
        ));
    }
}
