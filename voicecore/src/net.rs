use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Websocket close codes the signaling layer reacts to.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure. Also reported for failed or timed out connection attempts.
    pub const ABNORMAL: u16 = 1006;
    pub const TLS_HANDSHAKE: u16 = 1015;

    /// Codes that indicate the endpoint itself may be unreachable.
    pub fn is_fallback_trigger(code: u16) -> bool {
        code == ABNORMAL || code == TLS_HANDSHAKE
    }
}

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame has been received from the server.
    Message(String),
    /// The connection was lost or closed by the remote end.
    Closed { code: u16, reason: String },
}

/// Represents an active websocket connection.
/// The transport is a dumb pipe for text frames with no knowledge of the envelope format.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a text frame to the server.
    async fn send(&self, text: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Connects to `uri` and returns the transport, along with a stream of events.
    async fn create_transport(
        &self,
        uri: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

#[cfg(test)]
mod tests {
    use super::close_code;

    #[test]
    fn only_abnormal_and_tls_trigger_fallback() {
        assert!(close_code::is_fallback_trigger(1006));
        assert!(close_code::is_fallback_trigger(1015));
        assert!(!close_code::is_fallback_trigger(1000));
        assert!(!close_code::is_fallback_trigger(1011));
    }
}
