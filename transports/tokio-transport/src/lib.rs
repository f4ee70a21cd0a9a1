/// Tokio-based WebSocket transport implementation for twilio-voice
///
/// This crate provides a concrete implementation of the Transport trait
/// using tokio-tungstenite.
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use voicecore::net::{Transport, TransportEvent, TransportFactory, close_code};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// Frames larger than this are refused before they reach the socket.
const FRAME_MAX_SIZE: usize = 1 << 20;
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Tokio-based WebSocket transport
pub struct TokioWebSocketTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
        }
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send(&self, text: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        if text.len() >= FRAME_MAX_SIZE {
            return Err(anyhow::anyhow!(
                "Frame is too large (max: {}, got: {})",
                FRAME_MAX_SIZE,
                text.len()
            ));
        }

        debug!("--> Sending text frame: {} bytes", text.len());
        sink.send(Message::text(text.to_owned()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(mut sink) = self.ws_sink.lock().await.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: String::new().into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            trace!("Close frame not delivered: {e}");
        }
        let _ = sink.close().await;
    }
}

/// Factory for creating Tokio WebSocket transports
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
    /// Create a new factory instance
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioWebSocketTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        uri: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!("Dialing {uri}");
        let (client, _response) = connect_async(uri)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        tokio::task::spawn(read_pump(stream, event_tx));

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    let closed = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!("<-- Received text frame: {} bytes", text.len());
                if event_tx
                    .send(TransportEvent::Message(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    warn!("Event receiver dropped, closing read pump");
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                trace!("Received close frame: {frame:?}");
                break close_event(frame);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break TransportEvent::Closed {
                    code: close_code::ABNORMAL,
                    reason: e.to_string(),
                };
            }
            None => {
                trace!("Websocket stream ended");
                break TransportEvent::Closed {
                    code: close_code::ABNORMAL,
                    reason: "stream ended".to_string(),
                };
            }
        }
    };

    let _ = event_tx.send(closed).await;
}

fn close_event(frame: Option<CloseFrame>) -> TransportEvent {
    match frame {
        Some(frame) => TransportEvent::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_owned(),
        },
        None => TransportEvent::Closed {
            code: close_code::NO_STATUS,
            reason: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frame_code_is_reported() {
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: "bye".to_string().into(),
        };
        assert_eq!(
            close_event(Some(frame)),
            TransportEvent::Closed {
                code: 1001,
                reason: "bye".to_string()
            }
        );
    }

    #[test]
    fn missing_close_frame_reports_no_status() {
        assert_eq!(
            close_event(None),
            TransportEvent::Closed {
                code: close_code::NO_STATUS,
                reason: String::new()
            }
        );
    }
}
