/// Tokio-based WebSocket transport implementation for parley
///
/// This crate provides a concrete implementation of the Transport trait
/// using tokio-tungstenite. Frames are JSON text messages; framing and
/// protocol semantics live in the `parley` crate.
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

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A text frame has been received from the server.
    TextReceived(String),
    /// The connection was closed, by either side or by a network failure.
    /// `code` is the websocket close code when the peer sent one.
    Closed { code: Option<u16>, reason: String },
}

/// Represents an active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a text frame to the server.
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection with the given close code.
    async fn close(&self, code: u16, reason: &str);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens a new transport to `url` and returns it, along with a stream of events.
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

pub const FRAME_MAX_SIZE: usize = 2 << 23;
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Tokio WebSocket transport
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
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
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

        trace!(target: "Transport", "--> {} bytes", text.len());
        sink.send(Message::text(text.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) {
        let Some(mut sink) = self.ws_sink.lock().await.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(target: "Transport", "Close frame not delivered: {e}");
        }
        let _ = sink.close().await;
    }
}

/// Factory for creating Tokio WebSocket transports
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
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
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!(target: "Transport", "Dialing {url}");
        let (client, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        tokio::task::spawn(read_pump(stream, event_tx.clone()));

        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

fn closed_event(frame: Option<&CloseFrame>) -> TransportEvent {
    match frame {
        Some(frame) => TransportEvent::Closed {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.as_str().to_string(),
        },
        None => TransportEvent::Closed {
            code: None,
            reason: String::new(),
        },
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    let closed = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!(target: "Transport", "<-- {} bytes", text.len());
                if event_tx
                    .send(TransportEvent::TextReceived(text.as_str().to_string()))
                    .await
                    .is_err()
                {
                    warn!(target: "Transport", "Event receiver dropped, closing read pump");
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                trace!(target: "Transport", "Received close frame: {frame:?}");
                break closed_event(frame.as_ref());
            }
            Some(Ok(other)) => {
                trace!(target: "Transport", "Ignoring non-text message ({} bytes)", other.len());
            }
            Some(Err(e)) => {
                error!(target: "Transport", "Error reading from websocket: {e}");
                break TransportEvent::Closed {
                    code: None,
                    reason: e.to_string(),
                };
            }
            None => {
                trace!(target: "Transport", "Websocket stream ended");
                break closed_event(None);
            }
        }
    };

    let _ = event_tx.send(closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_maps_application_code() {
        let frame = CloseFrame {
            code: CloseCode::from(4003),
            reason: "session expired".to_string().into(),
        };
        assert_eq!(
            closed_event(Some(&frame)),
            TransportEvent::Closed {
                code: Some(4003),
                reason: "session expired".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_close_frame_has_no_code() {
        assert_eq!(
            closed_event(None),
            TransportEvent::Closed {
                code: None,
                reason: String::new(),
            }
        );
    }

    #[test]
    fn test_standard_close_code_round_trips() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".to_string().into(),
        };
        match closed_event(Some(&frame)) {
            TransportEvent::Closed { code, .. } => assert_eq!(code, Some(1000)),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
