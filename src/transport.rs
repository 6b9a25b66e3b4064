//! WebSocket transport seam.
//!
//! The transport is a dumb text pipe; Engine.IO/Socket.IO framing lives in
//! [`crate::protocol`] and the handshake in [`crate::handshake`].

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A text frame has been received from the server.
    Message(String),
    /// The connection was lost or closed.
    Disconnected,
}

/// Represents an active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one text frame to the server.
    async fn send(&self, frame: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Dials `url` and returns the transport along with its stream of events.
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// `tokio-tungstenite` backed transport.
pub struct TungsteniteTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

impl TungsteniteTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Mutex::new(Some(sink)),
        }
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send(&self, frame: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;
        trace!(target: "Transport", "--> {frame}");
        sink.send(Message::text(frame.to_owned()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {e}"))
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(target: "Transport", "Error while closing websocket: {e}");
            }
        }
    }
}

/// Factory for [`TungsteniteTransport`].
#[derive(Debug, Clone, Default)]
pub struct TungsteniteTransportFactory;

impl TungsteniteTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for TungsteniteTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!(target: "Transport", "Dialing {url}");
        let (client, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {e}"))?;

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let _ = event_tx.send(TransportEvent::Connected).await;
        tokio::spawn(read_pump(stream, event_tx));

        Ok((Arc::new(TungsteniteTransport::new(sink)), event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        let next = tokio::select! {
            _ = event_tx.closed() => {
                trace!(target: "Transport", "Event receiver dropped, closing read pump");
                return;
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                trace!(target: "Transport", "<-- {}", text.as_str());
                if event_tx
                    .send(TransportEvent::Message(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(target: "Transport", "Ignoring {} byte binary frame", data.len());
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(target: "Transport", "Received close frame: {frame:?}");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(target: "Transport", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Transport", "Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
