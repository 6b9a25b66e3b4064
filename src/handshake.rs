use crate::protocol::{EnginePacket, ProtocolError, SocketPacket, connect_error_reason};
use crate::session::Credential;
use crate::transport::{Transport, TransportEvent};
use log::{debug, trace};
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("connection closed during handshake")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("unexpected packet during handshake: {0}")]
    Unexpected(String),
    #[error("server rejected the credential: {0}")]
    Rejected(String),
    #[error("handshake timed out")]
    Timeout,
}

/// Parameters negotiated while opening the realtime session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Socket.IO session id of the default namespace.
    pub sid: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

/// Waits for the Engine.IO open packet, presents `credential` in the
/// namespace CONNECT packet and waits for the server's verdict.
pub async fn do_handshake(
    transport: &dyn Transport,
    events: &mut mpsc::Receiver<TransportEvent>,
    credential: &Credential,
) -> Result<Handshake, HandshakeError> {
    let open = loop {
        let frame = next_frame(events).await?;
        match EnginePacket::parse(&frame)? {
            EnginePacket::Open(open) => break open,
            EnginePacket::Noop => continue,
            other => return Err(HandshakeError::Unexpected(format!("{other:?}"))),
        }
    };
    debug!(
        target: "Connection/Handshake",
        "Engine session {} opened (ping every {} ms)",
        open.sid, open.ping_interval
    );

    let auth = json!({ "token": credential.expose() });
    transport.send(&SocketPacket::connect(auth).to_frame()).await?;

    loop {
        let frame = next_frame(events).await?;
        match EnginePacket::parse(&frame)? {
            EnginePacket::Ping => transport.send(&EnginePacket::Pong.encode()).await?,
            EnginePacket::Message(inner) => match SocketPacket::parse(&inner)? {
                SocketPacket::Connect { payload, .. } => {
                    let sid = payload
                        .as_ref()
                        .and_then(|p| p.get("sid"))
                        .and_then(Value::as_str)
                        .unwrap_or(open.sid.as_str())
                        .to_string();
                    return Ok(Handshake {
                        sid,
                        ping_interval: open.ping_interval(),
                        ping_timeout: open.ping_timeout(),
                    });
                }
                SocketPacket::ConnectError { payload, .. } => {
                    return Err(HandshakeError::Rejected(connect_error_reason(&payload)));
                }
                other => trace!(target: "Connection/Handshake", "Ignoring {other:?} before namespace connect"),
            },
            EnginePacket::Close => return Err(HandshakeError::Closed),
            EnginePacket::Noop | EnginePacket::Pong => {}
            other => return Err(HandshakeError::Unexpected(format!("{other:?}"))),
        }
    }
}

async fn next_frame(events: &mut mpsc::Receiver<TransportEvent>) -> Result<String, HandshakeError> {
    loop {
        match events.recv().await {
            Some(TransportEvent::Message(frame)) => return Ok(frame),
            Some(TransportEvent::Connected) => continue,
            Some(TransportEvent::Disconnected) | None => return Err(HandshakeError::Closed),
        }
    }
}
