//! Text packet codec for the realtime channel: Engine.IO v4 framing carrying
//! Socket.IO v5 packets.
//!
//! Engine.IO packets are a single type digit followed by an optional payload.
//! A Socket.IO packet travels inside an Engine.IO `message` (`4`) and has the
//! shape `<type>[/<namespace>,][<ack id>][<json>]`, e.g.
//! `42["notification",{...}]`. Binary attachments are not supported.

use serde::Deserialize;
use serde_json::Value;
use std::fmt::Write;
use std::time::Duration;
use thiserror::Error;

pub const ENGINE_IO_VERSION: u8 = 4;
pub const DEFAULT_NAMESPACE: &str = "/";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty packet")]
    Empty,
    #[error("unknown engine packet type {0:?}")]
    UnknownEngineType(char),
    #[error("unknown socket packet type {0:?}")]
    UnknownSocketType(char),
    #[error("binary socket packets are not supported")]
    BinaryUnsupported,
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Payload of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl OpenHandshake {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping,
    Pong,
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn parse(frame: &str) -> Result<Self> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let payload = chars.as_str();
        Ok(match kind {
            '0' => EnginePacket::Open(serde_json::from_str(payload)?),
            '1' => EnginePacket::Close,
            '2' => EnginePacket::Ping,
            '3' => EnginePacket::Pong,
            '4' => EnginePacket::Message(payload.to_string()),
            '5' => EnginePacket::Upgrade,
            '6' => EnginePacket::Noop,
            other => return Err(ProtocolError::UnknownEngineType(other)),
        })
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(_) => "0".to_string(),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping => "2".to_string(),
            EnginePacket::Pong => "3".to_string(),
            EnginePacket::Message(payload) => format!("4{payload}"),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        payload: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        name: String,
        args: Vec<Value>,
        ack_id: Option<u64>,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        payload: Value,
    },
}

impl SocketPacket {
    /// The namespace CONNECT packet carrying the auth object.
    pub fn connect(auth: Value) -> Self {
        SocketPacket::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            payload: Some(auth),
        }
    }

    pub fn parse(packet: &str) -> Result<Self> {
        let mut chars = packet.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let mut rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(ProtocolError::BinaryUnsupported);
        }

        let namespace = if rest.starts_with('/') {
            let end = rest.find(',').unwrap_or(rest.len());
            let namespace = &rest[..end];
            rest = rest.get(end + 1..).unwrap_or("");
            namespace.to_string()
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|_| ProtocolError::Malformed("ack id out of range"))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let payload: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        match kind {
            '0' => Ok(SocketPacket::Connect { namespace, payload }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => {
                let mut items = match payload {
                    Some(Value::Array(items)) => items.into_iter(),
                    _ => return Err(ProtocolError::Malformed("event payload must be an array")),
                };
                let name = match items.next() {
                    Some(Value::String(name)) => name,
                    _ => return Err(ProtocolError::Malformed("event name must be a string")),
                };
                Ok(SocketPacket::Event {
                    namespace,
                    name,
                    args: items.collect(),
                    ack_id,
                })
            }
            '3' => {
                let ack_id = ack_id.ok_or(ProtocolError::Malformed("ack without id"))?;
                let args = match payload {
                    Some(Value::Array(items)) => items,
                    None => Vec::new(),
                    _ => return Err(ProtocolError::Malformed("ack payload must be an array")),
                };
                Ok(SocketPacket::Ack {
                    namespace,
                    ack_id,
                    args,
                })
            }
            '4' => Ok(SocketPacket::ConnectError {
                namespace,
                payload: payload.unwrap_or(Value::Null),
            }),
            other => Err(ProtocolError::UnknownSocketType(other)),
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        let (kind, namespace) = match self {
            SocketPacket::Connect { namespace, .. } => ('0', namespace),
            SocketPacket::Disconnect { namespace } => ('1', namespace),
            SocketPacket::Event { namespace, .. } => ('2', namespace),
            SocketPacket::Ack { namespace, .. } => ('3', namespace),
            SocketPacket::ConnectError { namespace, .. } => ('4', namespace),
        };
        out.push(kind);
        if namespace != DEFAULT_NAMESPACE {
            out.push_str(namespace);
            out.push(',');
        }
        match self {
            SocketPacket::Connect { payload, .. } => {
                if let Some(payload) = payload {
                    out.push_str(&payload.to_string());
                }
            }
            SocketPacket::Disconnect { .. } => {}
            SocketPacket::Event {
                name, args, ack_id, ..
            } => {
                if let Some(id) = ack_id {
                    let _ = write!(out, "{id}");
                }
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                out.push_str(&Value::Array(items).to_string());
            }
            SocketPacket::Ack { ack_id, args, .. } => {
                let _ = write!(out, "{ack_id}");
                out.push_str(&Value::Array(args.clone()).to_string());
            }
            SocketPacket::ConnectError { payload, .. } => out.push_str(&payload.to_string()),
        }
        out
    }

    /// Wraps the packet in an Engine.IO message frame.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

/// Human readable reason from a CONNECT_ERROR payload. Servers send either
/// `{"message": "..."}` or a bare string.
pub fn connect_error_reason(payload: &Value) -> String {
    match payload {
        Value::String(message) => message.clone(),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => payload.to_string(),
        },
        Value::Null => "connection refused".to_string(),
        other => other.to_string(),
    }
}
