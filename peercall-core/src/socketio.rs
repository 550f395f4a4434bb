//! Socket.IO packet codec
//!
//! Text framing for Engine.IO protocol v4 and Socket.IO protocol v5 as used
//! over a plain websocket. Binary attachments are not supported; the call
//! protocol only carries JSON.
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,..}   engine open
//! 2 / 3                                   engine ping / pong
//! 40{"token":".."}                        socket connect (default namespace)
//! 42["webrtc-offer",{..}]                 socket event
//! 42/admin,7["name",{..}]                 event with namespace and ack id
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default namespace
pub const DEFAULT_NAMESPACE: &str = "/";

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame was empty
    #[error("Empty packet")]
    Empty,

    /// Unknown packet type digit
    #[error("Unknown packet type: {0}")]
    UnknownType(char),

    /// JSON body did not parse
    #[error("Malformed packet body: {0}")]
    Malformed(String),

    /// Binary packets are not supported over the text codec
    #[error("Binary packets are not supported")]
    BinaryUnsupported,
}

/// Engine.IO open handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Engine session id
    pub sid: String,
    /// Possible transport upgrades
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Server ping interval in milliseconds
    pub ping_interval: u64,
    /// Time the server waits for a pong in milliseconds
    pub ping_timeout: u64,
    /// Maximum payload size in bytes
    #[serde(default)]
    pub max_payload: Option<u64>,
}

/// Engine.IO packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    /// Session opened
    Open(Handshake),
    /// Session closed
    Close,
    /// Heartbeat request
    Ping(String),
    /// Heartbeat reply
    Pong(String),
    /// Socket.IO payload
    Message(String),
    /// Transport upgrade
    Upgrade,
    /// No-op
    Noop,
}

impl EnginePacket {
    /// Decode a websocket text frame
    ///
    /// # Errors
    ///
    /// Returns error for empty frames, unknown types or a malformed handshake
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(CodecError::Empty)?;
        let body = chars.as_str();

        match kind {
            '0' => serde_json::from_str(body)
                .map(Self::Open)
                .map_err(|e| CodecError::Malformed(e.to_string())),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(body.to_string())),
            '3' => Ok(Self::Pong(body.to_string())),
            '4' => Ok(Self::Message(body.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(CodecError::UnknownType(other)),
        }
    }

    /// Encode as a websocket text frame
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Open(handshake) => {
                format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
            }
            Self::Close => "1".to_string(),
            Self::Ping(body) => format!("2{body}"),
            Self::Pong(body) => format!("3{body}"),
            Self::Message(body) => format!("4{body}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

/// Socket.IO packet carried inside an Engine.IO message
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// Namespace connect request (client) or confirmation (server)
    Connect {
        /// Namespace
        namespace: String,
        /// Auth payload (client) or `{"sid":..}` (server)
        data: Option<Value>,
    },
    /// Namespace disconnect
    Disconnect {
        /// Namespace
        namespace: String,
    },
    /// Named event
    Event {
        /// Namespace
        namespace: String,
        /// Acknowledgement id requested by the sender
        ack_id: Option<u64>,
        /// Event name
        name: String,
        /// First event argument
        data: Option<Value>,
    },
    /// Acknowledgement
    Ack {
        /// Namespace
        namespace: String,
        /// Acknowledged id
        ack_id: u64,
        /// Ack arguments
        data: Value,
    },
    /// Namespace connect refused
    ConnectError {
        /// Namespace
        namespace: String,
        /// Error payload, usually `{"message":..}`
        data: Option<Value>,
    },
}

impl SocketPacket {
    /// Event on the default namespace
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ack_id: None,
            name: name.into(),
            data: Some(data),
        }
    }

    /// Connect to the default namespace with optional auth payload
    pub fn connect(auth: Option<Value>) -> Self {
        Self::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: auth,
        }
    }

    /// Decode the payload of an Engine.IO message
    ///
    /// # Errors
    ///
    /// Returns error for unknown types, binary packets or bad JSON
    pub fn decode(payload: &str) -> Result<Self, CodecError> {
        let mut chars = payload.chars();
        let kind = chars.next().ok_or(CodecError::Empty)?;
        let mut rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(CodecError::BinaryUnsupported);
        }

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(idx) => {
                    let ns = &rest[..idx];
                    rest = &rest[idx + 1..];
                    ns.to_string()
                }
                None => {
                    let ns = rest.to_string();
                    rest = "";
                    ns
                }
            }
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let body = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str::<Value>(rest)
                    .map_err(|e| CodecError::Malformed(e.to_string()))?,
            )
        };

        match kind {
            '0' => Ok(Self::Connect {
                namespace,
                data: body,
            }),
            '1' => Ok(Self::Disconnect { namespace }),
            '2' => {
                let mut args = match body {
                    Some(Value::Array(args)) => args.into_iter(),
                    _ => {
                        return Err(CodecError::Malformed(
                            "event body must be a JSON array".to_string(),
                        ))
                    }
                };
                let name = match args.next() {
                    Some(Value::String(name)) => name,
                    _ => {
                        return Err(CodecError::Malformed(
                            "event name must be a string".to_string(),
                        ))
                    }
                };
                Ok(Self::Event {
                    namespace,
                    ack_id,
                    name,
                    data: args.next(),
                })
            }
            '3' => Ok(Self::Ack {
                namespace,
                ack_id: ack_id.ok_or_else(|| CodecError::Malformed("ack without id".into()))?,
                data: body.unwrap_or(Value::Null),
            }),
            '4' => Ok(Self::ConnectError {
                namespace,
                data: body,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }

    /// Encode as an Engine.IO message payload (without the leading `4`)
    #[must_use]
    pub fn encode(&self) -> String {
        fn prefix(kind: char, namespace: &str) -> String {
            if namespace == DEFAULT_NAMESPACE {
                kind.to_string()
            } else {
                format!("{kind}{namespace},")
            }
        }

        match self {
            Self::Connect { namespace, data } => {
                let mut out = prefix('0', namespace);
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
                out
            }
            Self::Disconnect { namespace } => prefix('1', namespace),
            Self::Event {
                namespace,
                ack_id,
                name,
                data,
            } => {
                let mut out = prefix('2', namespace);
                if let Some(id) = ack_id {
                    out.push_str(&id.to_string());
                }
                let mut args = vec![Value::String(name.clone())];
                if let Some(data) = data {
                    args.push(data.clone());
                }
                out.push_str(&Value::Array(args).to_string());
                out
            }
            Self::Ack {
                namespace,
                ack_id,
                data,
            } => format!("{}{}{}", prefix('3', namespace), ack_id, data),
            Self::ConnectError { namespace, data } => {
                let mut out = prefix('4', namespace);
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
                out
            }
        }
    }

    /// Encode as a complete websocket text frame
    #[must_use]
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}
