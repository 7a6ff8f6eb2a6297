//! The messages exchanged between the server and the clients.
//!
//! Every message is a JSON envelope:
//!
//! ```text
//! {
//!     "headers": {
//!         "timestamp": "2024-05-01T10:00:00Z",
//!         "message_type": "CLIENT_NOTIFY_MODEL_UPDATE",
//!         "session_id": "...",
//!         "client_id": "..."
//!     },
//!     "content": { ... }
//! }
//! ```
//!
//! The shape of `content` is determined by `message_type`. Decoding happens in two steps: the
//! headers are read first, then the content is parsed into the [`Payload`] variant selected by the
//! message type.

mod payload;

use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use displaydoc::Display as DisplayDoc;
use serde_json::Value;
use thiserror::Error;

pub use self::payload::{
    ClientInit,
    ClientNotifyEvaluation,
    ClientNotifyModelUpdate,
    DataDescription,
    ExchangeThresholds,
    ModelInfo,
    Ping,
    Role,
    ServerInitResponse,
    ServerNotifyModelUpdate,
    ServerStop,
    StorageInfo,
    SystemInfo,
};

/// The types of messages.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[display(fmt = "CLIENT_INIT")]
    ClientInit,
    #[display(fmt = "SERVER_INIT_RESPONSE")]
    ServerInitResponse,
    #[display(fmt = "CLIENT_NOTIFY_MODEL_UPDATE")]
    ClientNotifyModelUpdate,
    #[display(fmt = "SERVER_NOTIFY_MODEL_UPDATE")]
    ServerNotifyModelUpdate,
    #[display(fmt = "CLIENT_NOTIFY_EVALUATION")]
    ClientNotifyEvaluation,
    #[display(fmt = "CLIENT_PING")]
    ClientPing,
    #[display(fmt = "SERVER_PING")]
    ServerPing,
    #[display(fmt = "SERVER_STOP")]
    ServerStop,
}

/// The headers of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
    /// The session of the sender. Empty before the handshake.
    #[serde(default)]
    pub session_id: String,
    /// The sending client, or `server`.
    pub client_id: String,
}

/// The typed content of a message.
#[derive(Debug, Clone, PartialEq, From)]
pub enum Payload {
    ClientInit(ClientInit),
    ServerInitResponse(ServerInitResponse),
    ClientNotifyModelUpdate(ClientNotifyModelUpdate),
    ServerNotifyModelUpdate(ServerNotifyModelUpdate),
    ClientNotifyEvaluation(ClientNotifyEvaluation),
    #[from(ignore)]
    ClientPing(Ping),
    #[from(ignore)]
    ServerPing(Ping),
    ServerStop(ServerStop),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ClientInit(_) => MessageType::ClientInit,
            Self::ServerInitResponse(_) => MessageType::ServerInitResponse,
            Self::ClientNotifyModelUpdate(_) => MessageType::ClientNotifyModelUpdate,
            Self::ServerNotifyModelUpdate(_) => MessageType::ServerNotifyModelUpdate,
            Self::ClientNotifyEvaluation(_) => MessageType::ClientNotifyEvaluation,
            Self::ClientPing(_) => MessageType::ClientPing,
            Self::ServerPing(_) => MessageType::ServerPing,
            Self::ServerStop(_) => MessageType::ServerStop,
        }
    }

    fn to_content(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::ClientInit(content) => serde_json::to_value(content),
            Self::ServerInitResponse(content) => serde_json::to_value(content),
            Self::ClientNotifyModelUpdate(content) => serde_json::to_value(content),
            Self::ServerNotifyModelUpdate(content) => serde_json::to_value(content),
            Self::ClientNotifyEvaluation(content) => serde_json::to_value(content),
            Self::ClientPing(content) | Self::ServerPing(content) => serde_json::to_value(content),
            Self::ServerStop(content) => serde_json::to_value(content),
        }
    }

    fn from_content(message_type: MessageType, content: Value) -> Result<Self, serde_json::Error> {
        Ok(match message_type {
            MessageType::ClientInit => Self::ClientInit(serde_json::from_value(content)?),
            MessageType::ServerInitResponse => {
                Self::ServerInitResponse(serde_json::from_value(content)?)
            }
            MessageType::ClientNotifyModelUpdate => {
                Self::ClientNotifyModelUpdate(serde_json::from_value(content)?)
            }
            MessageType::ServerNotifyModelUpdate => {
                Self::ServerNotifyModelUpdate(serde_json::from_value(content)?)
            }
            MessageType::ClientNotifyEvaluation => {
                Self::ClientNotifyEvaluation(serde_json::from_value(content)?)
            }
            MessageType::ClientPing => Self::ClientPing(serde_json::from_value(content)?),
            MessageType::ServerPing => Self::ServerPing(serde_json::from_value(content)?),
            MessageType::ServerStop => Self::ServerStop(serde_json::from_value(content)?),
        })
    }
}

/// Errors of the encoding and decoding of messages.
#[derive(Debug, DisplayDoc, Error)]
pub enum ProtocolError {
    /// Invalid envelope: {0}.
    Envelope(serde_json::Error),
    /// Invalid content of a {0} message: {1}.
    Content(MessageType, serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    headers: Headers,
    content: Value,
}

/// A message with its headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub headers: Headers,
    pub payload: Payload,
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(session_id: impl Into<String>, client_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            headers: Headers {
                timestamp: Utc::now(),
                message_type: payload.message_type(),
                session_id: session_id.into(),
                client_id: client_id.into(),
            },
            payload,
        }
    }

    /// Serializes the message into its JSON envelope.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let message_type = self.payload.message_type();
        let content = self
            .payload
            .to_content()
            .map_err(|err| ProtocolError::Content(message_type, err))?;
        let envelope = Envelope {
            headers: Headers {
                message_type,
                ..self.headers.clone()
            },
            content,
        };
        serde_json::to_string(&envelope).map_err(ProtocolError::Envelope)
    }

    /// Parses a JSON envelope.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let Envelope { headers, content } =
            serde_json::from_str(raw).map_err(ProtocolError::Envelope)?;
        let payload = Payload::from_content(headers.message_type, content)
            .map_err(|err| ProtocolError::Content(headers.message_type, err))?;
        Ok(Self { headers, payload })
    }
}
