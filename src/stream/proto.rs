use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::client::StreamClientError;

/// Named event channels that inbound frames are routed to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Channel {
    /// Server confirmation that the socket joined the session.
    Connected,
    /// A debater produced a speech.
    Speech,
    /// Debate status changed.
    Status,
    /// Scores were published.
    Score,
    /// Generic server notification.
    Notification,
    /// Server-reported error.
    Error,
    /// JSON heartbeat acknowledgement.
    Pong,
    /// Every inbound frame, recognized or not.
    Any,
}

impl Channel {
    /// Maps a `type` discriminator to its channel.
    ///
    /// Returns `None` for unrecognized discriminators. [`Channel::Any`] is
    /// never returned.
    pub fn for_message_type(message_type: &str) -> Option<Self> {
        match message_type {
            "connected" => Some(Self::Connected),
            "speech" => Some(Self::Speech),
            "status" => Some(Self::Status),
            "score" => Some(Self::Score),
            "notification" => Some(Self::Notification),
            "error" => Some(Self::Error),
            "pong" => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Speech => "speech",
            Self::Status => "status",
            Self::Score => "score",
            Self::Notification => "notification",
            Self::Error => "error",
            Self::Pong => "pong",
            Self::Any => "*",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound frame with its `type` discriminator split out.
///
/// The payload is kept whole, discriminator included, and is otherwise
/// opaque to the connection.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    message_type: String,
    payload: Value,
}

impl InboundMessage {
    pub fn from_text(text: &str) -> Result<Self, StreamClientError> {
        let payload: Value = serde_json::from_str(text)?;
        let message_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StreamClientError::Protocol("frame has no string `type` field".to_string())
            })?
            .to_string();
        Ok(Self {
            message_type,
            payload,
        })
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn channel(&self) -> Option<Channel> {
        Channel::for_message_type(&self.message_type)
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Decodes the payload into a caller-defined shape.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }
}

/// Messages originated by the client itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}

impl ClientMessage {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The peer answers heartbeats with a bare `pong` text frame.
pub(crate) fn is_heartbeat_ack(text: &str) -> bool {
    text.trim() == "pong"
}
