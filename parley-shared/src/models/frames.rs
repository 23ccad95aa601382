//! JSON frames exchanged over a live connection, plus the envelope used to
//! carry outbound frames across hub instances.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::Message;

/// Why an inbound frame could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),
    #[error("frame has no string 'type' field")]
    MissingType,
    #[error("invalid '{kind}' frame: {reason}")]
    InvalidFields { kind: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChatFrame {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    pub content: String,
    /// Store/context filter forwarded to the responder untouched.
    #[serde(default)]
    pub filter: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SearchFrame {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub filter: Option<Value>,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Chat(ChatFrame),
    Search(SearchFrame),
    /// Presence only; the original text is rebroadcast as-is.
    Typing,
    /// Any other `type`; logged and ignored.
    Unknown(String),
}

impl InboundFrame {
    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns [`FrameError`] when the text is not a JSON object with a string
    /// `type`, or when a recognized type is missing required fields.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?
            .to_string();

        match kind.as_str() {
            "chat" => serde_json::from_value(value)
                .map(Self::Chat)
                .map_err(|err| FrameError::InvalidFields {
                    kind: "chat",
                    reason: err.to_string(),
                }),
            "search" => serde_json::from_value(value)
                .map(Self::Search)
                .map_err(|err| FrameError::InvalidFields {
                    kind: "search",
                    reason: err.to_string(),
                }),
            "typing" => Ok(Self::Typing),
            _ => Ok(Self::Unknown(kind)),
        }
    }

    /// Client-supplied frame id, when present.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Chat(frame) => frame.id.as_deref(),
            Self::Search(frame) => frame.id.as_deref(),
            Self::Typing | Self::Unknown(_) => None,
        }
    }
}

/// What a server-initiated `typing` frame announces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Typing,
    Searching,
}

/// Machine-readable error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CapacityExceeded,
    InvalidFrame,
    FrameTooLarge,
    ValidationFailed,
    NotFound,
    Unavailable,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CapacityExceeded => "capacity_exceeded",
            Self::InvalidFrame => "invalid_frame",
            Self::FrameTooLarge => "frame_too_large",
            Self::ValidationFailed => "validation_failed",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }

    /// Whether a client should back off and retry after this error.
    #[must_use]
    pub const fn retryable(self) -> bool {
        matches!(self, Self::CapacityExceeded | Self::Unavailable)
    }
}

/// A server frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    System {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<Uuid>,
    },
    Ack {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
    },
    Typing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
        activity: ActivityKind,
        active: bool,
    },
    Assistant {
        conversation_id: Uuid,
        message_id: Uuid,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        results: Option<Vec<Value>>,
    },
    SearchResults {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        results: Vec<Value>,
        summary: String,
    },
    /// A newly persisted message, fanned out to every connection of its owner.
    Message { message: Message },
    Error {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },
}

impl OutboundFrame {
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            retryable: code.retryable(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::Ack { .. } => "ack",
            Self::Typing { .. } => "typing",
            Self::Assistant { .. } => "assistant",
            Self::SearchResults { .. } => "search_results",
            Self::Message { .. } => "message",
            Self::Error { .. } => "error",
        }
    }
}

/// What a delivery puts on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DeliveryFrame {
    Typed(OutboundFrame),
    /// Client text passed through unchanged, such as a `typing` frame.
    Verbatim(String),
}

impl From<OutboundFrame> for DeliveryFrame {
    fn from(frame: OutboundFrame) -> Self {
        Self::Typed(frame)
    }
}

/// A frame addressed to every connection of one user, as carried over the
/// fan-out fabric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryEnvelope {
    pub user_id: Uuid,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    /// Connection the frame came from; it is not delivered back there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
    pub frame: DeliveryFrame,
}
