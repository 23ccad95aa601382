use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

use super::Metadata;

/// Who authored a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Function,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Function => "function",
        }
    }
}

impl TryFrom<&str> for MessageRole {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "function" => Ok(Self::Function),
            _ => Err("invalid message role"),
        }
    }
}

impl Display for MessageRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// A persisted, immutable message.
///
/// Messages are totally ordered within their conversation by `(created_at, id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_arguments: Option<serde_json::Value>,
    pub token_count: i32,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Sort key giving the total order within a conversation.
    #[must_use]
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// A message about to be persisted. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub function_arguments: Option<serde_json::Value>,
    /// Explicit token count; estimated from the content when absent.
    #[serde(default)]
    pub token_count: Option<i32>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewMessage {
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            function_name: None,
            function_arguments: None,
            token_count: None,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Token count to charge the conversation with, roughly four characters per token.
    #[must_use]
    pub fn tokens(&self) -> i32 {
        self.token_count.unwrap_or_else(|| {
            let estimate = self.content.chars().count().div_ceil(4);
            i32::try_from(estimate).unwrap_or(i32::MAX)
        })
    }
}

/// REST body for posting a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default = "default_role")]
    pub role: MessageRole,
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_role() -> MessageRole {
    MessageRole::User
}

/// Query parameters for reading message history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetMessagesQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    /// Number of newest messages to skip.
    #[serde(default)]
    pub offset: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_round_trip_through_text() {
        for role in [
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::System,
            MessageRole::Function,
        ] {
            assert_eq!(MessageRole::try_from(role.as_str()), Ok(role));
        }
        assert!(MessageRole::try_from("tool").is_err());
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_value(MessageRole::Assistant).unwrap();
        assert_eq!(json, serde_json::json!("assistant"));
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(NewMessage::user("").tokens(), 0);
        assert_eq!(NewMessage::user("ping").tokens(), 1);
        assert_eq!(NewMessage::user("hello").tokens(), 2);

        let mut explicit = NewMessage::assistant("hello world");
        explicit.token_count = Some(42);
        assert_eq!(explicit.tokens(), 42);
    }

    #[test]
    fn send_message_request_defaults_to_user_role() {
        let request: SendMessageRequest =
            serde_json::from_str(r#"{"content": "hi"}"#).unwrap();
        assert_eq!(request.role, MessageRole::User);
        assert!(request.metadata.is_empty());
    }
}
