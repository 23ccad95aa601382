use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Metadata;

/// A conversation owned by exactly one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    /// Unique identifier for the conversation.
    pub id: Uuid,

    /// The user who owns the conversation; the only user allowed to see it.
    pub owner_id: Uuid,

    /// Optional human-readable title.
    #[serde(default)]
    pub title: Option<String>,

    /// Model or engine tag used when generating replies.
    pub model: String,

    /// Optional system instruction prepended to prompts.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,

    /// Cumulative tokens consumed by messages in this conversation.
    pub tokens_used: i64,

    pub created_at: DateTime<Utc>,

    /// Bumped on every persisted message; drives list ordering.
    pub updated_at: DateTime<Utc>,

    /// Soft-delete marker.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Conversation {
    #[must_use]
    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.owner_id == user_id && self.deleted_at.is_none()
    }
}

/// Request structure for creating a new conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Query parameters for listing conversations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListConversationsQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    /// Opaque cursor from a previous page.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Query parameters for conversation search.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchConversationsQuery {
    pub q: String,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// One page of conversations plus the cursor for the next page, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationPage {
    pub items: Vec<Conversation>,
    pub next_cursor: Option<String>,
}
