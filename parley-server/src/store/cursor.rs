use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use shared::models::Conversation;
use uuid::Uuid;

use super::StoreError;

/// Keyset position in a `(updated_at DESC, id DESC)` listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub updated_at: DateTime<Utc>,
    pub id: Uuid,
}

impl PageCursor {
    #[must_use]
    pub fn after(conversation: &Conversation) -> Self {
        Self {
            updated_at: conversation.updated_at,
            id: conversation.id,
        }
    }

    /// Opaque URL-safe token.
    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.updated_at.timestamp_micros(), self.id))
    }

    /// # Errors
    /// Returns [`StoreError::Validation`] for anything [`Self::encode`] did not produce.
    pub fn decode(token: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::Validation("malformed cursor".to_string());

        let bytes = URL_SAFE_NO_PAD.decode(token.trim()).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (micros, id) = text.split_once(':').ok_or_else(invalid)?;
        let micros = micros.parse::<i64>().map_err(|_| invalid())?;

        Ok(Self {
            updated_at: DateTime::from_timestamp_micros(micros).ok_or_else(invalid)?,
            id: Uuid::parse_str(id).map_err(|_| invalid())?,
        })
    }

    /// Whether `conversation` sorts strictly after this position.
    #[must_use]
    pub fn precedes(&self, conversation: &Conversation) -> bool {
        (conversation.updated_at, conversation.id) < (self.updated_at, self.id)
    }
}

/// Current time at the precision the relational store keeps.
#[must_use]
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}
