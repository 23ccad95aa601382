use std::fmt::Debug;

use async_trait::async_trait;
use shared::models::{Conversation, Message, NewMessage};
use uuid::Uuid;

use super::{StoreError, cursor::PageCursor};

/// A message ready to be appended; ids are assigned before the transaction so
/// a retried append is idempotent.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub owner_id: Uuid,
    pub message: NewMessage,
}

/// Authoritative storage for conversations and messages.
///
/// Implementations never consult the cache and never check anything beyond
/// what each method states; ownership rules live in the store.
#[async_trait]
pub trait ConversationRepository: Send + Sync + Debug {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// The conversation unless it is missing or soft-deleted.
    async fn fetch_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    /// Live conversations of `owner` ordered by `(updated_at DESC, id DESC)`,
    /// strictly after `after` when given.
    async fn list_conversations(
        &self,
        owner_id: Uuid,
        limit: usize,
        after: Option<PageCursor>,
    ) -> Result<Vec<Conversation>, StoreError>;

    /// Insert the message and charge its tokens to the conversation in one
    /// transaction, bumping `updated_at`. `created_at` is assigned inside the
    /// transaction and is strictly later than every earlier message of the
    /// conversation. Re-appending an existing draft id returns the stored
    /// message without charging twice.
    ///
    /// Fails with [`StoreError::NotFound`] unless the conversation is live and
    /// owned by `draft.owner_id`.
    async fn append_message(&self, draft: &MessageDraft) -> Result<Message, StoreError>;

    /// `limit` messages after skipping the `offset` newest, oldest first.
    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Live conversations of `owner` whose title or messages match `query`,
    /// most relevant first.
    async fn search_conversations(
        &self,
        owner_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>, StoreError>;

    /// Returns false if nothing live and owned matched.
    async fn soft_delete(&self, id: Uuid, owner_id: Uuid) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
