use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use shared::models::{Conversation, Message};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    StoreError,
    cursor::{PageCursor, now_micros},
    repository::{ConversationRepository, MessageDraft},
};

#[derive(Debug, Default)]
struct State {
    conversations: HashMap<Uuid, Conversation>,
    /// Per conversation, in `(created_at, id)` order.
    messages: HashMap<Uuid, Vec<Message>>,
}

/// Process-local repository with the same observable semantics as the
/// `PostgreSQL` one. Search is a case-insensitive term match.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn live(conversation: &Conversation) -> bool {
    conversation.deleted_at.is_none()
}

fn terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|term| !term.is_empty())
        .collect()
}

fn score(text: &str, terms: &[String]) -> usize {
    let text = text.to_lowercase();
    terms.iter().filter(|term| text.contains(term.as_str())).count()
}

#[async_trait]
impl ConversationRepository for InMemoryRepository {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.conversations.contains_key(&conversation.id) {
            return Err(StoreError::Validation(format!(
                "conversation {} already exists",
                conversation.id
            )));
        }
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn fetch_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let state = self.state.read().await;
        Ok(state.conversations.get(&id).filter(|c| live(c)).cloned())
    }

    async fn list_conversations(
        &self,
        owner_id: Uuid,
        limit: usize,
        after: Option<PageCursor>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let state = self.state.read().await;
        let mut items: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.owner_id == owner_id && live(c))
            .filter(|c| after.is_none_or(|cursor| cursor.precedes(c)))
            .cloned()
            .collect();
        items.sort_by(|a, b| (b.updated_at, b.id).cmp(&(a.updated_at, a.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn append_message(&self, draft: &MessageDraft) -> Result<Message, StoreError> {
        let mut state = self.state.write().await;
        let State {
            conversations,
            messages,
        } = &mut *state;

        let conversation = conversations
            .get_mut(&draft.conversation_id)
            .filter(|c| c.owner_id == draft.owner_id && live(c))
            .ok_or(StoreError::NotFound)?;

        let history = messages.entry(draft.conversation_id).or_default();
        if let Some(existing) = history.iter().find(|m| m.id == draft.id) {
            return Ok(existing.clone());
        }

        let mut created_at = now_micros();
        if let Some(last) = history.last()
            && created_at <= last.created_at
        {
            created_at = last.created_at + ChronoDuration::microseconds(1);
        }

        let tokens = draft.message.tokens();
        let message = Message {
            id: draft.id,
            conversation_id: draft.conversation_id,
            role: draft.message.role,
            content: draft.message.content.clone(),
            function_name: draft.message.function_name.clone(),
            function_arguments: draft.message.function_arguments.clone(),
            token_count: tokens,
            metadata: draft.message.metadata.clone(),
            created_at,
        };
        history.push(message.clone());

        conversation.tokens_used += i64::from(tokens);
        conversation.updated_at = conversation.updated_at.max(created_at);
        Ok(message)
    }

    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        let Some(history) = state.messages.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        let end = history.len().saturating_sub(offset);
        let start = end.saturating_sub(limit);
        Ok(history[start..end].to_vec())
    }

    async fn search_conversations(
        &self,
        owner_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>, StoreError> {
        let terms = terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut ranked: Vec<(usize, &Conversation)> = state
            .conversations
            .values()
            .filter(|c| c.owner_id == owner_id && live(c))
            .filter_map(|c| {
                let title = c.title.as_deref().map_or(0, |title| score(title, &terms));
                let body: usize = state
                    .messages
                    .get(&c.id)
                    .map_or(0, |history| history.iter().map(|m| score(&m.content, &terms)).sum());
                let rank = title + body;
                (rank > 0).then_some((rank, c))
            })
            .collect();

        ranked.sort_by(|(ra, a), (rb, b)| rb.cmp(ra).then(b.updated_at.cmp(&a.updated_at)));
        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn soft_delete(&self, id: Uuid, owner_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state
            .conversations
            .get_mut(&id)
            .filter(|c| c.owner_id == owner_id && live(c))
        {
            Some(conversation) => {
                conversation.deleted_at = Some(now_micros());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
