//! Conversation store: ownership-checked persistence with cursor pagination,
//! cache integration and post-commit fan-out.

pub mod cursor;
pub mod memory;
pub mod postgres;
pub mod repository;

use std::{future::Future, sync::Arc, time::Instant};

use metrics::{counter, histogram};
use shared::{
    config::server::StoreConfig,
    models::{
        Conversation, ConversationPage, CreateConversationRequest, DeliveryEnvelope, Message,
        NewMessage, OutboundFrame,
    },
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    cache::{CacheError, CacheManager, SetOptions},
    fabric::FanoutFabric,
};

pub use cursor::PageCursor;
pub use memory::InMemoryRepository;
pub use postgres::PgRepository;
pub use repository::{ConversationRepository, MessageDraft};

/// Model tag used when a conversation is created without one.
pub const DEFAULT_MODEL: &str = "default";

const MAX_TITLE_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing, deleted, or owned by someone else.
    #[error("not found")]
    NotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("store operation timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("stored data is inconsistent: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Failures worth one internal retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Unavailable(_) => true,
            Self::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Whether a client should back off and retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl From<CacheError> for StoreError {
    fn from(err: CacheError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[must_use]
pub fn conversation_key(id: Uuid) -> String {
    format!("conv:{id}")
}

#[must_use]
pub fn recent_key(id: Uuid) -> String {
    format!("conv:{id}:recent")
}

fn conversation_pattern(id: Uuid) -> String {
    format!("conv:{id}*")
}

#[derive(Debug)]
pub struct ConversationStore {
    repo: Arc<dyn ConversationRepository>,
    cache: Arc<CacheManager>,
    fabric: Arc<dyn FanoutFabric>,
    topic: String,
    config: StoreConfig,
    send_locks: Vec<Mutex<()>>,
}

impl ConversationStore {
    #[must_use]
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        cache: Arc<CacheManager>,
        fabric: Arc<dyn FanoutFabric>,
        topic: impl Into<String>,
        config: StoreConfig,
    ) -> Self {
        let stripes = config.send_lock_stripes.max(1);
        Self {
            repo,
            cache,
            fabric,
            topic: topic.into(),
            config,
            send_locks: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    #[must_use]
    pub fn fabric(&self) -> &Arc<dyn FanoutFabric> {
        &self.fabric
    }

    #[instrument(name = "store.create_conversation", skip(self, request), err)]
    pub async fn create_conversation(
        &self,
        user_id: Uuid,
        request: CreateConversationRequest,
    ) -> StoreResult<Conversation> {
        let title = request
            .title
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty());
        if title
            .as_ref()
            .is_some_and(|title| title.chars().count() > MAX_TITLE_CHARS)
        {
            return Err(StoreError::Validation(format!(
                "title exceeds {MAX_TITLE_CHARS} characters"
            )));
        }

        let now = cursor::now_micros();
        let conversation = Conversation {
            id: Uuid::now_v7(),
            owner_id: user_id,
            title,
            model: request
                .model
                .filter(|model| !model.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: request.system_prompt,
            metadata: request.metadata,
            tokens_used: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.call("insert_conversation", || {
            self.repo.insert_conversation(&conversation)
        })
        .await?;

        if let Err(err) = self
            .cache
            .set(
                &conversation_key(conversation.id),
                &conversation,
                SetOptions::default(),
            )
            .await
        {
            warn!(conversation_id = %conversation.id, error = %err, "failed to cache new conversation");
        }
        counter!("parley_conversations_created_total").increment(1);
        Ok(conversation)
    }

    /// Conversation `id` if `user_id` owns it; foreign and missing records are
    /// indistinguishable.
    #[instrument(name = "store.get_conversation", skip(self), err(level = "debug"))]
    pub async fn get_conversation(&self, id: Uuid, user_id: Uuid) -> StoreResult<Conversation> {
        let cached: Conversation = self
            .cache
            .get_or_set(&conversation_key(id), SetOptions::default(), || {
                self.load_conversation(id)
            })
            .await?;
        if cached.is_owned_by(user_id) {
            return Ok(cached);
        }

        let fresh = self.load_conversation(id).await?;
        if !fresh.is_owned_by(user_id) {
            return Err(StoreError::NotFound);
        }
        if let Err(err) = self
            .cache
            .set(&conversation_key(id), &fresh, SetOptions::default())
            .await
        {
            debug!(conversation_id = %id, error = %err, "failed to refresh cached conversation");
        }
        Ok(fresh)
    }

    #[instrument(name = "store.list_conversations", skip(self, cursor), err)]
    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        limit: Option<u32>,
        cursor: Option<&str>,
    ) -> StoreResult<ConversationPage> {
        let limit = self.page_size(limit);
        let after = cursor
            .filter(|token| !token.is_empty())
            .map(PageCursor::decode)
            .transpose()?;

        let mut items = self
            .call("list_conversations", || {
                self.repo.list_conversations(user_id, limit + 1, after)
            })
            .await?;

        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| PageCursor::after(last).encode())
        } else {
            None
        };
        Ok(ConversationPage { items, next_cursor })
    }

    /// Persist a message, then invalidate, publish and record it as recent.
    ///
    /// Sends to one conversation are serialized in-process from the
    /// transaction to the publish, so delivery order equals persisted order.
    #[instrument(
        name = "store.send_message",
        skip(self, message),
        fields(role = %message.role),
        err
    )]
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message: NewMessage,
    ) -> StoreResult<Message> {
        if message.content.trim().is_empty() && message.function_arguments.is_none() {
            return Err(StoreError::Validation(
                "message content must not be empty".to_string(),
            ));
        }
        if message.token_count.is_some_and(|tokens| tokens < 0) {
            return Err(StoreError::Validation(
                "token_count must not be negative".to_string(),
            ));
        }

        let conversation = self.get_conversation(conversation_id, user_id).await?;
        let draft = MessageDraft {
            id: Uuid::now_v7(),
            conversation_id,
            owner_id: conversation.owner_id,
            message,
        };

        let _turn = self.stripe(conversation_id).lock().await;

        let stored = self
            .call("append_message", || self.repo.append_message(&draft))
            .await?;

        if let Err(err) = self.cache.delete(&[conversation_key(conversation_id)]).await {
            warn!(%conversation_id, error = %err, "failed to invalidate cached conversation");
        }

        self.publish(conversation.owner_id, &stored).await;

        let recent = recent_key(conversation_id);
        if let Err(err) = self
            .cache
            .push_capped(
                &recent,
                &stored,
                self.config.recent_messages_cap,
                self.config.recent_ttl(),
            )
            .await
        {
            warn!(%conversation_id, error = %err, "failed to record recent message");
            // A list with a gap must not be served.
            let _ = self.cache.delete(&[recent]).await;
        }

        counter!("parley_messages_persisted_total").increment(1);
        Ok(stored)
    }

    /// `limit` messages after skipping the `offset` newest, oldest first.
    #[instrument(name = "store.get_messages", skip(self), err)]
    pub async fn get_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> StoreResult<Vec<Message>> {
        self.get_conversation(conversation_id, user_id).await?;

        let limit = self.page_size(limit);
        let offset = offset.unwrap_or(0) as usize;
        let cap = self.config.recent_messages_cap;
        let recent = recent_key(conversation_id);

        if offset > 0 || limit > cap {
            return self
                .call("fetch_messages", || {
                    self.repo.fetch_messages(conversation_id, limit, offset)
                })
                .await;
        }

        match self.cache.range::<Message>(&recent, limit).await {
            Ok(mut newest) if newest.len() >= limit => {
                counter!("parley_recent_messages_hits_total").increment(1);
                newest.reverse();
                return Ok(newest);
            }
            Ok(_) => {}
            Err(err) => debug!(%conversation_id, error = %err, "recent list unavailable"),
        }

        let _turn = self.stripe(conversation_id).lock().await;
        let window = self
            .call("fetch_messages", || {
                self.repo.fetch_messages(conversation_id, cap, 0)
            })
            .await?;

        // A peer instance may push between the read and this write.
        let newest_first: Vec<&Message> = window.iter().rev().collect();
        match self
            .cache
            .refill_list(&recent, &newest_first, self.config.recent_ttl())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(%conversation_id, "recent list moved on; refill skipped"),
            Err(err) => debug!(%conversation_id, error = %err, "failed to refresh recent list"),
        }

        let skip = window.len().saturating_sub(limit);
        Ok(window.into_iter().skip(skip).collect())
    }

    /// Full-text search over the caller's conversations. Never cached.
    #[instrument(name = "store.search_conversations", skip(self, query), err)]
    pub async fn search_conversations(
        &self,
        user_id: Uuid,
        query: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<Conversation>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(StoreError::Validation(
                "search text must not be empty".to_string(),
            ));
        }
        let limit = self.page_size(limit);
        self.call("search_conversations", || {
            self.repo.search_conversations(user_id, query, limit)
        })
        .await
    }

    /// Soft-delete a conversation and drop every cache entry derived from it.
    #[instrument(name = "store.delete_conversation", skip(self), err)]
    pub async fn delete_conversation(&self, id: Uuid, user_id: Uuid) -> StoreResult<()> {
        self.get_conversation(id, user_id).await?;

        let deleted = self
            .call("soft_delete", || self.repo.soft_delete(id, user_id))
            .await?;
        if !deleted {
            return Err(StoreError::NotFound);
        }

        if let Err(err) = self.cache.invalidate_pattern(&conversation_pattern(id)).await {
            warn!(conversation_id = %id, error = %err, "failed to invalidate deleted conversation");
        }
        Ok(())
    }

    /// # Errors
    /// Returns the repository failure.
    pub async fn ping(&self) -> StoreResult<()> {
        self.call("ping", || self.repo.ping()).await
    }

    async fn load_conversation(&self, id: Uuid) -> StoreResult<Conversation> {
        self.call("fetch_conversation", || self.repo.fetch_conversation(id))
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn publish(&self, owner_id: Uuid, message: &Message) {
        let envelope = DeliveryEnvelope {
            user_id: owner_id,
            conversation_id: Some(message.conversation_id),
            origin: None,
            frame: OutboundFrame::Message {
                message: message.clone(),
            }
            .into(),
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "failed to encode delivery");
                return;
            }
        };
        if let Err(err) = self.fabric.publish(&self.topic, payload).await {
            counter!("parley_fabric_publish_failures_total").increment(1);
            warn!(message_id = %message.id, error = %err, "failed to publish delivery");
        }
    }

    fn page_size(&self, requested: Option<u32>) -> usize {
        let max = self.config.max_page_size.max(1);
        requested
            .unwrap_or(self.config.default_page_size)
            .clamp(1, max) as usize
    }

    fn stripe(&self, conversation_id: Uuid) -> &Mutex<()> {
        let stripes = self.send_locks.len() as u128;
        #[allow(clippy::cast_possible_truncation)]
        let index = (conversation_id.as_u128() % stripes) as usize;
        &self.send_locks[index]
    }

    /// Run a repository call under the operation deadline, retrying a
    /// transient failure once.
    async fn call<T, F, Fut>(&self, op: &'static str, mut operation: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let started = Instant::now();
        let mut retried = false;
        let outcome = loop {
            let attempt = tokio::time::timeout(self.config.op_timeout(), operation())
                .await
                .unwrap_or(Err(StoreError::Timeout));
            match attempt {
                Err(err) if err.is_transient() && !retried => {
                    warn!(op, error = %err, "transient store failure; retrying once");
                    counter!("parley_store_retries_total", "op" => op).increment(1);
                    retried = true;
                }
                Err(err) if err.is_transient() => {
                    break Err(match err {
                        StoreError::Unavailable(_) => err,
                        other => StoreError::Unavailable(other.to_string()),
                    });
                }
                other => break other,
            }
        };
        histogram!("parley_store_op_seconds", "op" => op).record(started.elapsed().as_secs_f64());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::LocalFabric;
    use async_trait::async_trait;
    use futures::StreamExt;
    use shared::{
        config::server::CacheConfig,
        models::{DeliveryFrame, MessageRole},
    };
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };
    use tokio::sync::Notify;

    const TOPIC: &str = "test.deliveries";

    fn store_with(repo: Arc<dyn ConversationRepository>) -> (ConversationStore, Arc<LocalFabric>) {
        let fabric = Arc::new(LocalFabric::new(64));
        let store = ConversationStore::new(
            repo,
            Arc::new(CacheManager::in_memory(CacheConfig::default())),
            fabric.clone(),
            TOPIC,
            StoreConfig {
                recent_messages_cap: 5,
                ..StoreConfig::default()
            },
        );
        (store, fabric)
    }

    fn store() -> (ConversationStore, Arc<LocalFabric>) {
        store_with(Arc::new(InMemoryRepository::new()))
    }

    fn titled(title: &str) -> CreateConversationRequest {
        CreateConversationRequest {
            title: Some(title.to_string()),
            ..CreateConversationRequest::default()
        }
    }

    #[tokio::test]
    async fn created_conversation_is_cached_and_owned() {
        let (store, _) = store();
        let owner = Uuid::new_v4();

        let conversation = store.create_conversation(owner, titled("  Plans  ")).await.unwrap();
        assert_eq!(conversation.title.as_deref(), Some("Plans"));
        assert_eq!(conversation.model, DEFAULT_MODEL);

        let cached: Option<Conversation> =
            store.cache().get(&conversation_key(conversation.id)).await;
        assert_eq!(cached, Some(conversation.clone()));
        assert_eq!(
            store.get_conversation(conversation.id, owner).await.unwrap(),
            conversation
        );
    }

    #[tokio::test]
    async fn foreign_conversation_looks_missing() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        let conversation = store.create_conversation(owner, titled("mine")).await.unwrap();

        let err = store
            .get_conversation(conversation.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));

        let err = store
            .get_conversation(Uuid::now_v7(), owner)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn send_message_charges_tokens_and_publishes() {
        let (store, fabric) = store();
        let owner = Uuid::new_v4();
        let conversation = store
            .create_conversation(owner, CreateConversationRequest::default())
            .await
            .unwrap();
        let mut deliveries = fabric.subscribe(TOPIC).await.unwrap();

        let stored = store
            .send_message(conversation.id, owner, NewMessage::user("hello there"))
            .await
            .unwrap();
        assert_eq!(stored.role, MessageRole::User);
        assert_eq!(stored.token_count, 3);

        let refreshed = store.get_conversation(conversation.id, owner).await.unwrap();
        assert_eq!(refreshed.tokens_used, 3);
        assert!(refreshed.updated_at >= stored.created_at);

        let payload = deliveries.next().await.unwrap();
        let envelope: DeliveryEnvelope = serde_json::from_str(&payload).unwrap();
        assert_eq!(envelope.user_id, owner);
        assert_eq!(envelope.conversation_id, Some(conversation.id));
        assert!(matches!(
            envelope.frame,
            DeliveryFrame::Typed(OutboundFrame::Message { message }) if message.id == stored.id
        ));
    }

    #[tokio::test]
    async fn deliveries_are_not_replayed_to_late_subscribers() {
        let (store, fabric) = store();
        let owner = Uuid::new_v4();
        let conversation = store
            .create_conversation(owner, CreateConversationRequest::default())
            .await
            .unwrap();
        store
            .send_message(conversation.id, owner, NewMessage::user("before"))
            .await
            .unwrap();

        let mut deliveries = fabric.subscribe(TOPIC).await.unwrap();
        store
            .send_message(conversation.id, owner, NewMessage::user("after"))
            .await
            .unwrap();

        let payload = deliveries.next().await.unwrap();
        let envelope: DeliveryEnvelope = serde_json::from_str(&payload).unwrap();
        assert!(matches!(
            envelope.frame,
            DeliveryFrame::Typed(OutboundFrame::Message { message }) if message.content == "after"
        ));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), deliveries.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn send_to_foreign_or_empty_is_rejected() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        let conversation = store
            .create_conversation(owner, CreateConversationRequest::default())
            .await
            .unwrap();

        let err = store
            .send_message(conversation.id, Uuid::new_v4(), NewMessage::user("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));

        let err = store
            .send_message(conversation.id, owner, NewMessage::user("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn messages_page_from_newest_and_return_oldest_first() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        let conversation = store
            .create_conversation(owner, CreateConversationRequest::default())
            .await
            .unwrap();
        for index in 0..8 {
            store
                .send_message(conversation.id, owner, NewMessage::user(format!("m{index}")))
                .await
                .unwrap();
        }

        let contents = |messages: Vec<Message>| {
            messages
                .into_iter()
                .map(|m| m.content)
                .collect::<Vec<_>>()
        };

        let newest = store
            .get_messages(conversation.id, owner, Some(3), Some(0))
            .await
            .unwrap();
        assert_eq!(contents(newest), ["m5", "m6", "m7"]);

        let older = store
            .get_messages(conversation.id, owner, Some(3), Some(3))
            .await
            .unwrap();
        assert_eq!(contents(older), ["m2", "m3", "m4"]);

        let beyond_cap = store
            .get_messages(conversation.id, owner, Some(20), None)
            .await
            .unwrap();
        assert_eq!(beyond_cap.len(), 8);
        assert!(beyond_cap.windows(2).all(|w| w[0].order_key() < w[1].order_key()));
    }

    #[tokio::test]
    async fn recent_list_is_rebuilt_after_loss() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        let conversation = store
            .create_conversation(owner, CreateConversationRequest::default())
            .await
            .unwrap();
        for index in 0..4 {
            store
                .send_message(conversation.id, owner, NewMessage::user(format!("m{index}")))
                .await
                .unwrap();
        }
        store
            .cache()
            .delete(&[recent_key(conversation.id)])
            .await
            .unwrap();

        let first = store
            .get_messages(conversation.id, owner, Some(2), None)
            .await
            .unwrap();
        let cached: Vec<Message> = store
            .cache()
            .range(&recent_key(conversation.id), 10)
            .await
            .unwrap();
        assert_eq!(cached.len(), 4);
        assert_eq!(cached[0].content, "m3");

        let second = store
            .get_messages(conversation.id, owner, Some(2), None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second[1].content, "m3");
    }

    #[tokio::test]
    async fn cursor_pages_never_overlap_and_replay_identically() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        for index in 0..7 {
            store
                .create_conversation(owner, titled(&format!("c{index}")))
                .await
                .unwrap();
        }
        store.create_conversation(other, titled("x")).await.unwrap();

        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;
        loop {
            let page = store
                .list_conversations(owner, Some(3), cursor.as_deref())
                .await
                .unwrap();
            let replay = store
                .list_conversations(owner, Some(3), cursor.as_deref())
                .await
                .unwrap();
            assert_eq!(page, replay);

            for item in &page.items {
                assert_eq!(item.owner_id, owner);
                assert!(seen.insert(item.id), "page overlap");
            }
            pages += 1;
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(pages, 3);

        let err = store
            .list_conversations(owner, None, Some("garbage!"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn search_is_scoped_to_the_caller() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let conversation = store
            .create_conversation(owner, titled("Trip"))
            .await
            .unwrap();
        store
            .send_message(conversation.id, owner, NewMessage::user("Looking for hiking boots"))
            .await
            .unwrap();

        let hits = store
            .search_conversations(owner, "boots", None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store
            .search_conversations(intruder, "boots", None)
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            store.search_conversations(owner, "  ", None).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn deleted_conversations_disappear_everywhere() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        let conversation = store.create_conversation(owner, titled("bye")).await.unwrap();
        store
            .send_message(conversation.id, owner, NewMessage::user("one"))
            .await
            .unwrap();

        store.delete_conversation(conversation.id, owner).await.unwrap();

        assert!(matches!(
            store.get_conversation(conversation.id, owner).await,
            Err(StoreError::NotFound)
        ));
        let cached: Vec<Message> = store
            .cache()
            .range(&recent_key(conversation.id), 10)
            .await
            .unwrap();
        assert!(cached.is_empty());
        assert!(store
            .list_conversations(owner, None, None)
            .await
            .unwrap()
            .items
            .is_empty());
    }

    /// Fails the first `failures` appends with a transient error.
    #[derive(Debug)]
    struct Flaky {
        inner: InMemoryRepository,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ConversationRepository for Flaky {
        async fn insert_conversation(&self, c: &Conversation) -> StoreResult<()> {
            self.inner.insert_conversation(c).await
        }
        async fn fetch_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
            self.inner.fetch_conversation(id).await
        }
        async fn list_conversations(
            &self,
            owner_id: Uuid,
            limit: usize,
            after: Option<PageCursor>,
        ) -> StoreResult<Vec<Conversation>> {
            self.inner.list_conversations(owner_id, limit, after).await
        }
        async fn append_message(&self, draft: &MessageDraft) -> StoreResult<Message> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Timeout);
            }
            self.inner.append_message(draft).await
        }
        async fn fetch_messages(
            &self,
            conversation_id: Uuid,
            limit: usize,
            offset: usize,
        ) -> StoreResult<Vec<Message>> {
            self.inner.fetch_messages(conversation_id, limit, offset).await
        }
        async fn search_conversations(
            &self,
            owner_id: Uuid,
            query: &str,
            limit: usize,
        ) -> StoreResult<Vec<Conversation>> {
            self.inner.search_conversations(owner_id, query, limit).await
        }
        async fn soft_delete(&self, id: Uuid, owner_id: Uuid) -> StoreResult<bool> {
            self.inner.soft_delete(id, owner_id).await
        }
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_once_then_surface_as_unavailable() {
        let flaky = Arc::new(Flaky {
            inner: InMemoryRepository::new(),
            failures: AtomicUsize::new(1),
        });
        let (store, _) = store_with(flaky.clone());
        let owner = Uuid::new_v4();
        let conversation = store
            .create_conversation(owner, CreateConversationRequest::default())
            .await
            .unwrap();

        store
            .send_message(conversation.id, owner, NewMessage::user("retried"))
            .await
            .unwrap();

        flaky.failures.store(2, Ordering::SeqCst);
        let err = store
            .send_message(conversation.id, owner, NewMessage::user("lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.is_retryable());

        let history = store
            .get_messages(conversation.id, owner, Some(10), None)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    /// Holds the next `fetch_messages` after it has read its snapshot.
    #[derive(Debug, Default)]
    struct Paused {
        inner: InMemoryRepository,
        armed: AtomicBool,
        reading: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl ConversationRepository for Paused {
        async fn insert_conversation(&self, c: &Conversation) -> StoreResult<()> {
            self.inner.insert_conversation(c).await
        }
        async fn fetch_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
            self.inner.fetch_conversation(id).await
        }
        async fn list_conversations(
            &self,
            owner_id: Uuid,
            limit: usize,
            after: Option<PageCursor>,
        ) -> StoreResult<Vec<Conversation>> {
            self.inner.list_conversations(owner_id, limit, after).await
        }
        async fn append_message(&self, draft: &MessageDraft) -> StoreResult<Message> {
            self.inner.append_message(draft).await
        }
        async fn fetch_messages(
            &self,
            conversation_id: Uuid,
            limit: usize,
            offset: usize,
        ) -> StoreResult<Vec<Message>> {
            let window = self.inner.fetch_messages(conversation_id, limit, offset).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.reading.notify_one();
                self.resume.notified().await;
            }
            window
        }
        async fn search_conversations(
            &self,
            owner_id: Uuid,
            query: &str,
            limit: usize,
        ) -> StoreResult<Vec<Conversation>> {
            self.inner.search_conversations(owner_id, query, limit).await
        }
        async fn soft_delete(&self, id: Uuid, owner_id: Uuid) -> StoreResult<bool> {
            self.inner.soft_delete(id, owner_id).await
        }
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn recent_refill_does_not_erase_a_peer_push() {
        let repo = Arc::new(Paused::default());
        let cache = Arc::new(CacheManager::in_memory(CacheConfig::default()));
        let instance = |repo: Arc<Paused>| {
            Arc::new(ConversationStore::new(
                repo,
                cache.clone(),
                Arc::new(LocalFabric::new(64)),
                TOPIC,
                StoreConfig {
                    recent_messages_cap: 5,
                    ..StoreConfig::default()
                },
            ))
        };
        let first = instance(repo.clone());
        let second = instance(repo.clone());

        let owner = Uuid::new_v4();
        let conversation = first
            .create_conversation(owner, CreateConversationRequest::default())
            .await
            .unwrap();
        for index in 0..4 {
            first
                .send_message(conversation.id, owner, NewMessage::user(format!("m{index}")))
                .await
                .unwrap();
        }
        cache.delete(&[recent_key(conversation.id)]).await.unwrap();

        repo.armed.store(true, Ordering::SeqCst);
        let rebuilding = {
            let first = first.clone();
            tokio::spawn(async move {
                first
                    .get_messages(conversation.id, owner, Some(2), None)
                    .await
            })
        };
        repo.reading.notified().await;
        second
            .send_message(conversation.id, owner, NewMessage::user("m4"))
            .await
            .unwrap();
        repo.resume.notify_one();

        let stale: Vec<String> = rebuilding
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(stale, ["m2", "m3"]);

        for store in [&first, &second] {
            let latest: Vec<String> = store
                .get_messages(conversation.id, owner, Some(2), None)
                .await
                .unwrap()
                .into_iter()
                .map(|m| m.content)
                .collect();
            assert_eq!(latest, ["m3", "m4"]);
        }
    }
}
