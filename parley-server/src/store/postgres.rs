use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::models::{Conversation, Message, MessageRole, Metadata};
use sqlx::{PgPool, types::Json};
use tracing::instrument;
use uuid::Uuid;

use super::{
    StoreError,
    cursor::PageCursor,
    repository::{ConversationRepository, MessageDraft},
};

const CONVERSATION_COLUMNS: &str = "c.id, c.owner_id, c.title, c.model, c.system_prompt, \
     c.metadata, c.tokens_used, c.created_at, c.updated_at, c.deleted_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, function_name, \
     function_arguments, token_count, metadata, created_at";

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    owner_id: Uuid,
    title: Option<String>,
    model: String,
    system_prompt: Option<String>,
    metadata: Json<Metadata>,
    tokens_used: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            title: row.title,
            model: row.model,
            system_prompt: row.system_prompt,
            metadata: row.metadata.0,
            tokens_used: row.tokens_used,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    role: String,
    content: String,
    function_name: Option<String>,
    function_arguments: Option<Json<Value>>,
    token_count: i32,
    metadata: Json<Metadata>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let role = MessageRole::try_from(row.role.as_str())
            .map_err(|_| StoreError::Corrupt(format!("unknown message role '{}'", row.role)))?;
        Ok(Self {
            id: row.id,
            conversation_id: row.conversation_id,
            role,
            content: row.content,
            function_name: row.function_name,
            function_arguments: row.function_arguments.map(|json| json.0),
            token_count: row.token_count,
            metadata: row.metadata.0,
            created_at: row.created_at,
        })
    }
}

/// `PostgreSQL` repository. Messages live in a table hash-partitioned by
/// conversation id.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl fmt::Debug for PgRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgRepository").finish()
    }
}

impl PgRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ConversationRepository for PgRepository {
    #[instrument(name = "pg.insert_conversation", skip_all, fields(conversation_id = %conversation.id), err)]
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO conversations
                (id, owner_id, title, model, system_prompt, metadata, tokens_used, created_at, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(conversation.id)
        .bind(conversation.owner_id)
        .bind(&conversation.title)
        .bind(&conversation.model)
        .bind(&conversation.system_prompt)
        .bind(Json(&conversation.metadata))
        .bind(conversation.tokens_used)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
             WHERE c.id = $1 AND c.deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Conversation::from))
    }

    async fn list_conversations(
        &self,
        owner_id: Uuid,
        limit: usize,
        after: Option<PageCursor>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
             WHERE c.owner_id = $1 AND c.deleted_at IS NULL \
               AND ($2::timestamptz IS NULL OR (c.updated_at, c.id) < ($2, $3)) \
             ORDER BY c.updated_at DESC, c.id DESC \
             LIMIT $4"
        ))
        .bind(owner_id)
        .bind(after.map(|cursor| cursor.updated_at))
        .bind(after.map(|cursor| cursor.id))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    #[instrument(
        name = "pg.append_message",
        skip_all,
        fields(conversation_id = %draft.conversation_id, message_id = %draft.id),
        err
    )]
    async fn append_message(&self, draft: &MessageDraft) -> Result<Message, StoreError> {
        let mut tx = self.pool.begin().await?;

        let owned: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM conversations \
             WHERE id = $1 AND owner_id = $2 AND deleted_at IS NULL \
             FOR UPDATE",
        )
        .bind(draft.conversation_id)
        .bind(draft.owner_id)
        .fetch_optional(&mut *tx)
        .await?;
        if owned.is_none() {
            return Err(StoreError::NotFound);
        }

        let existing = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 AND id = $2"
        ))
        .bind(draft.conversation_id)
        .bind(draft.id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            tx.commit().await?;
            return Message::try_from(row);
        }

        let tokens = draft.message.tokens();
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "INSERT INTO messages \
                (id, conversation_id, owner_id, role, content, function_name, \
                 function_arguments, token_count, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, \
                GREATEST(clock_timestamp(), \
                    (SELECT max(created_at) + interval '1 microsecond' \
                       FROM messages WHERE conversation_id = $2))) \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(draft.id)
        .bind(draft.conversation_id)
        .bind(draft.owner_id)
        .bind(draft.message.role.as_str())
        .bind(&draft.message.content)
        .bind(&draft.message.function_name)
        .bind(draft.message.function_arguments.as_ref().map(Json))
        .bind(tokens)
        .bind(Json(&draft.message.metadata))
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations \
             SET tokens_used = tokens_used + $2, updated_at = GREATEST(updated_at, $3) \
             WHERE id = $1",
        )
        .bind(draft.conversation_id)
        .bind(i64::from(tokens))
        .bind(row.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Message::try_from(row)
    }

    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                SELECT {MESSAGE_COLUMNS} FROM messages \
                WHERE conversation_id = $1 \
                ORDER BY created_at DESC, id DESC \
                LIMIT $2 OFFSET $3 \
             ) newest \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(conversation_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Message::try_from).collect()
    }

    #[instrument(name = "pg.search_conversations", skip(self, query), err)]
    async fn search_conversations(
        &self,
        owner_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query_as::<_, ConversationRow>(&format!(
            "WITH q AS (SELECT plainto_tsquery('english', $2) AS query), \
             hits AS ( \
                SELECT m.conversation_id, ts_rank(m.search_vector, q.query) AS rank \
                  FROM messages m, q \
                 WHERE m.owner_id = $1 AND m.search_vector @@ q.query \
                UNION ALL \
                SELECT c.id, ts_rank(to_tsvector('english', coalesce(c.title, '')), q.query) \
                  FROM conversations c, q \
                 WHERE c.owner_id = $1 \
                   AND to_tsvector('english', coalesce(c.title, '')) @@ q.query \
             ) \
             SELECT {CONVERSATION_COLUMNS}, max(h.rank) AS rank \
               FROM conversations c JOIN hits h ON h.conversation_id = c.id \
              WHERE c.owner_id = $1 AND c.deleted_at IS NULL \
              GROUP BY c.id \
              ORDER BY rank DESC, c.updated_at DESC \
              LIMIT $3"
        ))
        .bind(owner_id)
        .bind(query)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    async fn soft_delete(&self, id: Uuid, owner_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE conversations SET deleted_at = now() \
             WHERE id = $1 AND owner_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
