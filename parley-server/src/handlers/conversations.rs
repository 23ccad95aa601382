use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use shared::models::{
    CreateConversationRequest, GetMessagesQuery, ListConversationsQuery, NewMessage,
    SearchConversationsQuery, SendMessageRequest,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    middleware::auth::AuthUser,
};

/// Conversation REST endpoints, relative to `/api`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/conversations", post(create_conversation).get(list_conversations))
        .route("/conversations/search", get(search_conversations))
        .route(
            "/conversations/{conversation_id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(get_messages).post(send_message),
        )
}

#[instrument(skip_all, fields(user_id = %user_id))]
async fn create_conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<CreateConversationRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;
    let created = state.store.create_conversation(user_id, request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[instrument(skip_all, fields(user_id = %user_id))]
async fn list_conversations(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    query: Result<Query<ListConversationsQuery>, QueryRejection>,
) -> AppResult<impl IntoResponse> {
    let Query(query) = query?;
    let page = state
        .store
        .list_conversations(user_id, query.limit, query.cursor.as_deref())
        .await?;
    Ok(Json(page))
}

#[instrument(skip_all, fields(user_id = %user_id))]
async fn search_conversations(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    query: Result<Query<SearchConversationsQuery>, QueryRejection>,
) -> AppResult<impl IntoResponse> {
    let Query(query) = query?;
    if query.q.trim().is_empty() {
        return Err(ApiError::validation("query must not be empty"));
    }
    let hits = state
        .store
        .search_conversations(user_id, &query.q, query.limit)
        .await?;
    Ok(Json(hits))
}

#[instrument(skip_all, fields(user_id = %user_id, conversation_id = %conversation_id))]
async fn get_conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let conversation = state
        .store
        .get_conversation(conversation_id, user_id)
        .await?;
    Ok(Json(conversation))
}

#[instrument(skip_all, fields(user_id = %user_id, conversation_id = %conversation_id))]
async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state
        .store
        .delete_conversation(conversation_id, user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all, fields(user_id = %user_id, conversation_id = %conversation_id))]
async fn get_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    query: Result<Query<GetMessagesQuery>, QueryRejection>,
) -> AppResult<impl IntoResponse> {
    let Query(query) = query?;
    let messages = state
        .store
        .get_messages(conversation_id, user_id, query.limit, query.offset)
        .await?;
    Ok(Json(messages))
}

#[instrument(skip_all, fields(user_id = %user_id, conversation_id = %conversation_id))]
async fn send_message(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;
    let mut message = NewMessage::new(request.role, request.content);
    message.metadata = request.metadata;
    let stored = state
        .store
        .send_message(conversation_id, user_id, message)
        .await?;
    Ok((StatusCode::CREATED, Json(stored)))
}
