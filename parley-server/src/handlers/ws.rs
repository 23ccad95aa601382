use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::StreamExt;
use tracing::debug;

use crate::{app_state::AppState, hub::session, middleware::auth::AuthUser};

/// Upgrade to a WebSocket and hand the socket to the hub.
///
/// The transport limit sits above the hub's own frame limit so oversized
/// frames reach the session and are closed with 1009.
pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    let transport_limit = state.config.hub.max_frame_bytes.saturating_mul(2);
    let ctx = state.session_context();
    debug!(user_id = %user_id, "websocket upgrade");

    ws.max_message_size(transport_limit)
        .max_frame_size(transport_limit)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            session::serve(ctx, user_id, sink, stream).await;
        })
}
