//! Per-connection read and write loops.
//!
//! Both loops are generic over the socket halves so they can be driven by an
//! axum `WebSocket` in production and by plain channels in tests.

use std::{fmt, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::ws::{CloseFrame, Message, Utf8Bytes},
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use serde_json::Value;
use shared::models::{
    ActivityKind, ChatFrame, CreateConversationRequest, ErrorCode, InboundFrame, NewMessage,
    OutboundFrame, SearchFrame,
};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ConnectionHandle, Hub, HubError, Outbound, Registration,
    connection::close_code,
    rate_limit::{RateLimitOutcome, Strategy, TokenBucket},
};
use crate::{
    responder::Responder,
    store::{ConversationStore, StoreError},
};

const CLOSE_GRACE: Duration = Duration::from_secs(1);
const TITLE_CHARS: usize = 60;

/// What a connection needs beyond its own socket.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub hub: Arc<Hub>,
    pub store: Arc<ConversationStore>,
    pub responder: Arc<dyn Responder>,
}

/// Admit `user_id` and run the connection until either side closes it.
///
/// A connection refused by the hub gets a `capacity_exceeded` error frame and
/// close code 1013.
pub async fn serve<Si, St, E>(ctx: SessionContext, user_id: Uuid, sink: Si, stream: St)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: fmt::Display + Send,
    St: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    match ctx.hub.register(user_id).await {
        Ok(registration) => run(ctx, registration, sink, stream).await,
        Err(err) => refuse(sink, &err).await,
    }
}

pub async fn run<Si, St, E>(ctx: SessionContext, registration: Registration, sink: Si, stream: St)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: fmt::Display + Send,
    St: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    let Registration { handle, outbound } = registration;
    let hub_config = ctx.hub.config();
    let ping_every = hub_config.ping_interval();
    let bucket = TokenBucket::new(Strategy::new(
        f64::from(hub_config.burst),
        hub_config.rate_per_second,
    ));
    let max_frame_bytes = hub_config.max_frame_bytes;

    let writer = tokio::spawn(write_loop(sink, outbound, handle.clone(), ping_every));
    info!(connection_id = %handle.id(), user_id = %handle.user_id(), "connection opened");
    send_direct(
        &handle,
        &OutboundFrame::System {
            message: "connected".to_string(),
            connection_id: Some(handle.id()),
        },
    );

    let mut session = Session {
        ctx,
        handle: handle.clone(),
        bucket,
        max_frame_bytes,
    };
    session.read_loop(stream).await;

    session.ctx.hub.unregister(handle.id()).await;
    if tokio::time::timeout(CLOSE_GRACE * 2, writer).await.is_err() {
        debug!(connection_id = %handle.id(), "writer did not finish in time");
    }
    info!(connection_id = %handle.id(), user_id = %handle.user_id(), "connection closed");
}

/// Tell a refused client why, then close.
pub async fn refuse<Si>(mut sink: Si, err: &HubError)
where
    Si: Sink<Message> + Unpin,
{
    let frame = OutboundFrame::error(ErrorCode::CapacityExceeded, err.to_string());
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
    let _ = sink
        .send(close_message(close_code::AGAIN, "capacity exceeded"))
        .await;
    let _ = sink.close().await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Session {
    ctx: SessionContext,
    handle: Arc<ConnectionHandle>,
    bucket: TokenBucket,
    max_frame_bytes: usize,
}

impl Session {
    async fn read_loop<St, E>(&mut self, mut stream: St)
    where
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            let next = tokio::select! {
                () = self.handle.cancelled() => break,
                next = stream.next() => next,
            };
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    debug!(connection_id = %self.handle.id(), error = %err, "socket read failed");
                    break;
                }
                None => break,
            };

            self.handle.touch();
            let flow = match message {
                Message::Text(text) => self.on_text(text.as_str()).await,
                Message::Binary(bytes) => self.on_binary(bytes.len()),
                Message::Ping(_) | Message::Pong(_) => Flow::Continue,
                Message::Close(_) => Flow::Stop,
            };
            if flow == Flow::Stop {
                break;
            }
        }
    }

    async fn on_text(&mut self, text: &str) -> Flow {
        if self.oversized(text.len()) {
            return Flow::Stop;
        }
        if !self.admit() {
            return Flow::Continue;
        }

        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                counter!("parley_hub_invalid_frames_total").increment(1);
                debug!(connection_id = %self.handle.id(), error = %err, "invalid frame");
                send_direct(
                    &self.handle,
                    &OutboundFrame::error(ErrorCode::InvalidFrame, err.to_string()),
                );
                self.handle.close(close_code::INVALID, "invalid frame");
                return Flow::Stop;
            }
        };

        match frame {
            InboundFrame::Chat(chat) => {
                counter!("parley_hub_frames_total", "type" => "chat").increment(1);
                self.on_chat(chat).await;
            }
            InboundFrame::Search(search) => {
                counter!("parley_hub_frames_total", "type" => "search").increment(1);
                self.on_search(search);
            }
            InboundFrame::Typing => {
                counter!("parley_hub_frames_total", "type" => "typing").increment(1);
                self.ctx
                    .hub
                    .relay_verbatim(self.handle.user_id(), text, self.handle.id())
                    .await;
            }
            InboundFrame::Unknown(kind) => {
                counter!("parley_hub_frames_total", "type" => "unknown").increment(1);
                debug!(connection_id = %self.handle.id(), kind = %kind, "ignoring unknown frame type");
            }
        }
        Flow::Continue
    }

    fn on_binary(&mut self, len: usize) -> Flow {
        if self.oversized(len) {
            return Flow::Stop;
        }
        if !self.admit() {
            return Flow::Continue;
        }
        counter!("parley_hub_invalid_frames_total").increment(1);
        send_direct(
            &self.handle,
            &OutboundFrame::error(ErrorCode::InvalidFrame, "frames must be JSON text"),
        );
        self.handle.close(close_code::INVALID, "invalid frame");
        Flow::Stop
    }

    fn oversized(&self, len: usize) -> bool {
        if len <= self.max_frame_bytes {
            return false;
        }
        counter!("parley_hub_oversized_frames_total").increment(1);
        warn!(
            connection_id = %self.handle.id(),
            len,
            limit = self.max_frame_bytes,
            "frame too large; closing connection"
        );
        self.handle.close(close_code::SIZE, "frame too large");
        true
    }

    /// Over-limit frames are dropped without any reply.
    fn admit(&mut self) -> bool {
        match self.bucket.take() {
            RateLimitOutcome::Allowed { .. } => true,
            RateLimitOutcome::Denied { retry_after } => {
                counter!("parley_hub_rate_limited_total").increment(1);
                debug!(
                    connection_id = %self.handle.id(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    "dropping rate-limited frame"
                );
                false
            }
        }
    }

    async fn on_chat(&self, frame: ChatFrame) {
        let ChatFrame {
            id,
            conversation_id,
            content,
            filter,
        } = frame;
        if content.trim().is_empty() {
            send_direct(
                &self.handle,
                &OutboundFrame::error(ErrorCode::ValidationFailed, "content must not be empty"),
            );
            return;
        }

        let user_id = self.handle.user_id();
        let store = &self.ctx.store;
        let conversation_id = match conversation_id {
            Some(id) => id,
            None => {
                let request = CreateConversationRequest {
                    title: Some(title_from(&content)),
                    ..CreateConversationRequest::default()
                };
                match store.create_conversation(user_id, request).await {
                    Ok(conversation) => conversation.id,
                    Err(err) => {
                        send_direct(&self.handle, &store_error_frame(&err));
                        return;
                    }
                }
            }
        };

        if let Err(err) = store
            .send_message(conversation_id, user_id, NewMessage::user(content.clone()))
            .await
        {
            send_direct(&self.handle, &store_error_frame(&err));
            return;
        }

        send_direct(
            &self.handle,
            &OutboundFrame::Ack {
                id: id.unwrap_or_else(|| Uuid::now_v7().to_string()),
                conversation_id: Some(conversation_id),
            },
        );
        send_direct(
            &self.handle,
            &activity(Some(conversation_id), ActivityKind::Typing, true),
        );

        let ctx = self.ctx.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let token = handle.cancellation_token();
            tokio::select! {
                () = token.cancelled() => {}
                () = answer_chat(&ctx, &handle, conversation_id, &content, filter.as_ref()) => {}
            }
        });
    }

    fn on_search(&self, frame: SearchFrame) {
        let SearchFrame {
            id,
            content,
            filter,
        } = frame;
        send_direct(
            &self.handle,
            &OutboundFrame::Ack {
                id: id.clone().unwrap_or_else(|| Uuid::now_v7().to_string()),
                conversation_id: None,
            },
        );
        send_direct(&self.handle, &activity(None, ActivityKind::Searching, true));

        let responder = self.ctx.responder.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let token = handle.cancellation_token();
            tokio::select! {
                () = token.cancelled() => {}
                () = answer_search(responder.as_ref(), &handle, id, &content, filter.as_ref()) => {}
            }
        });
    }
}

async fn answer_chat(
    ctx: &SessionContext,
    handle: &ConnectionHandle,
    conversation_id: Uuid,
    prompt: &str,
    filter: Option<&Value>,
) {
    let frame = match ctx.responder.respond(prompt, filter).await {
        Ok(reply) => {
            let mut message = NewMessage::assistant(reply.summary);
            if !reply.results.is_empty() {
                message
                    .metadata
                    .insert("results".to_string(), Value::Array(reply.results.clone()));
            }
            match ctx
                .store
                .send_message(conversation_id, handle.user_id(), message)
                .await
            {
                Ok(stored) => OutboundFrame::Assistant {
                    conversation_id,
                    message_id: stored.id,
                    content: stored.content,
                    results: (!reply.results.is_empty()).then_some(reply.results),
                },
                Err(err) => store_error_frame(&err),
            }
        }
        Err(err) => {
            warn!(connection_id = %handle.id(), error = %err, "responder failed");
            OutboundFrame::error(ErrorCode::Unavailable, "responder unavailable")
        }
    };
    send_direct(handle, &frame);
    send_direct(
        handle,
        &activity(Some(conversation_id), ActivityKind::Typing, false),
    );
}

async fn answer_search(
    responder: &dyn Responder,
    handle: &ConnectionHandle,
    id: Option<String>,
    query: &str,
    filter: Option<&Value>,
) {
    let frame = match responder.respond(query, filter).await {
        Ok(reply) => OutboundFrame::SearchResults {
            id,
            results: reply.results,
            summary: reply.summary,
        },
        Err(err) => {
            warn!(connection_id = %handle.id(), error = %err, "responder failed");
            OutboundFrame::error(ErrorCode::Unavailable, "responder unavailable")
        }
    };
    send_direct(handle, &frame);
    send_direct(handle, &activity(None, ActivityKind::Searching, false));
}

fn activity(conversation_id: Option<Uuid>, activity: ActivityKind, active: bool) -> OutboundFrame {
    OutboundFrame::Typing {
        conversation_id,
        activity,
        active,
    }
}

/// Queue a frame for this connection only. A connection that cannot take it
/// is closed.
fn send_direct(handle: &ConnectionHandle, frame: &OutboundFrame) {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            warn!(connection_id = %handle.id(), error = %err, "failed to serialize frame");
            return;
        }
    };
    if let Err(failure) = handle.try_send(Outbound::Frame(text.into())) {
        counter!("parley_hub_dropped_frames_total").increment(1);
        debug!(connection_id = %handle.id(), ?failure, kind = frame.kind(), "direct frame not queued");
        handle.close(close_code::AGAIN, "outbound queue overflow");
    }
}

fn store_error_frame(err: &StoreError) -> OutboundFrame {
    match err {
        StoreError::NotFound => OutboundFrame::error(ErrorCode::NotFound, "conversation not found"),
        StoreError::Validation(reason) => {
            OutboundFrame::error(ErrorCode::ValidationFailed, reason.clone())
        }
        err if err.is_retryable() => {
            OutboundFrame::error(ErrorCode::Unavailable, "storage temporarily unavailable")
        }
        err => {
            warn!(error = %err, "store operation failed");
            OutboundFrame::error(ErrorCode::Internal, "internal error")
        }
    }
}

fn title_from(prompt: &str) -> String {
    let words = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    words.chars().take(TITLE_CHARS).collect()
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    }))
}

async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Outbound>,
    handle: Arc<ConnectionHandle>,
    ping_every: Duration,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: fmt::Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = handle.cancelled() => {
                flush(&mut sink, &mut outbound).await;
                break;
            }
            item = outbound.recv() => match item {
                Some(Outbound::Frame(text)) => {
                    if let Err(err) = sink.send(Message::Text(text.to_string().into())).await {
                        debug!(connection_id = %handle.id(), error = %err, "socket write failed");
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = sink.send(close_message(code, reason)).await;
                    break;
                }
                None => break,
            },
            _ = ping.tick() => {
                if let Err(err) = sink.send(Message::Ping(Bytes::new())).await {
                    debug!(connection_id = %handle.id(), error = %err, "ping failed");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    handle.cancellation_token().cancel();
}

/// Best-effort delivery of whatever was queued before cancellation, up to
/// and including a close frame.
async fn flush<Si>(sink: &mut Si, outbound: &mut mpsc::Receiver<Outbound>)
where
    Si: Sink<Message> + Unpin,
{
    let drain = async {
        while let Ok(item) = outbound.try_recv() {
            let message = match item {
                Outbound::Frame(text) => Message::Text(text.to_string().into()),
                Outbound::Close { code, reason } => {
                    let _ = sink.send(close_message(code, reason)).await;
                    return;
                }
            };
            if sink.send(message).await.is_err() {
                return;
            }
        }
    };
    let _ = tokio::time::timeout(CLOSE_GRACE, drain).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_are_trimmed_and_bounded() {
        assert_eq!(title_from("  plan   my\ttrip  "), "plan my trip");
        let long = "word ".repeat(40);
        assert_eq!(title_from(&long).chars().count(), TITLE_CHARS);
    }

    #[test]
    fn store_errors_map_to_wire_codes() {
        let code = |err: StoreError| match store_error_frame(&err) {
            OutboundFrame::Error {
                code, retryable, ..
            } => (code, retryable),
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(code(StoreError::NotFound), (ErrorCode::NotFound, false));
        assert_eq!(
            code(StoreError::Validation("empty".into())),
            (ErrorCode::ValidationFailed, false)
        );
        assert_eq!(
            code(StoreError::Unavailable("down".into())),
            (ErrorCode::Unavailable, true)
        );
        assert_eq!(
            code(StoreError::Corrupt("bad role".into())),
            (ErrorCode::Internal, false)
        );
    }

    #[test]
    fn close_frames_carry_code_and_reason() {
        match close_message(close_code::SIZE, "frame too large") {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1009);
                assert_eq!(frame.reason.as_str(), "frame too large");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
