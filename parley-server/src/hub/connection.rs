use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// WebSocket close codes used by the hub.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const AWAY: u16 = 1001;
    pub const INVALID: u16 = 1007;
    pub const SIZE: u16 = 1009;
    pub const ERROR: u16 = 1011;
    pub const AGAIN: u16 = 1013;
}

/// An item on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized frame, shared between every recipient of a broadcast.
    Frame(Arc<str>),
    Close { code: u16, reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Idle,
    Closing,
    Closed,
}

const STATE_ACTIVE: u8 = 0;
const STATE_IDLE: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Why a queued send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Full,
    Closed,
}

/// Registry-side view of one live connection.
///
/// The socket itself is owned by the connection's read and write tasks; the
/// handle only carries what the hub needs to route frames and to stop them.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    user_id: Uuid,
    outbound: mpsc::Sender<Outbound>,
    token: CancellationToken,
    state: AtomicU8,
    opened_at: Instant,
    /// Milliseconds after `opened_at` of the last inbound frame.
    last_seen_ms: AtomicU64,
}

impl ConnectionHandle {
    /// A handle plus the receiving end of its outbound queue.
    #[must_use]
    pub fn new(user_id: Uuid, queue_depth: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let handle = Arc::new(Self {
            id: Uuid::now_v7(),
            user_id,
            outbound: tx,
            token: CancellationToken::new(),
            state: AtomicU8::new(STATE_ACTIVE),
            opened_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        });
        (handle, rx)
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_ACTIVE => ConnectionState::Active,
            STATE_IDLE => ConnectionState::Idle,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Record inbound traffic; an idle connection becomes active again.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.opened_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen_ms.store(elapsed, Ordering::SeqCst);
        let _ = self.state.compare_exchange(
            STATE_IDLE,
            STATE_ACTIVE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    #[must_use]
    pub fn silent_for(&self, now: Instant) -> Duration {
        let last_seen = self.opened_at + Duration::from_millis(self.last_seen_ms.load(Ordering::SeqCst));
        now.saturating_duration_since(last_seen)
    }

    pub fn mark_idle(&self) -> bool {
        self.state
            .compare_exchange(STATE_ACTIVE, STATE_IDLE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Enqueue a frame without waiting.
    ///
    /// # Errors
    /// `Full` when the client is not draining its queue, `Closed` once the
    /// write task has gone.
    pub fn try_send(&self, item: Outbound) -> Result<(), SendFailure> {
        if self.token.is_cancelled() {
            return Err(SendFailure::Closed);
        }
        self.outbound.try_send(item).map_err(|err| match err {
            TrySendError::Full(_) => SendFailure::Full,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Start closing: queue a close frame if there is room, then cancel the
    /// connection's tasks. Returns false if closing had already begun.
    pub fn close(&self, code: u16, reason: &'static str) -> bool {
        let began = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state < STATE_CLOSING).then_some(STATE_CLOSING)
            })
            .is_ok();
        if !began {
            return false;
        }
        let _ = self.outbound.try_send(Outbound::Close { code, reason });
        self.token.cancel();
        true
    }

    pub fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.token.cancel();
    }
}
