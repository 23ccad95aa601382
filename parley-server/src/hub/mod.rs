//! Connection hub: registry of live sockets, per-user delivery and the
//! broadcast worker pool fed by the fan-out fabric.

pub mod connection;
pub mod rate_limit;
pub mod registry;
pub mod session;

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use metrics::{counter, gauge};
use shared::{
    config::server::HubConfig,
    models::{DeliveryEnvelope, DeliveryFrame, OutboundFrame},
};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::fabric::{FabricError, FanoutFabric};

pub use connection::{ConnectionHandle, ConnectionState, Outbound, SendFailure, close_code};
pub use rate_limit::{RateLimitOutcome, Strategy, TokenBucket};
pub use registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityScope {
    Global,
    User,
}

impl fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Global => "global",
            Self::User => "user",
        })
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("{scope} connection limit of {limit} reached")]
    Capacity { scope: CapacityScope, limit: usize },

    #[error("frame could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broadcast intake is closed")]
    Closed,
}

/// A freshly admitted connection and the receiving end of its queue.
#[derive(Debug)]
pub struct Registration {
    pub handle: Arc<ConnectionHandle>,
    pub outbound: mpsc::Receiver<Outbound>,
}

/// Where this hub publishes deliveries meant for its peers too.
#[derive(Debug)]
struct Uplink {
    fabric: Arc<dyn FanoutFabric>,
    topic: String,
}

#[derive(Debug)]
pub struct Hub {
    registry: Arc<Registry>,
    config: HubConfig,
    lanes: Vec<mpsc::Sender<DeliveryEnvelope>>,
    uplink: OnceLock<Uplink>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Build the hub and spawn its broadcast workers and idle reaper.
    #[must_use]
    pub fn start(config: HubConfig, shutdown: CancellationToken) -> Arc<Self> {
        let registry = Arc::new(Registry::new(
            config.max_connections,
            config.max_connections_per_user,
        ));

        let workers = config.broadcast_workers.max(1);
        let lane_depth = (config.intake_depth / workers).max(1);
        let mut lanes = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(lane_depth);
            lanes.push(tx);
            tokio::spawn(broadcast_worker(
                worker,
                rx,
                registry.clone(),
                shutdown.clone(),
            ));
        }
        info!(workers, lane_depth, "connection hub started");

        let hub = Arc::new(Self {
            registry,
            config,
            lanes,
            uplink: OnceLock::new(),
            shutdown,
        });
        hub.spawn_reaper();
        hub
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Admit a connection for `user_id` if both ceilings allow it.
    pub async fn register(&self, user_id: Uuid) -> Result<Registration, HubError> {
        let (handle, outbound) = ConnectionHandle::new(user_id, self.config.outbound_queue);
        if let Err(err) = self.registry.insert(handle.clone()).await {
            counter!("parley_hub_rejected_total").increment(1);
            warn!(user_id = %user_id, error = %err, "connection rejected");
            return Err(err);
        }

        counter!("parley_hub_registrations_total").increment(1);
        gauge!("parley_hub_connections").increment(1.0);
        debug!(connection_id = %handle.id(), user_id = %user_id, "connection registered");
        Ok(Registration { handle, outbound })
    }

    /// Remove a connection and stop its tasks. Safe to call more than once.
    pub async fn unregister(&self, connection_id: Uuid) -> bool {
        unregister(&self.registry, connection_id).await
    }

    /// Serialize `frame` once and queue it on every connection of `user_id`.
    ///
    /// Returns the number of connections that accepted the frame. Never waits
    /// on a slow client.
    pub async fn send(&self, user_id: Uuid, frame: &OutboundFrame) -> Result<usize, HubError> {
        let text: Arc<str> = serde_json::to_string(frame)?.into();
        Ok(deliver(&self.registry, user_id, text, None).await)
    }

    /// Queue an already serialized frame, skipping connection `except`.
    pub async fn send_raw(&self, user_id: Uuid, text: Arc<str>, except: Option<Uuid>) -> usize {
        deliver(&self.registry, user_id, text, except).await
    }

    /// Pass client `text` unchanged to every other connection of `user_id`,
    /// including those on peer instances once the relay is attached.
    pub async fn relay_verbatim(&self, user_id: Uuid, text: &str, origin: Uuid) {
        let Some(uplink) = self.uplink.get() else {
            self.send_raw(user_id, Arc::from(text), Some(origin)).await;
            return;
        };
        let envelope = DeliveryEnvelope {
            user_id,
            conversation_id: None,
            origin: Some(origin),
            frame: DeliveryFrame::Verbatim(text.to_string()),
        };
        let published = match serde_json::to_string(&envelope) {
            Ok(payload) => uplink
                .fabric
                .publish(&uplink.topic, payload)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        if let Err(err) = published {
            counter!("parley_fabric_publish_failures_total").increment(1);
            warn!(%user_id, error = %err, "relay publish failed; delivering locally only");
            self.send_raw(user_id, Arc::from(text), Some(origin)).await;
        }
    }

    /// Hand an envelope to the worker that owns its user's lane.
    ///
    /// Waits while that lane is full; this is where a burst of deliveries
    /// pushes back on the fabric subscription.
    pub async fn dispatch(&self, envelope: DeliveryEnvelope) -> Result<(), HubError> {
        let lane = lane_for(envelope.user_id, self.lanes.len());
        self.lanes[lane]
            .send(envelope)
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    pub async fn user_connection_count(&self, user_id: Uuid) -> usize {
        self.registry.user_len(user_id).await
    }

    /// One reaper pass: mark silent connections idle and close the ones past
    /// the idle timeout. Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let idle_after = self.config.idle_after();
        let idle_timeout = self.config.idle_timeout();

        let mut closed = 0;
        for handle in self.registry.snapshot().await {
            let silent = handle.silent_for(now);
            if silent >= idle_timeout {
                handle.close(close_code::AWAY, "idle timeout");
                if unregister(&self.registry, handle.id()).await {
                    closed += 1;
                }
            } else if silent >= idle_after && handle.mark_idle() {
                debug!(connection_id = %handle.id(), "connection idle");
            }
        }
        if closed > 0 {
            counter!("parley_hub_idle_closed_total").increment(closed as u64);
            info!(closed, "reaped idle connections");
        }
        closed
    }

    /// Subscribe to `topic` and feed every decoded envelope into the
    /// broadcast intake until shutdown.
    pub async fn spawn_relay(
        self: &Arc<Self>,
        fabric: Arc<dyn FanoutFabric>,
        topic: &str,
    ) -> Result<JoinHandle<()>, FabricError> {
        let mut subscription = fabric.subscribe(topic).await?;
        if self
            .uplink
            .set(Uplink {
                fabric: fabric.clone(),
                topic: topic.to_string(),
            })
            .is_err()
        {
            warn!(topic, "hub relay already attached; keeping the first uplink");
        }
        let hub = Arc::clone(self);
        let topic = topic.to_string();
        info!(topic = %topic, "fabric relay subscribed");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = hub.shutdown.cancelled() => break,
                    payload = subscription.next() => {
                        let Some(payload) = payload else {
                            warn!(topic = %topic, "fabric subscription ended");
                            break;
                        };
                        match serde_json::from_str::<DeliveryEnvelope>(&payload) {
                            Ok(envelope) => {
                                if hub.dispatch(envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                counter!("parley_hub_undecodable_total").increment(1);
                                warn!(error = %err, "dropping undecodable fabric payload");
                            }
                        }
                    }
                }
            }
        }))
    }

    /// Close every connection with "going away".
    pub async fn close_all(&self) {
        for handle in self.registry.snapshot().await {
            handle.close(close_code::AWAY, "server shutting down");
            unregister(&self.registry, handle.id()).await;
        }
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.reap_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = hub.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        hub.reap_idle().await;
                    }
                }
            }
        });
    }
}

fn lane_for(user_id: Uuid, lanes: usize) -> usize {
    (user_id.as_u128() % lanes.max(1) as u128) as usize
}

async fn unregister(registry: &Registry, connection_id: Uuid) -> bool {
    let Some(handle) = registry.remove(connection_id).await else {
        return false;
    };
    handle.mark_closed();
    gauge!("parley_hub_connections").decrement(1.0);
    debug!(connection_id = %connection_id, user_id = %handle.user_id(), "connection unregistered");
    true
}

async fn deliver(registry: &Registry, user_id: Uuid, text: Arc<str>, except: Option<Uuid>) -> usize {
    let targets = registry.for_user(user_id).await;

    let mut delivered = 0;
    let mut broken = Vec::new();
    for handle in targets {
        if Some(handle.id()) == except {
            continue;
        }
        match handle.try_send(Outbound::Frame(text.clone())) {
            Ok(()) => delivered += 1,
            Err(failure) => {
                counter!("parley_hub_dropped_frames_total").increment(1);
                warn!(
                    connection_id = %handle.id(),
                    user_id = %user_id,
                    ?failure,
                    "outbound queue unusable; dropping connection"
                );
                broken.push(handle);
            }
        }
    }

    for handle in broken {
        handle.close(close_code::AGAIN, "outbound queue overflow");
        unregister(registry, handle.id()).await;
    }
    delivered
}

async fn broadcast_worker(
    worker: usize,
    mut lane: mpsc::Receiver<DeliveryEnvelope>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            () = shutdown.cancelled() => break,
            envelope = lane.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let text: Arc<str> = match envelope.frame {
            DeliveryFrame::Typed(frame) => match serde_json::to_string(&frame) {
                Ok(text) => text.into(),
                Err(err) => {
                    error!(worker, error = %err, "failed to serialize delivery");
                    continue;
                }
            },
            DeliveryFrame::Verbatim(text) => text.into(),
        };
        let delivered = deliver(&registry, envelope.user_id, text, envelope.origin).await;
        counter!("parley_hub_deliveries_total").increment(delivered as u64);
    }
    debug!(worker, "broadcast worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fabric::LocalFabric;
    use shared::models::ErrorCode;

    fn config() -> HubConfig {
        HubConfig {
            max_connections: 100,
            max_connections_per_user: 10,
            outbound_queue: 4,
            reap_interval_seconds: 3_600,
            ..HubConfig::default()
        }
    }

    fn text(item: Option<Outbound>) -> String {
        match item {
            Some(Outbound::Frame(text)) => text.to_string(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_reaches_every_connection_of_the_user_only() {
        let hub = Hub::start(config(), CancellationToken::new());
        let alice = Uuid::new_v4();
        let mut first = hub.register(alice).await.unwrap();
        let mut second = hub.register(alice).await.unwrap();
        let mut other = hub.register(Uuid::new_v4()).await.unwrap();

        let frame = OutboundFrame::error(ErrorCode::NotFound, "gone");
        assert_eq!(hub.send(alice, &frame).await.unwrap(), 2);

        let expected = serde_json::to_string(&frame).unwrap();
        assert_eq!(text(first.outbound.recv().await), expected);
        assert_eq!(text(second.outbound.recv().await), expected);
        assert!(other.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflowing_connection_is_dropped_without_blocking() {
        let hub = Hub::start(config(), CancellationToken::new());
        let user = Uuid::new_v4();
        let stalled = hub.register(user).await.unwrap();
        let frame = OutboundFrame::System {
            message: "tick".into(),
            connection_id: None,
        };

        for _ in 0..4 {
            assert_eq!(hub.send(user, &frame).await.unwrap(), 1);
        }
        assert_eq!(hub.send(user, &frame).await.unwrap(), 0);
        assert_eq!(hub.connection_count().await, 0);
        assert!(stalled.handle.cancellation_token().is_cancelled());
        assert_eq!(stalled.handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn send_raw_skips_the_origin() {
        let hub = Hub::start(config(), CancellationToken::new());
        let user = Uuid::new_v4();
        let mut origin = hub.register(user).await.unwrap();
        let mut peer = hub.register(user).await.unwrap();

        let delivered = hub
            .send_raw(user, Arc::from(r#"{"type":"typing"}"#), Some(origin.handle.id()))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(text(peer.outbound.recv().await), r#"{"type":"typing"}"#);
        assert!(origin.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = Hub::start(config(), CancellationToken::new());
        let registration = hub.register(Uuid::new_v4()).await.unwrap();
        let id = registration.handle.id();
        assert!(hub.unregister(id).await);
        assert!(!hub.unregister(id).await);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_idles_then_closes() {
        let hub = Hub::start(config(), CancellationToken::new());
        let quiet = hub.register(Uuid::new_v4()).await.unwrap();
        let chatty = hub.register(Uuid::new_v4()).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        chatty.handle.touch();
        assert_eq!(hub.reap_idle().await, 0);
        assert_eq!(quiet.handle.state(), ConnectionState::Idle);
        assert_eq!(chatty.handle.state(), ConnectionState::Active);

        tokio::time::advance(Duration::from_secs(240)).await;
        assert_eq!(hub.reap_idle().await, 1);
        assert_eq!(hub.connection_count().await, 1);
        assert_eq!(quiet.handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn relay_delivers_in_publish_order() {
        let hub = Hub::start(config(), CancellationToken::new());
        let fabric: Arc<dyn FanoutFabric> = Arc::new(LocalFabric::default());
        let _relay = hub.spawn_relay(fabric.clone(), "deliveries").await.unwrap();

        let user = Uuid::new_v4();
        let mut connection = hub.register(user).await.unwrap();
        for index in 0..3 {
            let envelope = DeliveryEnvelope {
                user_id: user,
                conversation_id: None,
                origin: None,
                frame: OutboundFrame::System {
                    message: format!("m{index}"),
                    connection_id: None,
                }
                .into(),
            };
            fabric
                .publish("deliveries", serde_json::to_string(&envelope).unwrap())
                .await
                .unwrap();
        }

        for index in 0..3 {
            let received = tokio::time::timeout(Duration::from_secs(1), connection.outbound.recv())
                .await
                .unwrap();
            assert!(text(received).contains(&format!("\"m{index}\"")));
        }
    }

    #[tokio::test]
    async fn verbatim_relay_reaches_siblings_on_peer_hubs() {
        let fabric: Arc<dyn FanoutFabric> = Arc::new(LocalFabric::default());
        let here = Hub::start(config(), CancellationToken::new());
        let there = Hub::start(config(), CancellationToken::new());
        let _relay_here = here.spawn_relay(fabric.clone(), "deliveries").await.unwrap();
        let _relay_there = there.spawn_relay(fabric.clone(), "deliveries").await.unwrap();

        let user = Uuid::new_v4();
        let mut origin = here.register(user).await.unwrap();
        let mut local_sibling = here.register(user).await.unwrap();
        let mut remote_sibling = there.register(user).await.unwrap();

        let typing = r#"{"type":"typing","conversation_id":null}"#;
        here.relay_verbatim(user, typing, origin.handle.id()).await;

        for sibling in [&mut local_sibling, &mut remote_sibling] {
            let received = tokio::time::timeout(Duration::from_secs(1), sibling.outbound.recv())
                .await
                .unwrap();
            assert_eq!(text(received), typing);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(origin.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn verbatim_relay_without_uplink_stays_local() {
        let hub = Hub::start(config(), CancellationToken::new());
        let user = Uuid::new_v4();
        let mut origin = hub.register(user).await.unwrap();
        let mut sibling = hub.register(user).await.unwrap();

        hub.relay_verbatim(user, r#"{"type":"typing"}"#, origin.handle.id()).await;
        assert_eq!(text(sibling.outbound.recv().await), r#"{"type":"typing"}"#);
        assert!(origin.outbound.try_recv().is_err());
    }

    #[test]
    fn lanes_are_stable_per_user() {
        let user = Uuid::new_v4();
        assert_eq!(lane_for(user, 4), lane_for(user, 4));
        assert!(lane_for(user, 4) < 4);
        assert_eq!(lane_for(user, 0), 0);
    }
}
