use std::{
    fmt,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{FabricError, FanoutFabric, LocalFabric, Subscription};

const RECONNECT_INITIAL: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

/// Redis pub/sub fabric.
///
/// Publish failures fall back to in-process delivery and mark the fabric
/// unhealthy until the next successful round trip. Subscribers reconnect with
/// exponential backoff and also receive the local fallback channel.
pub struct RedisFabric {
    client: redis::Client,
    manager: ConnectionManager,
    prefix: String,
    fallback: LocalFabric,
    capacity: usize,
    publish_ok: Arc<AtomicBool>,
    subscribe_ok: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl fmt::Debug for RedisFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisFabric")
            .field("prefix", &self.prefix)
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

impl RedisFabric {
    /// Connect the publishing side. Subscriptions open their own connections.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        local_capacity: usize,
        shutdown: CancellationToken,
    ) -> Result<Self, FabricError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        info!("fan-out fabric connected to redis");
        Ok(Self {
            client,
            manager,
            prefix: prefix.into(),
            fallback: LocalFabric::new(local_capacity),
            capacity: local_capacity.max(1),
            publish_ok: Arc::new(AtomicBool::new(true)),
            subscribe_ok: Arc::new(AtomicBool::new(true)),
            shutdown,
        })
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}{topic}", self.prefix)
    }
}

#[async_trait]
impl FanoutFabric for RedisFabric {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), FabricError> {
        let mut conn = self.manager.clone();
        let outcome = redis::cmd("PUBLISH")
            .arg(self.channel(topic))
            .arg(&payload)
            .query_async::<i64>(&mut conn)
            .await;

        match outcome {
            Ok(_) => {
                self.publish_ok.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                if self.publish_ok.swap(false, Ordering::Relaxed) {
                    warn!(topic, error = %err, "redis publish failed; delivering locally only");
                }
                metrics::counter!("parley_fabric_fallback_publishes_total").increment(1);
                self.fallback.publish(topic, payload).await
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, FabricError> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        tokio::spawn(pump(
            self.client.clone(),
            self.channel(topic),
            sender,
            Arc::clone(&self.subscribe_ok),
            self.shutdown.clone(),
        ));

        let local = self.fallback.subscribe(topic).await?;
        Ok(futures::stream::select(ReceiverStream::new(receiver), local).boxed())
    }

    fn is_healthy(&self) -> bool {
        self.publish_ok.load(Ordering::Relaxed) && self.subscribe_ok.load(Ordering::Relaxed)
    }
}

/// Forward one Redis channel into `sender`, reconnecting until shutdown or
/// until the subscriber goes away.
async fn pump(
    client: redis::Client,
    channel: String,
    sender: mpsc::Sender<String>,
    healthy: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut backoff = RECONNECT_INITIAL;
    loop {
        let attempt = async {
            let mut pubsub = client.get_async_pubsub().await?;
            pubsub.subscribe(&channel).await?;
            Ok::<_, redis::RedisError>(pubsub)
        };

        match attempt.await {
            Ok(mut pubsub) => {
                healthy.store(true, Ordering::Relaxed);
                backoff = RECONNECT_INITIAL;
                info!(channel, "subscribed to fan-out channel");

                let mut messages = pin!(pubsub.on_message());
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        message = messages.next() => {
                            let Some(message) = message else { break };
                            match message.get_payload::<String>() {
                                Ok(payload) => {
                                    if sender.send(payload).await.is_err() {
                                        return;
                                    }
                                }
                                Err(err) => warn!(channel, error = %err, "dropping undecodable fabric payload"),
                            }
                        }
                    }
                }
                warn!(channel, "fan-out subscription closed; reconnecting");
            }
            Err(err) => {
                warn!(channel, error = %err, ?backoff, "fan-out subscribe failed");
            }
        }

        healthy.store(false, Ordering::Relaxed);
        if sender.is_closed() {
            return;
        }
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}
