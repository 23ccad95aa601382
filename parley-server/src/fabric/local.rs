use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::{trace, warn};

use super::{FabricError, FanoutFabric, Subscription};

/// In-process fabric over tokio broadcast channels. Single instance only.
#[derive(Debug)]
pub struct LocalFabric {
    topics: RwLock<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl LocalFabric {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        if let Some(sender) = self.topics.read().await.get(topic) {
            return sender.clone();
        }
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl FanoutFabric for LocalFabric {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), FabricError> {
        let receivers = self.sender(topic).await.send(payload).unwrap_or(0);
        trace!(topic, receivers, "published locally");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, FabricError> {
        let receiver = self.sender(topic).await.subscribe();
        let topic = topic.to_string();
        Ok(BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let topic = topic.clone();
                async move {
                    match item {
                        Ok(payload) => Some(payload),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            warn!(topic, skipped, "local fabric subscriber lagged");
                            None
                        }
                    }
                }
            })
            .boxed())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
