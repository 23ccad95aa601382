//! Publish/subscribe transport carrying deliveries between hub instances.

pub mod local;
pub mod redis;

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use local::LocalFabric;
pub use self::redis::RedisFabric;

/// Stream of raw payloads published on one topic.
pub type Subscription = BoxStream<'static, String>;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("redis fabric error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("fabric payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("fabric is shut down")]
    Closed,
}

#[async_trait]
pub trait FanoutFabric: Send + Sync + Debug {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), FabricError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, FabricError>;

    /// False while cross-instance delivery is degraded.
    fn is_healthy(&self) -> bool;
}
