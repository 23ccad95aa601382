use std::sync::Arc;

use shared::config::server::{CacheBackendKind, Config, FabricBackend, StoreBackend};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cache::{CacheBackend, CacheManager, InMemoryBackend, RedisBackend},
    db::bootstrap,
    fabric::{FanoutFabric, LocalFabric, RedisFabric},
    hub::{Hub, session::SessionContext},
    responder::{self, Responder},
    server::create_database_pool,
    store::{ConversationRepository, ConversationStore, InMemoryRepository, PgRepository},
};

/// Application state shared across all routes.
#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<Hub>,
    pub store: Arc<ConversationStore>,
    pub responder: Arc<dyn Responder>,
    pub shutdown: CancellationToken,
}

impl AppState {
    #[must_use]
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            hub: self.hub.clone(),
            store: self.store.clone(),
            responder: self.responder.clone(),
        }
    }

    /// Wire every backend named by `config` and start the hub.
    ///
    /// Background tasks stop when `shutdown` is cancelled.
    ///
    /// # Errors
    /// Fails if a configured backend is unreachable, the schema bootstrap
    /// fails, or the responder client cannot be built.
    pub async fn build(config: Arc<Config>, shutdown: CancellationToken) -> anyhow::Result<Arc<Self>> {
        let repository: Arc<dyn ConversationRepository> = match config.store.backend {
            StoreBackend::Postgres => {
                let pool = create_database_pool(&config.db).await?;
                bootstrap::ensure_liveness(&pool).await?;
                if config.db.run_bootstrap {
                    let applied = bootstrap::run(&pool, &config.db).await?;
                    info!(applied, "schema bootstrap finished");
                }
                bootstrap::ensure_readiness(&pool).await?;
                Arc::new(PgRepository::new(pool))
            }
            StoreBackend::Memory => {
                warn!("conversation store is in-memory; data is lost on restart");
                Arc::new(InMemoryRepository::new())
            }
        };

        let cache_backend: Arc<dyn CacheBackend> = match config.cache.backend {
            CacheBackendKind::Redis => Arc::new(RedisBackend::connect(&config.redis).await?),
            CacheBackendKind::Memory => Arc::new(InMemoryBackend::new()),
        };
        let cache = Arc::new(CacheManager::new(cache_backend, config.cache.clone()));
        // Stops with `shutdown`; nothing joins it.
        drop(cache.spawn_sweeper(shutdown.clone()));

        let fabric: Arc<dyn FanoutFabric> = match config.fabric.backend {
            FabricBackend::Redis => Arc::new(
                RedisFabric::connect(
                    &config.redis.url,
                    config.redis.key_prefix.clone(),
                    config.fabric.local_capacity,
                    shutdown.clone(),
                )
                .await?,
            ),
            FabricBackend::Local => Arc::new(LocalFabric::new(config.fabric.local_capacity)),
        };

        let store = Arc::new(ConversationStore::new(
            repository,
            cache,
            fabric.clone(),
            config.fabric.topic.clone(),
            config.store.clone(),
        ));
        let hub = Hub::start(config.hub.clone(), shutdown.clone());
        hub.spawn_relay(fabric, &config.fabric.topic).await?;
        let responder: Arc<dyn Responder> = Arc::from(responder::from_config(&config.responder)?);

        info!(%config, "application state ready");
        Ok(Arc::new(Self {
            config,
            hub,
            store,
            responder,
            shutdown,
        }))
    }

    /// [`AppState::build`] with every backend forced in-process.
    ///
    /// # Errors
    /// Fails only if the local fabric refuses the relay subscription.
    pub async fn in_memory(mut config: Config) -> anyhow::Result<Arc<Self>> {
        config.store.backend = StoreBackend::Memory;
        config.cache.backend = CacheBackendKind::Memory;
        config.fabric.backend = FabricBackend::Local;
        Self::build(Arc::new(config), CancellationToken::new()).await
    }
}
