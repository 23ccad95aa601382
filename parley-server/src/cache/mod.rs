//! Read-through cache with stampede protection and hot-key aware TTLs.
//!
//! Entries are wrapped in an envelope recording their original TTL, absolute
//! expiry and write time, so any instance can compute the remaining-TTL ratio
//! used for probabilistic early expiration.

pub mod backend;
pub mod hot_keys;
pub mod memory;
pub mod redis;

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use shared::config::server::CacheConfig;
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub use backend::CacheBackend;
pub use hot_keys::HotKeyTracker;
pub use memory::InMemoryBackend;
pub use self::redis::RedisBackend;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("cache serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache operation timed out")]
    Timeout,

    #[error("timed out waiting for the loader lock on '{key}'")]
    LockWaitTimeout { key: String },
}

/// Per-call overrides for [`CacheManager::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
}

impl SetOptions {
    #[must_use]
    pub const fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// Snapshot of cache effectiveness. Observability only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    v: T,
    /// Original TTL in milliseconds.
    ttl: u64,
    /// Absolute expiry, unix milliseconds.
    exp: i64,
    /// Write time, unix milliseconds.
    at: i64,
}

struct Hit<T> {
    value: T,
    written_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    /// A caller's read: counted, tracked for hotness, subject to early expiry.
    Request,
    /// An internal re-read while loading.
    Recheck,
}

/// Probability of treating a hit as a miss.
///
/// Zero while `remaining / original` is at or above `ratio`, then rising along
/// a cubic curve to one as the remaining TTL reaches zero.
#[must_use]
pub fn early_expiry_probability(remaining: Duration, original: Duration, ratio: f64) -> f64 {
    if original.is_zero() || ratio <= 0.0 {
        return 0.0;
    }
    let fraction = (remaining.as_secs_f64() / original.as_secs_f64()).clamp(0.0, 1.0);
    if fraction >= ratio {
        0.0
    } else {
        ((ratio - fraction) / ratio).powi(3)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}

#[derive(Debug)]
pub struct CacheManager {
    backend: Arc<dyn CacheBackend>,
    hot_keys: Arc<HotKeyTracker>,
    config: CacheConfig,
    counters: Counters,
}

impl CacheManager {
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        let hot_keys = Arc::new(HotKeyTracker::new(
            Duration::from_secs(config.hot_decay_interval_seconds),
            Duration::from_secs(config.hot_evict_after_seconds),
        ));
        Self {
            backend,
            hot_keys,
            config,
            counters: Counters::default(),
        }
    }

    /// Manager over a fresh in-process backend.
    #[must_use]
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), config)
    }

    /// One maintenance pass: decay and evict hot-key counters, then reclaim
    /// expired backend entries. Returns `(evicted counters, purged entries)`.
    pub async fn sweep(&self) -> (usize, usize) {
        let evicted = self.hot_keys.sweep().await;
        let purged = match self.timed(self.backend.purge_expired()).await {
            Ok(purged) => purged,
            Err(err) => {
                self.record_error();
                warn!(error = %err, "failed to purge expired cache entries");
                0
            }
        };
        (evicted, purged)
    }

    /// Run [`Self::sweep`] every `sweep_interval_seconds` until `shutdown` fires.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sweep_interval_seconds)
            .max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (evicted, purged) = cache.sweep().await;
                        if evicted > 0 || purged > 0 {
                            debug!(evicted, purged, "cache sweep");
                        }
                    }
                    () = shutdown.cancelled() => {
                        debug!("cache sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn hot_keys(&self) -> &Arc<HotKeyTracker> {
        &self.hot_keys
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let errors = self.counters.errors.load(Ordering::Relaxed);
        let total = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        CacheStats {
            hits,
            misses,
            errors,
            hit_rate,
        }
    }

    /// Liveness of the underlying backend.
    ///
    /// # Errors
    /// Returns the backend failure.
    pub async fn ping(&self) -> Result<(), CacheError> {
        self.timed(self.backend.ping()).await
    }

    /// Cached value for `key`, or `None` on miss.
    ///
    /// Backend failures are counted and degrade to a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.lookup::<T>(key, Lookup::Request).await {
            Ok(hit) => hit.map(|hit| hit.value),
            Err(err) => {
                warn!(key, error = %err, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Store `value` under `key` with a hotness-adjusted TTL.
    ///
    /// # Errors
    /// Returns an error if the value cannot be serialized or the backend fails.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<(), CacheError> {
        let ttl = self.effective_ttl(key, options.ttl).await;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let at = now_millis();
        let envelope = Envelope {
            v: value,
            ttl: ttl_ms,
            exp: at.saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX)),
            at,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        self.timed(self.backend.set(key, bytes, ttl))
            .await
            .inspect_err(|_| self.record_error())
    }

    /// Read-through with at most one concurrent `loader` per key across every
    /// instance sharing the backend.
    ///
    /// On a miss the caller takes `lock:<key>`; callers finding it held back off
    /// and re-read until the holder has written the value or the wait budget is
    /// spent. The lock holder re-reads once more before loading. When the
    /// backend itself is unavailable the loader runs directly.
    ///
    /// # Errors
    /// Returns the loader's error, or [`CacheError::LockWaitTimeout`] converted
    /// into `E` when no peer produced a value in time.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        options: SetOptions,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let missed_at = now_millis();
        match self.lookup::<T>(key, Lookup::Request).await {
            Ok(Some(hit)) => return Ok(hit.value),
            Ok(None) => {}
            Err(err) => {
                warn!(key, error = %err, "cache unavailable; loading directly");
                return loader().await;
            }
        }

        let lock = lock_key(key);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.config.lock_wait();
        let mut backoff = Duration::from_millis(self.config.lock_backoff_initial_ms.max(1));
        let max_backoff = Duration::from_millis(self.config.lock_backoff_max_ms).max(backoff);

        loop {
            match self
                .timed(self.backend.try_lock(&lock, &token, self.config.lock_ttl()))
                .await
            {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    self.record_error();
                    warn!(key, error = %err, "loader lock unavailable; loading directly");
                    return loader().await;
                }
            }

            if Instant::now() + backoff > deadline {
                counter!("parley_cache_lock_wait_timeouts_total").increment(1);
                return Err(CacheError::LockWaitTimeout {
                    key: key.to_string(),
                }
                .into());
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);

            if let Ok(Some(hit)) = self.lookup::<T>(key, Lookup::Recheck).await {
                return Ok(hit.value);
            }
        }

        let outcome = self.load_locked(key, missed_at, options, loader).await;

        match self.timed(self.backend.release_lock(&lock, &token)).await {
            Ok(true) => {}
            Ok(false) => warn!(key, "loader lock expired before release"),
            Err(err) => {
                self.record_error();
                warn!(key, error = %err, "failed to release loader lock");
            }
        }

        outcome
    }

    async fn load_locked<T, E, F, Fut>(
        &self,
        key: &str,
        missed_at: i64,
        options: SetOptions,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Ok(Some(hit)) = self.lookup::<T>(key, Lookup::Recheck).await
            && hit.written_at >= missed_at
        {
            debug!(key, "value loaded by a peer while acquiring the lock");
            return Ok(hit.value);
        }

        counter!("parley_cache_loads_total").increment(1);
        let value = loader().await?;
        if let Err(err) = self.set(key, &value, options).await {
            warn!(key, error = %err, "failed to store loaded value");
        }
        Ok(value)
    }

    /// Remove `keys`. Returns how many existed.
    ///
    /// # Errors
    /// Returns the backend failure.
    pub async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.timed(self.backend.delete(keys))
            .await
            .inspect_err(|_| self.record_error())
    }

    /// Delete every key matching a glob, one bounded scan batch at a time.
    ///
    /// # Errors
    /// Returns the first backend failure; keys deleted before it stay deleted.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut cursor = None;
        let mut deleted = 0;
        loop {
            let (next, keys) = self
                .timed(self.backend.scan(pattern, cursor, self.config.scan_batch))
                .await
                .inspect_err(|_| self.record_error())?;
            if !keys.is_empty() {
                deleted += self.delete(&keys).await?;
            }
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        debug!(pattern, deleted, "invalidated cache pattern");
        Ok(deleted)
    }

    /// Prepend `value` to a list capped at `cap` entries.
    ///
    /// # Errors
    /// Returns an error if serialization or the backend fails.
    pub async fn push_capped<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.timed(self.backend.push_capped(key, bytes, cap, ttl))
            .await
            .inspect_err(|_| self.record_error())
    }

    /// Rebuild a list from a snapshot, `values` newest first. Skipped when
    /// the stored list already holds a newer head than the snapshot.
    ///
    /// # Errors
    /// Returns an error if serialization or the backend fails.
    pub async fn refill_list<T: Serialize>(
        &self,
        key: &str,
        values: &[T],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let encoded = values
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()?;
        self.timed(self.backend.refill_list(key, encoded, ttl))
            .await
            .inspect_err(|_| self.record_error())
    }

    /// Up to `count` list entries, newest first. Undecodable entries are skipped.
    ///
    /// # Errors
    /// Returns the backend failure.
    pub async fn range<T: DeserializeOwned>(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<T>, CacheError> {
        let raw = self
            .timed(self.backend.range(key, count))
            .await
            .inspect_err(|_| self.record_error())?;
        Ok(raw
            .iter()
            .filter_map(|bytes| match serde_json::from_slice(bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(key, error = %err, "skipping undecodable list entry");
                    None
                }
            })
            .collect())
    }

    async fn effective_ttl(&self, key: &str, requested: Option<Duration>) -> Duration {
        let default_ttl = self.config.default_ttl();
        let base = requested.unwrap_or(default_ttl);
        let rate = self.hot_keys.rate_per_minute(key).await;
        #[allow(clippy::cast_precision_loss)]
        let threshold = self.config.hot_threshold_per_minute.max(1) as f64;

        let ttl = if rate > threshold {
            let boost = default_ttl.mul_f64(rate / threshold);
            counter!("parley_cache_hot_key_boosts_total").increment(1);
            base.max(boost)
        } else {
            base
        };
        ttl.min(self.config.max_ttl())
    }

    async fn lookup<T: DeserializeOwned>(
        &self,
        key: &str,
        mode: Lookup,
    ) -> Result<Option<Hit<T>>, CacheError> {
        if mode == Lookup::Request {
            self.hot_keys.record(key).await;
        }

        let raw = self
            .timed(self.backend.get(key))
            .await
            .inspect_err(|_| self.record_error())?;

        let Some(bytes) = raw else {
            if mode == Lookup::Request {
                self.record_miss();
            }
            return Ok(None);
        };

        let envelope: Envelope<T> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.record_error();
                warn!(key, error = %err, "discarding undecodable cache entry");
                if mode == Lookup::Request {
                    self.record_miss();
                }
                return Ok(None);
            }
        };

        if mode == Lookup::Request {
            let remaining =
                Duration::from_millis(u64::try_from(envelope.exp - now_millis()).unwrap_or(0));
            let original = Duration::from_millis(envelope.ttl);
            let probability =
                early_expiry_probability(remaining, original, self.config.early_expiry_ratio);
            if probability > 0.0 && rand::random::<f64>() < probability {
                counter!("parley_cache_early_expirations_total").increment(1);
                self.record_miss();
                return Ok(None);
            }
            self.record_hit();
        }

        Ok(Some(Hit {
            value: envelope.v,
            written_at: envelope.at,
        }))
    }

    async fn timed<T>(
        &self,
        operation: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.config.op_timeout(), operation)
            .await
            .map_err(|_| CacheError::Timeout)?
    }

    fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        counter!("parley_cache_hits_total").increment(1);
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        counter!("parley_cache_misses_total").increment(1);
    }

    fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        counter!("parley_cache_errors_total").increment(1);
    }
}
