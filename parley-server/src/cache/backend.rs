use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;

use super::CacheError;

/// Raw key-value operations the cache manager needs from a store.
///
/// Values are opaque bytes; expiry, locking and list trimming are delegated to
/// the backend so that they stay atomic per key.
#[async_trait]
pub trait CacheBackend: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Returns how many of `keys` existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Set `key` to `token` only if it is absent.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Delete `key` only if it still holds `token`.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError>;

    /// One bounded step of a glob scan. `None` as the returned cursor ends the scan.
    async fn scan(
        &self,
        pattern: &str,
        cursor: Option<String>,
        count: usize,
    ) -> Result<(Option<String>, Vec<String>), CacheError>;

    /// Prepend to a list, keep only the first `cap` entries and refresh its TTL.
    async fn push_capped(
        &self,
        key: &str,
        value: Vec<u8>,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Atomically replace a list with `values` (newest first), but only when
    /// the list is absent or its head already equals `values[0]`. A list whose
    /// head differs has seen pushes the caller's snapshot does not include and
    /// is left alone. Returns whether the list was written.
    async fn refill_list(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Up to `count` list entries, most recently pushed first.
    async fn range(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    /// Drop expired entries that the store does not reclaim on its own.
    /// Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}
