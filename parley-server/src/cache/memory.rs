use std::{
    collections::{BTreeMap, VecDeque},
    ops::Bound,
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use tokio::{sync::RwLock, time::Instant};

use super::{CacheError, backend::CacheBackend};

#[derive(Debug)]
enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Instant,
}

impl Slot {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Process-local cache backend for single-node deployments and tests.
///
/// Expired slots are ignored on read and reclaimed by the cache sweeper or
/// when a scan starts.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    slots: RwLock<BTreeMap<String, Slot>>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }
}

/// Translate a Redis-style glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, CacheError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|err| CacheError::Backend(err.to_string()))
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let guard = self.slots.read().await;
        Ok(guard.get(key).and_then(|slot| match &slot.value {
            Value::Bytes(bytes) if slot.is_live(now) => Some(bytes.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.slots
            .write()
            .await
            .insert(key.to_string(), Slot::new(Value::Bytes(value), ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut guard = self.slots.write().await;
        let removed = keys
            .iter()
            .filter_map(|key| guard.remove(key))
            .filter(|slot| slot.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut guard = self.slots.write().await;
        if guard.get(key).is_some_and(|slot| slot.is_live(now)) {
            return Ok(false);
        }
        guard.insert(
            key.to_string(),
            Slot::new(Value::Bytes(token.as_bytes().to_vec()), ttl),
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        let mut guard = self.slots.write().await;
        let held = matches!(
            guard.get(key).map(|slot| &slot.value),
            Some(Value::Bytes(bytes)) if bytes.as_slice() == token.as_bytes()
        );
        if held {
            guard.remove(key);
        }
        Ok(held)
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: Option<String>,
        count: usize,
    ) -> Result<(Option<String>, Vec<String>), CacheError> {
        let matcher = glob_to_regex(pattern)?;
        if cursor.is_none() {
            self.purge_expired().await?;
        }

        let now = Instant::now();
        let guard = self.slots.read().await;
        let lower = cursor.map_or(Bound::Unbounded, Bound::Excluded);
        let keys: Vec<String> = guard
            .range::<String, _>((lower, Bound::Unbounded))
            .filter(|(key, slot)| slot.is_live(now) && matcher.is_match(key))
            .map(|(key, _)| key.clone())
            .take(count.max(1))
            .collect();

        let next = if keys.len() < count.max(1) {
            None
        } else {
            keys.last().cloned()
        };
        Ok((next, keys))
    }

    async fn push_capped(
        &self,
        key: &str,
        value: Vec<u8>,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut guard = self.slots.write().await;
        let slot = guard
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::List(VecDeque::new()), ttl));
        if !slot.is_live(now) || !matches!(slot.value, Value::List(_)) {
            slot.value = Value::List(VecDeque::new());
        }
        if let Value::List(list) = &mut slot.value {
            list.push_front(value);
            list.truncate(cap);
        }
        slot.expires_at = now + ttl;
        Ok(())
    }

    async fn refill_list(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let Some(newest) = values.first() else {
            return Ok(false);
        };
        let now = Instant::now();
        let mut guard = self.slots.write().await;
        let diverged = match guard.get(key) {
            Some(Slot {
                value: Value::List(list),
                expires_at,
            }) if now < *expires_at => list.front().is_some_and(|head| head != newest),
            _ => false,
        };
        if diverged {
            return Ok(false);
        }
        guard.insert(
            key.to_string(),
            Slot::new(Value::List(values.into_iter().collect()), ttl),
        );
        Ok(true)
    }

    async fn range(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let guard = self.slots.read().await;
        Ok(match guard.get(key) {
            Some(Slot {
                value: Value::List(list),
                expires_at,
            }) if now < *expires_at => list.iter().take(count).cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut guard = self.slots.write().await;
        let before = guard.len();
        guard.retain(|_, slot| slot.is_live(now));
        Ok(before - guard.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_like_redis() {
        let matcher = glob_to_regex("conv:abc*").unwrap();
        assert!(matcher.is_match("conv:abc"));
        assert!(matcher.is_match("conv:abc:recent"));
        assert!(!matcher.is_match("conv:abd"));

        let single = glob_to_regex("k?y.1").unwrap();
        assert!(single.is_match("key.1"));
        assert!(!single.is_match("key-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let backend = InMemoryBackend::new();
        backend
            .set("a", b"1".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(b"1".to_vec()));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(backend.get("a").await.unwrap(), None);
        assert_eq!(backend.len().await, 0);
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_token_checked() {
        let backend = InMemoryBackend::new();
        let ttl = Duration::from_secs(30);

        assert!(backend.try_lock("lock:k", "t1", ttl).await.unwrap());
        assert!(!backend.try_lock("lock:k", "t2", ttl).await.unwrap());
        assert!(!backend.release_lock("lock:k", "t2").await.unwrap());
        assert!(backend.release_lock("lock:k", "t1").await.unwrap());
        assert!(backend.try_lock("lock:k", "t2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn scan_walks_matching_keys_in_batches() {
        let backend = InMemoryBackend::new();
        let ttl = Duration::from_secs(60);
        for index in 0..5 {
            backend
                .set(&format!("conv:1:{index}"), vec![], ttl)
                .await
                .unwrap();
        }
        backend.set("conv:2", vec![], ttl).await.unwrap();

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let (next, keys) = backend.scan("conv:1:*", cursor, 2).await.unwrap();
            assert!(keys.len() <= 2);
            seen.extend(keys);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|key| key.starts_with("conv:1:")));
    }

    #[tokio::test]
    async fn capped_list_keeps_newest_first() {
        let backend = InMemoryBackend::new();
        let ttl = Duration::from_secs(60);
        for value in 0u8..5 {
            backend.push_capped("recent", vec![value], 3, ttl).await.unwrap();
        }

        let items = backend.range("recent", 10).await.unwrap();
        assert_eq!(items, vec![vec![4], vec![3], vec![2]]);
        assert_eq!(backend.range("recent", 1).await.unwrap(), vec![vec![4]]);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_reclaims_expired_slots() {
        let backend = InMemoryBackend::new();
        backend
            .set("short", b"1".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        backend
            .push_capped("list", vec![1], 3, Duration::from_secs(1))
            .await
            .unwrap();
        backend
            .set("long", b"2".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.slots.read().await.len(), 3);
        assert_eq!(backend.purge_expired().await.unwrap(), 2);
        assert_eq!(backend.slots.read().await.len(), 1);
        assert_eq!(backend.get("long").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn refill_yields_to_a_newer_head() {
        let backend = InMemoryBackend::new();
        let ttl = Duration::from_secs(60);

        assert!(backend.refill_list("recent", vec![vec![2], vec![1]], ttl).await.unwrap());
        assert_eq!(backend.range("recent", 10).await.unwrap(), vec![vec![2], vec![1]]);

        // Same head: the snapshot is current and may widen the list.
        assert!(backend
            .refill_list("recent", vec![vec![2], vec![1], vec![0]], ttl)
            .await
            .unwrap());
        assert_eq!(backend.range("recent", 10).await.unwrap().len(), 3);

        backend.push_capped("recent", vec![3], 5, ttl).await.unwrap();
        assert!(!backend.refill_list("recent", vec![vec![2], vec![1]], ttl).await.unwrap());
        assert_eq!(backend.range("recent", 1).await.unwrap(), vec![vec![3]]);

        assert!(!backend.refill_list("empty", Vec::new(), ttl).await.unwrap());
    }
}
