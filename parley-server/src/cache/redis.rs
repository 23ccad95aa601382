use std::{fmt, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use shared::config::server::RedisConfig;
use tracing::{error, info};

use super::{CacheError, backend::CacheBackend};

const RELEASE_LOCK: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const REFILL_LIST: &str = r#"
local head = redis.call("LINDEX", KEYS[1], 0)
if head and head ~= ARGV[2] then
    return 0
end
redis.call("DEL", KEYS[1])
redis.call("RPUSH", KEYS[1], unpack(ARGV, 2))
redis.call("PEXPIRE", KEYS[1], ARGV[1])
return 1
"#;

/// Cache backend on a shared Redis instance.
///
/// `ConnectionManager` reconnects on its own; every key is namespaced with the
/// configured prefix so several deployments can share one instance.
#[derive(Clone)]
pub struct RedisBackend {
    manager: ConnectionManager,
    prefix: String,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        info!(prefix = %config.key_prefix, "connecting cache backend to redis");
        let client = redis::Client::open(config.url.as_str())?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::from_manager(manager, config.key_prefix.clone()))
    }

    #[must_use]
    pub fn from_manager(manager: ConnectionManager, prefix: String) -> Self {
        Self { manager, prefix }
    }

    #[must_use]
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn logged(op: &'static str) -> impl FnOnce(redis::RedisError) -> CacheError {
    move |err| {
        error!(op, error = %err, "redis cache operation failed");
        CacheError::Redis(err)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.manager.clone();
        conn.get(self.key(key)).await.map_err(logged("GET"))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(logged("SET"))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let full: Vec<String> = keys.iter().map(|key| self.key(key)).collect();
        let mut conn = self.manager.clone();
        conn.del(full).await.map_err(logged("DEL"))
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(logged("SET NX"))?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let deleted: i64 = Script::new(RELEASE_LOCK)
            .key(self.key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(logged("EVAL release"))?;
        Ok(deleted == 1)
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: Option<String>,
        count: usize,
    ) -> Result<(Option<String>, Vec<String>), CacheError> {
        let position = cursor
            .as_deref()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let mut conn = self.manager.clone();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(position)
            .arg("MATCH")
            .arg(self.key(pattern))
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(logged("SCAN"))?;

        let keys = keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string))
            .collect();
        let next = (next != 0).then(|| next.to_string());
        Ok((next, keys))
    }

    async fn push_capped(
        &self,
        key: &str,
        value: Vec<u8>,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = self.key(key);
        let stop = i64::try_from(cap).unwrap_or(i64::MAX).saturating_sub(1);
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(stop)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(millis(ttl))
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(logged("LPUSH"))
    }

    async fn refill_list(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        if values.is_empty() {
            return Ok(false);
        }
        let script = Script::new(REFILL_LIST);
        let mut invocation = script.key(self.key(key));
        invocation.arg(millis(ttl));
        for value in values {
            invocation.arg(value);
        }
        let mut conn = self.manager.clone();
        let written: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(logged("EVAL refill"))?;
        Ok(written == 1)
    }

    async fn range(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>, CacheError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let stop = i64::try_from(count).unwrap_or(i64::MAX).saturating_sub(1);
        let mut conn = self.manager.clone();
        redis::cmd("LRANGE")
            .arg(self.key(key))
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(logged("LRANGE"))
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(logged("PING"))?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(CacheError::Backend(format!(
                "unexpected PING response '{reply}'"
            )))
        }
    }
}
