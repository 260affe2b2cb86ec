use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Remote TTL key/value store the cache manager writes through to.
///
/// `ttl` follows Redis conventions: `-2` for a missing key, `-1` for a key
/// without expiry, otherwise the remaining seconds.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Fetch a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a key. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether a live key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Reset a key's expiry. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time to live in seconds.
    async fn ttl(&self, key: &str) -> Result<i64>;

    /// Delete every key starting with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Liveness check.
    async fn ping(&self) -> Result<()>;

    /// Store several values sharing one TTL.
    async fn mset(&self, entries: &[(String, Vec<u8>)], ttl: Option<Duration>) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value.clone(), ttl).await?;
        }
        Ok(())
    }

    /// Fetch several values; the result lines up with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Backend name for diagnostics
    fn name(&self) -> &'static str;
}

/// Redis-backed store (for production)
pub struct RedisKvStore {
    client: redis::Client,
}

impl RedisKvStore {
    /// Create a new Redis store
    ///
    /// # Errors
    ///
    /// Returns error if the Redis URL is invalid
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("invalid redis url: {}", e)))?;
        Ok(Self { client })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Redis(format!("Redis connection failed: {}", e)))
    }
}

/// Millisecond expiry for `PSETEX`/`PEXPIRE`; Redis rejects zero.
pub(super) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escape glob metacharacters so a prefix can be used in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result = match ttl {
            Some(ttl) => {
                redis::cmd("PSETEX")
                    .arg(key)
                    .arg(ttl_millis(ttl))
                    .arg(value)
                    .query_async::<()>(&mut conn)
                    .await
            }
            None => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .query_async::<()>(&mut conn)
                    .await
            }
        };
        result.map_err(|e| Error::Redis(format!("Redis SET failed: {}", e)))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.get_connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("Redis GET failed: {}", e)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("Redis DEL failed: {}", e)))?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("Redis EXISTS failed: {}", e)))?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("Redis PEXPIRE failed: {}", e)))?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.get_connection().await?;
        redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("Redis TTL failed: {}", e)))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let pattern = glob_escape(prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::Redis(format!("Redis SCAN failed: {}", e)))?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| Error::Redis(format!("Redis DEL failed: {}", e)))?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, removed, "Cleared keys from Redis");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("Redis PING failed: {}", e)))?;
        Ok(())
    }

    async fn mset(&self, entries: &[(String, Vec<u8>)], ttl: Option<Duration>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            match ttl {
                Some(ttl) => pipe
                    .cmd("PSETEX")
                    .arg(key)
                    .arg(ttl_millis(ttl))
                    .arg(value.as_slice())
                    .ignore(),
                None => pipe.cmd("SET").arg(key).arg(value.as_slice()).ignore(),
            };
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("Redis pipeline failed: {}", e)))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("Redis MGET failed: {}", e)))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory store with lazy expiry (development and tests).
///
/// Uses `tokio::time::Instant` so tests can drive expiry with a paused clock.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryKvStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let found = self.entries.get(key).map(|e| e.value().clone());
        match found {
            Some(entry) if entry.is_live(now) => Some(entry),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live(key).map(|e| e.value))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.live(key).is_some();
        self.entries.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        if self.live(key).is_none() {
            return Ok(false);
        }
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        Ok(match self.live(key) {
            None => -2,
            Some(StoredValue {
                expires_at: None, ..
            }) => -1,
            Some(StoredValue {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
        })
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            if key.starts_with(prefix) {
                if entry.is_live(now) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
