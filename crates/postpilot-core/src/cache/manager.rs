use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::KvStore;
use crate::collaborators::{AnalyticsRecord, CaptionResult, VideoMetadata};
use crate::error::{Error, Result};

/// Prefix written in front of binary payloads. A leading NUL can never start
/// JSON text, so binary and JSON values cannot be confused.
const BINARY_MARKER: &[u8] = b"\x00bin\x00";

/// Key namespaces
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// `caption:`
    Captions,
    /// `hashtag:`
    Hashtags,
    /// `video:`
    Videos,
    /// `analytics:`
    Analytics,
    /// `user:`
    Users,
    /// `system:`
    System,
    /// `<name>:` for ad-hoc namespaces
    Custom(String),
}

impl Namespace {
    /// Built-in namespaces
    pub const BUILTIN: [Namespace; 6] = [
        Namespace::Captions,
        Namespace::Hashtags,
        Namespace::Videos,
        Namespace::Analytics,
        Namespace::Users,
        Namespace::System,
    ];

    /// Namespace name (`captions`, `videos`, ...)
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Captions => "captions",
            Self::Hashtags => "hashtags",
            Self::Videos => "videos",
            Self::Analytics => "analytics",
            Self::Users => "users",
            Self::System => "system",
            Self::Custom(name) => name,
        }
    }

    /// Key prefix including the trailing colon
    #[must_use]
    pub fn prefix(&self) -> String {
        match self {
            Self::Captions => "caption:".to_string(),
            Self::Hashtags => "hashtag:".to_string(),
            Self::Videos => "video:".to_string(),
            Self::Analytics => "analytics:".to_string(),
            Self::Users => "user:".to_string(),
            Self::System => "system:".to_string(),
            Self::Custom(name) => format!("{}:", name),
        }
    }

    /// Full key for `key` in this namespace
    #[must_use]
    pub fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix(), key)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cache manager configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// TTL used when a call passes none
    pub default_ttl: Duration,
    /// Caption entries
    pub caption_ttl: Duration,
    /// Video metadata entries
    pub video_ttl: Duration,
    /// Analytics entries
    pub analytics_ttl: Duration,
    /// User preference entries
    pub user_preferences_ttl: Duration,
    /// How often the local mirror is swept
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            caption_ttl: Duration::from_secs(1800),
            video_ttl: Duration::from_secs(3600),
            analytics_ttl: Duration::from_secs(7200),
            user_preferences_ttl: Duration::from_secs(86400),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Create with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set default TTL
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set caption TTL
    #[must_use]
    pub fn with_caption_ttl(mut self, ttl: Duration) -> Self {
        self.caption_ttl = ttl;
        self
    }

    /// Set video metadata TTL
    #[must_use]
    pub fn with_video_ttl(mut self, ttl: Duration) -> Self {
        self.video_ttl = ttl;
        self
    }

    /// Set analytics TTL
    #[must_use]
    pub fn with_analytics_ttl(mut self, ttl: Duration) -> Self {
        self.analytics_ttl = ttl;
        self
    }

    /// Set sweep interval
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Local bookkeeping for one remote entry. Never authoritative.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Namespaced key
    pub key: String,
    /// TTL the entry was written with
    pub ttl: Option<Duration>,
    /// When it was written (or its expiry last reset)
    pub created_at: Instant,
    /// Hits recorded through this manager
    pub hits: u64,
    /// Encoded size
    pub size_bytes: usize,
}

impl CacheEntry {
    fn is_stale(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.created_at) > ttl)
    }
}

/// Hit/miss counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Successful reads
    pub hits: u64,
    /// Reads that found nothing or failed
    pub misses: u64,
    /// Writes
    pub sets: u64,
    /// Deletes that removed something
    pub deletes: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
}

/// Output of [`CacheManager::get_cache_info`]
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    /// Store backend
    pub backend: &'static str,
    /// Entries in the local mirror
    pub local_cache_entries: usize,
    /// Built-in namespace names
    pub namespaces: Vec<String>,
    /// Counters
    pub metrics: CacheMetrics,
}

/// Namespaced TTL cache over a [`KvStore`].
///
/// Values are JSON by default; [`set_bytes`](Self::set_bytes) stores opaque
/// binary payloads. The local mirror only feeds metrics and is swept in the
/// background; the remote store expires entries on its own.
pub struct CacheManager {
    store: Arc<dyn KvStore>,
    config: CacheConfig,
    mirror: DashMap<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl CacheManager {
    /// Create a manager over `store`
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            mirror: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Store a JSON-serializable value. `ttl` falls back to the default TTL.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        ns: &Namespace,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.write(ns.key(key), encoded, ttl).await
    }

    /// Store opaque bytes.
    pub async fn set_bytes(
        &self,
        ns: &Namespace,
        key: &str,
        bytes: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut encoded = Vec::with_capacity(BINARY_MARKER.len() + bytes.len());
        encoded.extend_from_slice(BINARY_MARKER);
        encoded.extend_from_slice(bytes);
        self.write(ns.key(key), encoded, ttl).await
    }

    async fn write(&self, full_key: String, encoded: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let size_bytes = encoded.len();
        self.store.set(&full_key, encoded, Some(ttl)).await?;

        self.sets.fetch_add(1, Ordering::Relaxed);
        self.mirror.insert(
            full_key.clone(),
            CacheEntry {
                key: full_key.clone(),
                ttl: Some(ttl),
                created_at: Instant::now(),
                hits: 0,
                size_bytes,
            },
        );
        debug!(key = %full_key, ttl_secs = ttl.as_secs(), "Cached key");
        Ok(())
    }

    /// Read a JSON value. A missing key, or a read error, counts as a miss.
    pub async fn get<T: DeserializeOwned>(&self, ns: &Namespace, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.read(&ns.key(key)).await? else {
            return Ok(None);
        };
        if raw.starts_with(BINARY_MARKER) {
            return Err(Error::Serialization(format!(
                "{} holds a binary value",
                ns.key(key)
            )));
        }
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Read opaque bytes stored with [`set_bytes`](Self::set_bytes).
    /// JSON values come back as their UTF-8 text.
    pub async fn get_bytes(&self, ns: &Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read(&ns.key(key)).await?.map(|raw| {
            match raw.strip_prefix(BINARY_MARKER) {
                Some(bytes) => bytes.to_vec(),
                None => raw,
            }
        }))
    }

    async fn read(&self, full_key: &str) -> Result<Option<Vec<u8>>> {
        let raw = match self.store.get(full_key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                warn!(key = %full_key, error = %e, "Cache read failed");
                return Err(e);
            }
        };

        match raw {
            Some(raw) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(mut entry) = self.mirror.get_mut(full_key) {
                    entry.hits += 1;
                }
                debug!(key = %full_key, "Cache hit");
                Ok(Some(raw))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.mirror.remove(full_key);
                debug!(key = %full_key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Delete a key. Returns true if it existed.
    pub async fn delete(&self, ns: &Namespace, key: &str) -> Result<bool> {
        let full_key = ns.key(key);
        let deleted = self.store.delete(&full_key).await?;
        self.mirror.remove(&full_key);
        if deleted {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(deleted)
    }

    /// Whether a live key exists.
    pub async fn exists(&self, ns: &Namespace, key: &str) -> Result<bool> {
        self.store.exists(&ns.key(key)).await
    }

    /// Reset a key's TTL.
    pub async fn expire(&self, ns: &Namespace, key: &str, ttl: Duration) -> Result<bool> {
        let full_key = ns.key(key);
        let updated = self.store.expire(&full_key, ttl).await?;
        if updated {
            if let Some(mut entry) = self.mirror.get_mut(&full_key) {
                entry.ttl = Some(ttl);
                entry.created_at = Instant::now();
            }
        }
        Ok(updated)
    }

    /// Remaining TTL in seconds (`-2` missing, `-1` no expiry).
    pub async fn ttl(&self, ns: &Namespace, key: &str) -> Result<i64> {
        self.store.ttl(&ns.key(key)).await
    }

    /// Store several JSON values with one TTL.
    pub async fn mset<T: Serialize>(
        &self,
        ns: &Namespace,
        entries: &[(String, T)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            encoded.push((ns.key(key), serde_json::to_vec(value)?));
        }
        self.store.mset(&encoded, Some(ttl)).await?;

        let now = Instant::now();
        for (full_key, value) in encoded {
            self.mirror.insert(
                full_key.clone(),
                CacheEntry {
                    key: full_key,
                    ttl: Some(ttl),
                    created_at: now,
                    hits: 0,
                    size_bytes: value.len(),
                },
            );
        }
        self.sets.fetch_add(entries.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Fetch several JSON values. Missing or undecodable keys are left out.
    pub async fn mget<T: DeserializeOwned>(
        &self,
        ns: &Namespace,
        keys: &[String],
    ) -> Result<Vec<(String, T)>> {
        let full_keys: Vec<String> = keys.iter().map(|k| ns.key(k)).collect();
        let values = match self.store.mget(&full_keys).await {
            Ok(values) => values,
            Err(e) => {
                self.misses
                    .fetch_add(keys.len() as u64, Ordering::Relaxed);
                return Err(e);
            }
        };

        let mut found = Vec::new();
        for (key, raw) in keys.iter().zip(values) {
            match raw.map(|raw| serde_json::from_slice::<T>(&raw)) {
                Some(Ok(value)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    found.push((key.clone(), value));
                }
                Some(Err(e)) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Skipping undecodable cached value");
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(found)
    }

    /// Delete every key in a namespace. Returns how many were removed.
    pub async fn clear_namespace(&self, ns: &Namespace) -> Result<u64> {
        let prefix = ns.prefix();
        let removed = self.store.delete_prefix(&prefix).await?;
        self.mirror.retain(|key, _| !key.starts_with(&prefix));
        self.deletes.fetch_add(removed, Ordering::Relaxed);
        info!(namespace = %ns, removed, "Cleared cache namespace");
        Ok(removed)
    }

    /// Current counters
    #[must_use]
    pub fn get_metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheMetrics {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Metrics plus mirror and backend details
    #[must_use]
    pub fn get_cache_info(&self) -> CacheInfo {
        CacheInfo {
            backend: self.store.name(),
            local_cache_entries: self.mirror.len(),
            namespaces: Namespace::BUILTIN
                .iter()
                .map(|ns| ns.name().to_string())
                .collect(),
            metrics: self.get_metrics(),
        }
    }

    /// Mirror entry for a namespaced key
    #[must_use]
    pub fn local_entry(&self, ns: &Namespace, key: &str) -> Option<CacheEntry> {
        self.mirror.get(&ns.key(key)).map(|e| e.value().clone())
    }

    /// Drop mirror entries whose TTL has elapsed. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.mirror.len();
        self.mirror.retain(|_, entry| !entry.is_stale(now));
        let removed = before.saturating_sub(self.mirror.len());
        if removed > 0 {
            debug!(removed, "Swept expired local cache entries");
        }
        removed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval`
    /// until `shutdown` fires.
    pub fn start_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = Arc::clone(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        manager.sweep_expired();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Cache sweeper stopped");
                        break;
                    }
                }
            }
        });
    }

    // Typed helpers

    /// Cache a generated caption under `caption:<task_id>`.
    pub async fn cache_caption(&self, task_id: &str, caption: &CaptionResult) -> Result<()> {
        self.set(
            &Namespace::Captions,
            task_id,
            caption,
            Some(self.config.caption_ttl),
        )
        .await
    }

    /// Cached caption for a task
    pub async fn get_cached_caption(&self, task_id: &str) -> Result<Option<CaptionResult>> {
        self.get(&Namespace::Captions, task_id).await
    }

    /// Cache media metadata under `video:<task_id>`.
    pub async fn cache_video_metadata(
        &self,
        task_id: &str,
        metadata: &VideoMetadata,
    ) -> Result<()> {
        self.set(
            &Namespace::Videos,
            task_id,
            metadata,
            Some(self.config.video_ttl),
        )
        .await
    }

    /// Cached media metadata for a task
    pub async fn get_cached_video_metadata(&self, task_id: &str) -> Result<Option<VideoMetadata>> {
        self.get(&Namespace::Videos, task_id).await
    }

    /// Cache analytics under `analytics:<post_id>`.
    pub async fn cache_analytics(&self, post_id: &str, analytics: &AnalyticsRecord) -> Result<()> {
        self.set(
            &Namespace::Analytics,
            post_id,
            analytics,
            Some(self.config.analytics_ttl),
        )
        .await
    }

    /// Cached analytics for a post
    pub async fn get_cached_analytics(&self, post_id: &str) -> Result<Option<AnalyticsRecord>> {
        self.get(&Namespace::Analytics, post_id).await
    }

    /// Cache user preferences under `user:preferences:<user_id>`.
    pub async fn cache_user_preferences(&self, user_id: &str, preferences: &Value) -> Result<()> {
        self.set(
            &Namespace::Users,
            &format!("preferences:{}", user_id),
            preferences,
            Some(self.config.user_preferences_ttl),
        )
        .await
    }

    /// Cached preferences for a user
    pub async fn get_cached_user_preferences(&self, user_id: &str) -> Result<Option<Value>> {
        self.get(&Namespace::Users, &format!("preferences:{}", user_id))
            .await
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("backend", &self.store.name())
            .field("local_entries", &self.mirror.len())
            .finish()
    }
}
