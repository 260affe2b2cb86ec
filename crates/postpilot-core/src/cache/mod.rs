//! Namespaced TTL cache
//!
//! [`CacheManager`] prefixes keys per [`Namespace`], encodes values as JSON
//! (or marked binary), keeps hit/miss counters, and writes through to a
//! [`KvStore`]: Redis in production, an in-memory map in development.

mod manager;
mod store;

pub use manager::{CacheConfig, CacheEntry, CacheInfo, CacheManager, CacheMetrics, Namespace};
pub use store::{KvStore, MemoryKvStore, RedisKvStore};
