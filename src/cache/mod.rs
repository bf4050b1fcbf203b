//! Expiring cache for offline data access.
//!
//! This module provides the storage side of the offline layer:
//! - A string key-value substrate shared with the rest of the application
//! - A TTL cache that namespaces its keys and expires entries lazily on read
//! - A size-bounded evictor that drops soonest-to-expire entries first

mod evict;
mod layer;
mod storage;
mod traits;

pub use evict::{EvictionReport, Evictor, DEFAULT_MAX_SIZE, EVICTION_TARGET_RATIO};
pub use layer::{TtlCache, DEFAULT_MAX_ENTRY_SIZE};
pub use storage::{stored_size, JsonStoreExt, KeyValueStore, MemoryStore};
pub use traits::{
  CacheEntry, CacheResult, CacheSource, CacheStats, Ttl, CACHE_PREFIX, PENDING_PREFIX,
};
