//! TTL cache store that sits between data hooks and the remote service.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::evict::{EvictionReport, Evictor};
use super::storage::{stored_size, KeyValueStore};
use super::traits::{CacheEntry, CacheResult, CacheStats, Ttl, CACHE_PREFIX, PENDING_PREFIX};
use crate::clock::{Clock, SystemClock};
use crate::error::CacheError;
use crate::keys::DataQuery;

/// Default limit for a single serialized entry: 2 MiB.
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 2 * 1024 * 1024;

/// Expiring key-value cache over a shared substrate.
///
/// Expiry is lazy: an entry past its `expiresAt` is deleted the first time
/// someone reads it. There is no background sweep.
pub struct TtlCache<S: KeyValueStore> {
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  evictor: Evictor,
  max_entry_size: usize,
}

impl<S: KeyValueStore> TtlCache<S> {
  /// Create a new cache over the given storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      clock: Arc::new(SystemClock),
      evictor: Evictor::default(),
      max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_max_size(mut self, max_size: usize) -> Self {
    self.evictor = Evictor::new(max_size);
    self
  }

  pub fn with_max_entry_size(mut self, max_entry_size: usize) -> Self {
    self.max_entry_size = max_entry_size;
    self
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  pub fn evictor(&self) -> Evictor {
    self.evictor
  }

  fn substrate_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
  }

  /// Store `payload` under `key` until `now + ttl`.
  ///
  /// Oversized or unserializable payloads are rejected without touching the
  /// existing entry. The error is logged here; callers may ignore it.
  pub fn store<T: Serialize + ?Sized>(
    &self,
    key: &str,
    payload: &T,
    ttl: Ttl,
  ) -> Result<(), CacheError> {
    let entry = CacheEntry::new(payload, self.clock.now_millis(), ttl);
    let raw = serde_json::to_string(&entry).map_err(|source| {
      let err = CacheError::Serialization {
        key: key.to_string(),
        source,
      };
      warn!(error = %err, "Rejected cache write");
      err
    })?;

    let size = stored_size(&raw);
    if size > self.max_entry_size {
      let err = CacheError::Oversize {
        key: key.to_string(),
        size,
        max: self.max_entry_size,
      };
      warn!(error = %err, "Rejected cache write");
      return Err(err);
    }

    self
      .storage
      .set(&Self::substrate_key(key), &raw)
      .map_err(|e| {
        error!(key, error = %e, "Failed to write cache entry");
        CacheError::Storage(e.to_string())
      })?;
    debug!(key, size, ttl_ms = ttl.as_millis(), "Cached entry");

    self.evict_if_needed();
    Ok(())
  }

  /// Read the payload under `key`, or `None` if missing, expired or corrupt.
  ///
  /// Expired and corrupt entries are deleted as a side effect.
  pub fn retrieve<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let substrate_key = Self::substrate_key(key);
    let raw = match self.storage.get(&substrate_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => {
        debug!(key, "Cache miss");
        return None;
      }
      Err(e) => {
        error!(key, error = %e, "Failed to read cache entry");
        return None;
      }
    };

    let entry: CacheEntry<Value> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "Dropping corrupt cache entry");
        self.discard(&substrate_key);
        return None;
      }
    };

    if entry.is_expired(self.clock.now_millis()) {
      debug!(key, expires_at = entry.expires_at, "Cache entry expired");
      self.discard(&substrate_key);
      return None;
    }

    match serde_json::from_value(entry.payload) {
      Ok(payload) => {
        debug!(key, "Cache hit");
        Some(payload)
      }
      Err(e) => {
        warn!(key, error = %e, "Dropping cache entry with unexpected shape");
        self.discard(&substrate_key);
        None
      }
    }
  }

  /// Whether an unexpired entry exists, without decoding or deleting it.
  pub fn contains(&self, key: &str) -> bool {
    let now = self.clock.now_millis();
    self
      .storage
      .get(&Self::substrate_key(key))
      .ok()
      .flatten()
      .and_then(|raw| serde_json::from_str::<CacheEntry<Value>>(&raw).ok())
      .is_some_and(|entry| !entry.is_expired(now))
  }

  /// Drop the entry under `key` if present.
  pub fn remove(&self, key: &str) {
    self.discard(&Self::substrate_key(key));
  }

  fn discard(&self, substrate_key: &str) {
    if let Err(e) = self.storage.remove(substrate_key) {
      error!(key = substrate_key, error = %e, "Failed to remove cache entry");
    }
  }

  /// Run the evictor, logging instead of failing.
  pub fn evict_if_needed(&self) -> Option<EvictionReport> {
    match self.evictor.evict_if_needed(self.storage.as_ref()) {
      Ok(report) => Some(report),
      Err(e) => {
        error!(error = %e, "Cache eviction failed");
        None
      }
    }
  }

  /// Total bytes held by the substrate.
  pub fn current_size(&self) -> Result<usize> {
    self.evictor.current_size(self.storage.as_ref())
  }

  pub fn stats(&self) -> Result<CacheStats> {
    let keys = self.storage.keys()?;
    Ok(CacheStats {
      entries: keys.iter().filter(|k| k.starts_with(CACHE_PREFIX)).count(),
      pending_records: keys.iter().filter(|k| k.starts_with(PENDING_PREFIX)).count(),
      total_bytes: self.current_size()?,
    })
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Unexpired cache entry - return immediately
  /// 2. Otherwise fetch from the remote service
  /// 3. Store the fresh data; a rejected write doesn't fail the fetch
  pub async fn fetch<T, F, Fut>(&self, key: &str, ttl: Ttl, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(cached) = self.retrieve::<T>(key) {
      return Ok(CacheResult::from_cache(cached));
    }

    let data = fetcher().await?;
    // Already logged inside store(); the caller still gets its data
    let _ = self.store(key, &data, ttl);
    Ok(CacheResult::from_network(data))
  }

  /// [`fetch`](Self::fetch) keyed and timed by a dashboard query.
  pub async fn fetch_query<T, F, Fut>(
    &self,
    query: &DataQuery,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.fetch(&query.cache_key(), query.ttl(), fetcher).await
  }
}

impl<S: KeyValueStore> Clone for TtlCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
      evictor: self.evictor,
      max_entry_size: self.max_entry_size,
    }
  }
}
