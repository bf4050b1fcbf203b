//! Size-bounded eviction in expiry order.

use color_eyre::Result;
use tracing::{debug, info, warn};

use super::storage::{stored_size, KeyValueStore};
use super::traits::{EntryHeader, CACHE_PREFIX};

/// Default substrate budget: 10 MiB.
pub const DEFAULT_MAX_SIZE: usize = 10 * 1024 * 1024;

/// Fraction of the budget eviction shrinks down to, so the next write
/// doesn't immediately trigger another pass.
pub const EVICTION_TARGET_RATIO: f64 = 0.8;

/// What an eviction pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
  pub removed: usize,
  pub bytes_before: usize,
  pub bytes_after: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Evictor {
  max_size: usize,
}

impl Default for Evictor {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_SIZE)
  }
}

impl Evictor {
  pub fn new(max_size: usize) -> Self {
    Self { max_size }
  }

  pub fn max_size(&self) -> usize {
    self.max_size
  }

  pub fn target_size(&self) -> usize {
    (self.max_size as f64 * EVICTION_TARGET_RATIO) as usize
  }

  /// Total bytes held by every value in the substrate, cached or not.
  pub fn current_size<S: KeyValueStore + ?Sized>(&self, store: &S) -> Result<usize> {
    Ok(
      store
        .entries()?
        .iter()
        .map(|(_, value)| stored_size(value))
        .sum(),
    )
  }

  /// Remove soonest-to-expire cache entries until usage is under the target.
  ///
  /// Pending-change records and values that aren't cache envelopes are
  /// never candidates.
  pub fn evict_if_needed<S: KeyValueStore + ?Sized>(&self, store: &S) -> Result<EvictionReport> {
    let entries = store.entries()?;
    let bytes_before: usize = entries.iter().map(|(_, v)| stored_size(v)).sum();
    if bytes_before <= self.max_size {
      return Ok(EvictionReport {
        removed: 0,
        bytes_before,
        bytes_after: bytes_before,
      });
    }

    let mut candidates: Vec<(i64, String, usize)> = entries
      .iter()
      .filter(|(key, _)| key.starts_with(CACHE_PREFIX))
      .filter_map(|(key, value)| {
        serde_json::from_str::<EntryHeader>(value)
          .ok()
          .map(|h| (h.expires_at, key.clone(), stored_size(value)))
      })
      .collect();
    candidates.sort();

    let target = self.target_size();
    let mut size = bytes_before;
    let mut removed = 0;
    for (expires_at, key, bytes) in candidates {
      if size <= target {
        break;
      }
      store.remove(&key)?;
      debug!(key = %key, expires_at, bytes, "Evicted cache entry");
      size = size.saturating_sub(bytes);
      removed += 1;
    }

    let bytes_after = self.current_size(store)?;
    if bytes_after > target {
      warn!(
        bytes_after,
        target, "Eviction could not reach target size; remaining data is not evictable"
      );
    }
    info!(removed, bytes_before, bytes_after, "Cache eviction pass complete");

    Ok(EvictionReport {
      removed,
      bytes_before,
      bytes_after,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStore;
  use crate::cache::traits::CacheEntry;

  /// Write a cache envelope whose stored size is close to `bytes`.
  fn put_entry(store: &MemoryStore, key: &str, expires_at: i64, bytes: usize) {
    let filler = "x".repeat(bytes / 2);
    let entry = CacheEntry {
      payload: filler,
      expires_at,
    };
    store
      .set(
        &format!("{CACHE_PREFIX}{key}"),
        &serde_json::to_string(&entry).unwrap(),
      )
      .unwrap();
  }

  #[test]
  fn test_noop_under_budget() {
    let store = MemoryStore::new();
    put_entry(&store, "a", 10, 1_000);

    let report = Evictor::new(10_000).evict_if_needed(&store).unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(store.len().unwrap(), 1);
  }

  #[test]
  fn test_evicts_soonest_expiring_first() {
    const MB: usize = 1024 * 1024;
    let store = MemoryStore::new();
    // 50 entries totalling ~12MB against a 10MB budget
    for i in 0..50 {
      put_entry(&store, &format!("entry-{i:02}"), 1_000 + i as i64, 12 * MB / 50);
    }
    let evictor = Evictor::new(10 * MB);
    assert!(evictor.current_size(&store).unwrap() > 10 * MB);

    let report = evictor.evict_if_needed(&store).unwrap();
    assert!(report.bytes_after <= 8 * MB);
    assert_eq!(evictor.current_size(&store).unwrap(), report.bytes_after);

    // Survivors are exactly the latest-expiring suffix
    let keys = store.keys().unwrap();
    let survivors: Vec<usize> = keys
      .iter()
      .map(|k| k.trim_start_matches("cache:entry-").parse().unwrap())
      .collect();
    let first = 50 - survivors.len();
    assert_eq!(survivors, (first..50).collect::<Vec<_>>());
    assert_eq!(report.removed, first);
  }

  #[test]
  fn test_pending_records_survive_pressure() {
    let store = MemoryStore::new();
    let big = "y".repeat(5_000);
    let pending = serde_json::to_string(&CacheEntry {
      payload: vec![big],
      expires_at: 0,
    })
    .unwrap();
    store.set("pending:goal:g1", &pending).unwrap();
    put_entry(&store, "a", 5, 2_000);
    store.set("theme", "dark").unwrap();

    Evictor::new(1_000).evict_if_needed(&store).unwrap();

    assert!(store.get("pending:goal:g1").unwrap().is_some());
    assert!(store.get("theme").unwrap().is_some());
    assert!(store.get("cache:a").unwrap().is_none());
  }

  #[test]
  fn test_skips_non_envelope_cache_values() {
    let store = MemoryStore::new();
    store.set("cache:legacy", &"z".repeat(3_000)).unwrap();
    put_entry(&store, "b", 1, 2_000);

    let report = Evictor::new(1_000).evict_if_needed(&store).unwrap();
    assert_eq!(report.removed, 1);
    assert!(store.get("cache:legacy").unwrap().is_some());
  }
}
