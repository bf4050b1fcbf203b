//! Core types for the caching system.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Substrate prefix for TTL cache entries.
pub const CACHE_PREFIX: &str = "cache:";

/// Substrate prefix for pending-change records.
pub const PENDING_PREFIX: &str = "pending:";

/// Envelope persisted for every cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
  pub payload: T,
  /// Epoch milliseconds after which the entry is invalid
  pub expires_at: i64,
}

impl<T> CacheEntry<T> {
  pub fn new(payload: T, now_millis: i64, ttl: Ttl) -> Self {
    Self {
      payload,
      expires_at: now_millis.saturating_add(ttl.as_millis()),
    }
  }

  /// Expired strictly after `expires_at`; an entry is still valid at that instant.
  pub fn is_expired(&self, now_millis: i64) -> bool {
    now_millis > self.expires_at
  }
}

/// Envelope header only, for scans that don't care about the payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EntryHeader {
  pub expires_at: i64,
}

/// Time-to-live presets, picked by how volatile the data is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
  /// 5 minutes
  Short,
  /// 30 minutes
  Medium,
  /// 24 hours
  Long,
  /// 7 days
  VeryLong,
  Custom(Duration),
}

impl Ttl {
  pub fn duration(self) -> Duration {
    match self {
      Ttl::Short => Duration::from_secs(5 * 60),
      Ttl::Medium => Duration::from_secs(30 * 60),
      Ttl::Long => Duration::from_secs(24 * 60 * 60),
      Ttl::VeryLong => Duration::from_secs(7 * 24 * 60 * 60),
      Ttl::Custom(d) => d,
    }
  }

  pub fn as_millis(self) -> i64 {
    i64::try_from(self.duration().as_millis()).unwrap_or(i64::MAX)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the remote service
  Network,
  /// Unexpired data from the local cache
  Cache,
}

/// Snapshot of what the substrate currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub pending_records: usize,
  pub total_bytes: usize,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ttl_presets() {
    assert_eq!(Ttl::Short.as_millis(), 300_000);
    assert_eq!(Ttl::Medium.as_millis(), 1_800_000);
    assert_eq!(Ttl::Long.as_millis(), 86_400_000);
    assert_eq!(Ttl::VeryLong.as_millis(), 604_800_000);
    assert_eq!(Ttl::Custom(Duration::from_millis(42)).as_millis(), 42);
  }

  #[test]
  fn test_entry_expiry_boundary() {
    let entry = CacheEntry::new("x", 1_000, Ttl::Custom(Duration::from_millis(500)));
    assert_eq!(entry.expires_at, 1_500);
    assert!(!entry.is_expired(1_500));
    assert!(entry.is_expired(1_501));
  }

  #[test]
  fn test_entry_wire_format() {
    let entry = CacheEntry {
      payload: 7,
      expires_at: 99,
    };
    let json = serde_json::to_string(&entry).unwrap();
    assert_eq!(json, r#"{"payload":7,"expiresAt":99}"#);
  }
}
