//! Durable key-value substrate shared by the cache and the pending queue.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// String-only, synchronous key-value storage.
///
/// The substrate is shared with unrelated parts of the application, so
/// implementations must not assume they own every key.
pub trait KeyValueStore: Send + Sync {
  /// Read the raw value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Write `value` under `key`, replacing any previous value.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Delete `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// All keys currently stored.
  fn keys(&self) -> Result<Vec<String>>;

  /// Number of stored keys.
  fn len(&self) -> Result<usize> {
    Ok(self.keys()?.len())
  }

  fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// All key/value pairs. Used for size accounting.
  fn entries(&self) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for key in self.keys()? {
      if let Some(value) = self.get(&key)? {
        out.push((key, value));
      }
    }
    Ok(out)
  }

  /// Keys starting with `prefix`.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    Ok(
      self
        .keys()?
        .into_iter()
        .filter(|k| k.starts_with(prefix))
        .collect(),
    )
  }
}

/// JSON convenience layer over any [`KeyValueStore`].
pub trait JsonStoreExt: KeyValueStore {
  /// Decode the value under `key`. Undecodable values surface as errors so
  /// callers can decide whether to drop them.
  fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    match self.get(key)? {
      Some(raw) => {
        let value = serde_json::from_str(&raw)
          .map_err(|e| eyre!("Failed to parse stored value {}: {}", key, e))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)
      .map_err(|e| eyre!("Failed to serialize value {}: {}", key, e))?;
    self.set(key, &raw)
  }
}

impl<S: KeyValueStore + ?Sized> JsonStoreExt for S {}

/// Stored size of a string in bytes, counting UTF-16 code units at 2 bytes.
pub fn stored_size(value: &str) -> usize {
  value.encode_utf16().count() * 2
}

/// In-memory substrate. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
  map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
    self.map.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.lock()?.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn len(&self) -> Result<usize> {
    Ok(self.lock()?.len())
  }

  fn entries(&self) -> Result<Vec<(String, String)>> {
    Ok(
      self
        .lock()?
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Goal {
    id: String,
  }

  #[test]
  fn test_memory_store_basic_ops() {
    let store = MemoryStore::new();
    assert!(store.is_empty().unwrap());

    store.set("a", "1").unwrap();
    store.set("b", "2").unwrap();
    store.set("a", "3").unwrap();

    assert_eq!(store.get("a").unwrap().as_deref(), Some("3"));
    assert_eq!(store.len().unwrap(), 2);

    store.remove("a").unwrap();
    store.remove("missing").unwrap();
    assert_eq!(store.keys().unwrap(), vec!["b".to_string()]);
  }

  #[test]
  fn test_keys_with_prefix() {
    let store = MemoryStore::new();
    store.set("pending:goal:g1", "[]").unwrap();
    store.set("pending:team:t1", "[]").unwrap();
    store.set("theme", "dark").unwrap();

    let keys = store.keys_with_prefix("pending:goal:").unwrap();
    assert_eq!(keys, vec!["pending:goal:g1".to_string()]);
  }

  #[test]
  fn test_json_roundtrip_and_bad_json() {
    let store = MemoryStore::new();
    store
      .write_json("goal", &Goal { id: "g1".into() })
      .unwrap();
    let goal: Option<Goal> = store.read_json("goal").unwrap();
    assert_eq!(goal, Some(Goal { id: "g1".into() }));

    store.set("broken", "{not json").unwrap();
    assert!(store.read_json::<Goal>("broken").is_err());
    assert!(store.read_json::<Goal>("absent").unwrap().is_none());
  }

  #[test]
  fn test_stored_size_counts_utf16_units() {
    assert_eq!(stored_size("abc"), 6);
    // One astral character is a surrogate pair
    assert_eq!(stored_size("\u{1F600}"), 4);
  }
}
