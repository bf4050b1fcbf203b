//! Persistent queue of mutations made while disconnected.
//!
//! Changes for one record live under `pending:{type}:{id}` as an
//! append-ordered list, so replaying them oldest-first reproduces the order
//! the user made them in. Records this build can't decode are moved to
//! `pending-corrupt:{type}:{id}` instead of being dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::entity::{EntityPatch, EntityType};
use super::state::SyncLedger;
use crate::cache::{CacheEntry, KeyValueStore, Ttl, PENDING_PREFIX};
use crate::clock::Clock;
use crate::error::QueueError;

/// Namespace for records set aside because they could not be decoded.
pub const CORRUPT_PREFIX: &str = "pending-corrupt:";

/// Pending changes grouped by entity id, each list oldest first.
pub type PendingBatch = BTreeMap<String, Vec<EntityPatch>>;

enum Loaded {
  Missing,
  Live(Vec<EntityPatch>),
  /// Past retention and deleted; holds the number of patches dropped
  Expired(usize),
}

pub struct PendingQueue<S: KeyValueStore> {
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
}

impl<S: KeyValueStore> PendingQueue<S> {
  pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>) -> Self {
    Self { storage, clock }
  }

  fn record_key(entity_type: EntityType, entity_id: &str) -> String {
    format!("{}{}:{}", PENDING_PREFIX, entity_type, entity_id)
  }

  fn type_prefix(entity_type: EntityType) -> String {
    format!("{}{}:", PENDING_PREFIX, entity_type)
  }

  fn storage_err(e: color_eyre::Report) -> QueueError {
    QueueError::Storage(e.to_string())
  }

  /// Read the list stored under `key`, deleting it if past retention.
  fn load(&self, key: &str) -> Result<Loaded, QueueError> {
    let Some(raw) = self.storage.get(key).map_err(Self::storage_err)? else {
      return Ok(Loaded::Missing);
    };

    let entry: CacheEntry<Vec<EntityPatch>> =
      serde_json::from_str(&raw).map_err(|source| QueueError::Decode {
        key: key.to_string(),
        source,
      })?;

    if entry.is_expired(self.clock.now_millis()) {
      warn!(
        key,
        dropped = entry.payload.len(),
        "Pending changes outlived retention, discarding"
      );
      self.storage.remove(key).map_err(Self::storage_err)?;
      return Ok(Loaded::Expired(entry.payload.len()));
    }

    Ok(Loaded::Live(entry.payload))
  }

  /// [`load`](Self::load), uncounting expired patches from `ledger`.
  fn load_live(
    &self,
    ledger: &mut SyncLedger,
    entity_type: EntityType,
    key: &str,
  ) -> Result<Option<Vec<EntityPatch>>, QueueError> {
    match self.load(key)? {
      Loaded::Live(patches) => Ok(Some(patches)),
      Loaded::Expired(dropped) => {
        ledger.record_removed(entity_type, dropped);
        Ok(None)
      }
      Loaded::Missing => Ok(None),
    }
  }

  fn save(&self, key: &str, patches: &[EntityPatch]) -> Result<(), QueueError> {
    let entry = CacheEntry::new(patches, self.clock.now_millis(), Ttl::VeryLong);
    let raw = serde_json::to_string(&entry).map_err(|source| QueueError::Encode {
      key: key.to_string(),
      source,
    })?;
    self.storage.set(key, &raw).map_err(Self::storage_err)
  }

  /// Move an undecodable record under [`CORRUPT_PREFIX`], keeping its raw value.
  fn quarantine(&self, key: &str) -> Result<(), QueueError> {
    let Some(raw) = self.storage.get(key).map_err(Self::storage_err)? else {
      return Ok(());
    };
    let aside = format!(
      "{}{}",
      CORRUPT_PREFIX,
      key.strip_prefix(PENDING_PREFIX).unwrap_or(key)
    );
    self.storage.set(&aside, &raw).map_err(Self::storage_err)?;
    self.storage.remove(key).map_err(Self::storage_err)?;
    warn!(key, moved_to = %aside, "Set aside unreadable pending record");
    Ok(())
  }

  /// Append `patch` to the record's queue and count it in `ledger`.
  ///
  /// The entity type comes from the patch itself. Retention is refreshed to
  /// [`Ttl::VeryLong`] on every append. An unreadable existing record is
  /// set aside and the new patch starts a fresh list.
  pub fn enqueue(
    &self,
    ledger: &mut SyncLedger,
    entity_id: &str,
    patch: EntityPatch,
  ) -> Result<(), QueueError> {
    let entity_type = patch.entity_type();
    let invalid = |reason: String| QueueError::InvalidPatch {
      entity_type,
      entity_id: entity_id.to_string(),
      reason,
    };
    if entity_id.is_empty() {
      return Err(invalid("entity id is empty".to_string()));
    }
    patch.validate().map_err(invalid)?;

    let key = Self::record_key(entity_type, entity_id);
    let mut patches = match self.load_live(ledger, entity_type, &key) {
      Ok(patches) => patches.unwrap_or_default(),
      Err(QueueError::Decode { .. }) => {
        self.quarantine(&key)?;
        Vec::new()
      }
      Err(e) => return Err(e),
    };
    patches.push(patch);
    self.save(&key, &patches)?;

    ledger.record_queued(entity_type, 1);
    debug!(%entity_type, entity_id, queued = patches.len(), "Queued pending change");
    Ok(())
  }

  /// Patches queued for one record, oldest first.
  pub fn pending_for(
    &self,
    ledger: &mut SyncLedger,
    entity_type: EntityType,
    entity_id: &str,
  ) -> Vec<EntityPatch> {
    let key = Self::record_key(entity_type, entity_id);
    match self.load_live(ledger, entity_type, &key) {
      Ok(patches) => patches.unwrap_or_default(),
      Err(e) => {
        error!(key = %key, error = %e, "Failed to read pending changes");
        Vec::new()
      }
    }
  }

  /// Live records of `entity_type` and how many expired patches were dropped
  /// on the way. Undecodable records are skipped and left in place.
  fn scan(&self, entity_type: EntityType) -> Result<(PendingBatch, usize), QueueError> {
    let prefix = Self::type_prefix(entity_type);
    let keys = self
      .storage
      .keys_with_prefix(&prefix)
      .map_err(Self::storage_err)?;

    let mut batch = PendingBatch::new();
    let mut expired = 0;
    for key in keys {
      let Some(entity_id) = key.strip_prefix(&prefix) else {
        continue;
      };
      match self.load(&key) {
        Ok(Loaded::Live(patches)) if !patches.is_empty() => {
          batch.insert(entity_id.to_string(), patches);
        }
        Ok(Loaded::Expired(dropped)) => expired += dropped,
        Ok(_) => {}
        Err(QueueError::Storage(e)) => return Err(QueueError::Storage(e)),
        Err(e) => error!(key = %key, error = %e, "Skipping unreadable pending record"),
      }
    }
    Ok((batch, expired))
  }

  /// Every queued record of `entity_type`, failing on storage errors.
  ///
  /// Records that can't be decoded are skipped and left in place.
  pub fn try_list_pending(
    &self,
    ledger: &mut SyncLedger,
    entity_type: EntityType,
  ) -> Result<PendingBatch, QueueError> {
    let (batch, expired) = self.scan(entity_type)?;
    ledger.record_removed(entity_type, expired);
    Ok(batch)
  }

  /// Every queued record of `entity_type`; storage errors read as empty.
  pub fn list_pending(&self, ledger: &mut SyncLedger, entity_type: EntityType) -> PendingBatch {
    self
      .try_list_pending(ledger, entity_type)
      .unwrap_or_else(|e| {
        error!(%entity_type, error = %e, "Failed to list pending changes");
        PendingBatch::new()
      })
  }

  /// Number of queued patches for `entity_type` in storage.
  pub fn count(
    &self,
    ledger: &mut SyncLedger,
    entity_type: EntityType,
  ) -> Result<usize, QueueError> {
    Ok(
      self
        .try_list_pending(ledger, entity_type)?
        .values()
        .map(Vec::len)
        .sum(),
    )
  }

  /// Number of stored records for `entity_type`, readable or not.
  pub fn stored_records(&self, entity_type: EntityType) -> Result<usize, QueueError> {
    Ok(
      self
        .storage
        .keys_with_prefix(&Self::type_prefix(entity_type))
        .map_err(Self::storage_err)?
        .len(),
    )
  }

  /// Set aside every record of `entity_type` that can't be decoded.
  /// Returns the affected entity ids.
  pub fn quarantine_unreadable(&self, entity_type: EntityType) -> Result<Vec<String>, QueueError> {
    let prefix = Self::type_prefix(entity_type);
    let keys = self
      .storage
      .keys_with_prefix(&prefix)
      .map_err(Self::storage_err)?;

    let mut moved = Vec::new();
    for key in keys {
      let Some(raw) = self.storage.get(&key).map_err(Self::storage_err)? else {
        continue;
      };
      if serde_json::from_str::<CacheEntry<Vec<EntityPatch>>>(&raw).is_err() {
        self.quarantine(&key)?;
        moved.push(key.strip_prefix(&prefix).unwrap_or(&key).to_string());
      }
    }
    Ok(moved)
  }

  /// Drop one record's queue, or with `entity_id = None` the whole type.
  ///
  /// Clearing a whole type marks it synced as of now.
  pub fn clear(
    &self,
    ledger: &mut SyncLedger,
    entity_type: EntityType,
    entity_id: Option<&str>,
  ) -> Result<(), QueueError> {
    match entity_id {
      Some(id) => {
        let key = Self::record_key(entity_type, id);
        let removed = match self.load(&key) {
          Ok(Loaded::Live(patches)) => patches.len(),
          Ok(Loaded::Expired(dropped)) => dropped,
          Ok(Loaded::Missing) | Err(_) => 0,
        };
        self.storage.remove(&key).map_err(Self::storage_err)?;
        ledger.record_removed(entity_type, removed);
        debug!(%entity_type, entity_id = id, removed, "Cleared pending record");
      }
      None => {
        let keys = self
          .storage
          .keys_with_prefix(&Self::type_prefix(entity_type))
          .map_err(Self::storage_err)?;
        for key in &keys {
          self.storage.remove(key).map_err(Self::storage_err)?;
        }
        ledger.mark_synced(entity_type, self.clock.now_millis(), 0);
        debug!(%entity_type, records = keys.len(), "Cleared pending changes");
      }
    }
    Ok(())
  }

  /// Remove the first `dispatched` patches of a record, keeping anything
  /// queued after them. Returns how many patches remain.
  pub fn acknowledge(
    &self,
    ledger: &mut SyncLedger,
    entity_type: EntityType,
    entity_id: &str,
    dispatched: usize,
  ) -> Result<usize, QueueError> {
    let key = Self::record_key(entity_type, entity_id);
    let Some(mut patches) = self.load_live(ledger, entity_type, &key)? else {
      return Ok(0);
    };

    let acked = dispatched.min(patches.len());
    patches.drain(..acked);
    if patches.is_empty() {
      self.storage.remove(&key).map_err(Self::storage_err)?;
    } else {
      self.save(&key, &patches)?;
    }

    ledger.record_removed(entity_type, acked);
    Ok(patches.len())
  }

  /// Count what is persisted so a restarted process reports it.
  pub fn rebuild_ledger(&self) -> SyncLedger {
    let mut ledger = SyncLedger::new();
    for entity_type in EntityType::ALL {
      match self.scan(entity_type) {
        Ok((batch, _)) => ledger.set_count(entity_type, batch.values().map(Vec::len).sum()),
        Err(e) => error!(%entity_type, error = %e, "Failed to count pending changes"),
      }
    }
    ledger
  }
}

impl<S: KeyValueStore> Clone for PendingQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::clock::ManualClock;
  use serde_json::json;
  use std::time::Duration;

  fn queue() -> (PendingQueue<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    (
      PendingQueue::new(Arc::new(MemoryStore::new()), clock.clone()),
      clock,
    )
  }

  fn goal(fields: serde_json::Value) -> EntityPatch {
    EntityPatch::from_fields(EntityType::Goal, fields).unwrap()
  }

  #[test]
  fn test_enqueue_list_clear_scenario() {
    let (queue, clock) = queue();
    let mut ledger = SyncLedger::new();

    queue
      .enqueue(&mut ledger, "g1", goal(json!({"status": "active"})))
      .unwrap();
    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 50})))
      .unwrap();
    assert_eq!(ledger.state(EntityType::Goal).change_count(), 2);
    assert!(ledger.state(EntityType::Goal).pending_changes());

    let pending = queue.list_pending(&mut ledger, EntityType::Goal);
    assert_eq!(pending.len(), 1);
    assert_eq!(
      pending["g1"],
      vec![goal(json!({"status": "active"})), goal(json!({"progress": 50}))]
    );

    clock.advance(Duration::from_secs(5));
    queue.clear(&mut ledger, EntityType::Goal, None).unwrap();
    assert!(queue.list_pending(&mut ledger, EntityType::Goal).is_empty());

    let state = ledger.state(EntityType::Goal);
    assert_eq!(state.change_count(), 0);
    assert!(!state.pending_changes());
    assert_eq!(state.last_sync(), 6_000);
  }

  #[test]
  fn test_clear_one_entity_leaves_siblings() {
    let (queue, _) = queue();
    let mut ledger = SyncLedger::new();
    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 10})))
      .unwrap();
    queue
      .enqueue(&mut ledger, "g2", goal(json!({"progress": 20})))
      .unwrap();
    queue
      .enqueue(&mut ledger, "g2", goal(json!({"progress": 30})))
      .unwrap();

    queue.clear(&mut ledger, EntityType::Goal, Some("g2")).unwrap();

    let pending = queue.list_pending(&mut ledger, EntityType::Goal);
    assert_eq!(pending.keys().collect::<Vec<_>>(), vec!["g1"]);
    let state = ledger.state(EntityType::Goal);
    assert_eq!(state.change_count(), 1);
    assert_eq!(state.last_sync(), 0);
  }

  #[test]
  fn test_types_are_isolated() {
    let (queue, _) = queue();
    let mut ledger = SyncLedger::new();
    queue
      .enqueue(
        &mut ledger,
        "t1",
        EntityPatch::from_fields(EntityType::Team, json!({"name": "Ops"})).unwrap(),
      )
      .unwrap();
    queue
      .enqueue(
        &mut ledger,
        "t1",
        EntityPatch::from_fields(EntityType::TeamMember, json!({"role": "lead"})).unwrap(),
      )
      .unwrap();

    queue.clear(&mut ledger, EntityType::Team, None).unwrap();
    assert!(queue.list_pending(&mut ledger, EntityType::Team).is_empty());
    assert_eq!(queue.list_pending(&mut ledger, EntityType::TeamMember).len(), 1);
    assert_eq!(ledger.state(EntityType::TeamMember).change_count(), 1);
  }

  #[test]
  fn test_invalid_patch_is_rejected() {
    let (queue, _) = queue();
    let mut ledger = SyncLedger::new();
    let err = queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 101})))
      .unwrap_err();
    assert!(matches!(err, QueueError::InvalidPatch { .. }));

    let err = queue
      .enqueue(&mut ledger, "", goal(json!({"progress": 1})))
      .unwrap_err();
    assert!(matches!(err, QueueError::InvalidPatch { .. }));
    assert_eq!(ledger.total_changes(), 0);
  }

  #[test]
  fn test_acknowledge_keeps_later_patches() {
    let (queue, _) = queue();
    let mut ledger = SyncLedger::new();
    for p in [10, 20, 30] {
      queue
        .enqueue(&mut ledger, "g1", goal(json!({"progress": p})))
        .unwrap();
    }

    let remaining = queue
      .acknowledge(&mut ledger, EntityType::Goal, "g1", 2)
      .unwrap();
    assert_eq!(remaining, 1);
    assert_eq!(
      queue.pending_for(&mut ledger, EntityType::Goal, "g1"),
      vec![goal(json!({"progress": 30}))]
    );
    assert_eq!(ledger.state(EntityType::Goal).change_count(), 1);

    assert_eq!(
      queue
        .acknowledge(&mut ledger, EntityType::Goal, "g1", 5)
        .unwrap(),
      0
    );
    assert!(queue.storage.get("pending:goal:g1").unwrap().is_none());
  }

  #[test]
  fn test_rebuild_ledger_from_storage() {
    let (queue, _) = queue();
    let mut ledger = SyncLedger::new();
    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 1})))
      .unwrap();
    queue
      .enqueue(&mut ledger, "g2", goal(json!({"progress": 2})))
      .unwrap();

    // Simulate a restart: fresh ledger, same storage
    let rebuilt = queue.clone().rebuild_ledger();
    assert_eq!(rebuilt.state(EntityType::Goal).change_count(), 2);
    assert!(rebuilt.state(EntityType::Goal).pending_changes());
    assert_eq!(rebuilt.state(EntityType::Team).change_count(), 0);
  }

  #[test]
  fn test_retention_expiry() {
    let (queue, clock) = queue();
    let mut ledger = SyncLedger::new();
    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 1})))
      .unwrap();

    clock.advance(Ttl::VeryLong.duration() - Duration::from_secs(1));
    assert_eq!(queue.list_pending(&mut ledger, EntityType::Goal).len(), 1);

    clock.advance(Duration::from_secs(2));
    assert!(queue.list_pending(&mut ledger, EntityType::Goal).is_empty());
    assert!(queue.storage.get("pending:goal:g1").unwrap().is_none());

    let state = ledger.state(EntityType::Goal);
    assert_eq!(state.change_count(), 0);
    assert!(!state.pending_changes());
  }

  #[test]
  fn test_expired_record_uncounted_on_append() {
    let (queue, clock) = queue();
    let mut ledger = SyncLedger::new();
    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 1})))
      .unwrap();
    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 2})))
      .unwrap();

    clock.advance(Ttl::VeryLong.duration() + Duration::from_secs(1));
    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 3})))
      .unwrap();

    assert_eq!(ledger.state(EntityType::Goal).change_count(), 1);
    assert_eq!(
      queue.pending_for(&mut ledger, EntityType::Goal, "g1"),
      vec![goal(json!({"progress": 3}))]
    );
  }

  #[test]
  fn test_corrupt_record_is_skipped_not_deleted() {
    let (queue, _) = queue();
    queue.storage.set("pending:goal:bad", "{nope").unwrap();
    let mut ledger = SyncLedger::new();
    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 1})))
      .unwrap();

    let pending = queue.list_pending(&mut ledger, EntityType::Goal);
    assert_eq!(pending.keys().collect::<Vec<_>>(), vec!["g1"]);
    assert!(queue.storage.get("pending:goal:bad").unwrap().is_some());
  }

  #[test]
  fn test_enqueue_sets_aside_corrupt_record() {
    let (queue, _) = queue();
    queue.storage.set("pending:goal:g1", "{nope").unwrap();
    let mut ledger = SyncLedger::new();

    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 1})))
      .unwrap();
    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 2})))
      .unwrap();

    assert_eq!(
      queue.storage.get("pending-corrupt:goal:g1").unwrap().as_deref(),
      Some("{nope")
    );
    assert_eq!(queue.pending_for(&mut ledger, EntityType::Goal, "g1").len(), 2);
    assert_eq!(ledger.state(EntityType::Goal).change_count(), 2);
  }

  #[test]
  fn test_quarantine_unreadable_keeps_raw_value() {
    let (queue, _) = queue();
    let mut ledger = SyncLedger::new();
    // Written by a build whose goal patch had an extra field
    let foreign = json!({
      "payload": [{"type": "goal", "fields": {"progress": 5, "weight": 3}}],
      "expiresAt": 9_999_999_999_999_i64,
    });
    queue
      .storage
      .set("pending:goal:g9", &foreign.to_string())
      .unwrap();
    queue
      .enqueue(&mut ledger, "g1", goal(json!({"progress": 1})))
      .unwrap();
    assert_eq!(queue.stored_records(EntityType::Goal).unwrap(), 2);

    let moved = queue.quarantine_unreadable(EntityType::Goal).unwrap();
    assert_eq!(moved, vec!["g9".to_string()]);
    assert_eq!(queue.stored_records(EntityType::Goal).unwrap(), 1);
    assert!(queue
      .storage
      .get("pending-corrupt:goal:g9")
      .unwrap()
      .is_some_and(|raw| raw.contains("weight")));
    assert_eq!(queue.count(&mut ledger, EntityType::Goal).unwrap(), 1);
  }

  #[test]
  fn test_decode_errors_name_the_direction() {
    let (queue, _) = queue();
    queue.storage.set("pending:team:t1", "[1,").unwrap();
    let err = match queue.load("pending:team:t1") {
      Err(e) => e,
      Ok(_) => panic!("expected a decode error"),
    };
    assert!(matches!(err, QueueError::Decode { .. }));
    assert!(err.to_string().starts_with("Failed to decode"));
  }

  #[test]
  fn test_ids_may_contain_separator() {
    let (queue, _) = queue();
    let mut ledger = SyncLedger::new();
    queue
      .enqueue(&mut ledger, "org:42", goal(json!({"progress": 1})))
      .unwrap();

    assert!(queue.list_pending(&mut ledger, EntityType::Goal).contains_key("org:42"));
  }
}
