//! Per-entity-type sync bookkeeping, held in memory by the sync engine.

use serde::Serialize;
use std::collections::BTreeMap;

use super::entity::EntityType;

/// Sync status of one entity type.
///
/// `pending_changes` is always `change_count > 0`; the fields are private so
/// the two can only move together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
  last_sync: i64,
  pending_changes: bool,
  change_count: usize,
}

impl SyncState {
  /// Epoch millis of the last successful flush, 0 if never synced
  pub fn last_sync(&self) -> i64 {
    self.last_sync
  }

  pub fn pending_changes(&self) -> bool {
    self.pending_changes
  }

  pub fn change_count(&self) -> usize {
    self.change_count
  }

  fn set_count(&mut self, count: usize) {
    self.change_count = count;
    self.pending_changes = count > 0;
  }
}

/// Sync state for every entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncLedger {
  states: BTreeMap<EntityType, SyncState>,
}

impl SyncLedger {
  pub fn new() -> Self {
    Self::default()
  }

  /// State for `entity_type`; `{0, false, 0}` if never touched.
  pub fn state(&self, entity_type: EntityType) -> SyncState {
    self.states.get(&entity_type).copied().unwrap_or_default()
  }

  pub fn iter(&self) -> impl Iterator<Item = (EntityType, SyncState)> + '_ {
    EntityType::ALL.into_iter().map(|t| (t, self.state(t)))
  }

  pub fn total_changes(&self) -> usize {
    self.states.values().map(|s| s.change_count).sum()
  }

  pub(crate) fn record_queued(&mut self, entity_type: EntityType, count: usize) {
    let state = self.states.entry(entity_type).or_default();
    state.set_count(state.change_count.saturating_add(count));
  }

  pub(crate) fn record_removed(&mut self, entity_type: EntityType, count: usize) {
    let state = self.states.entry(entity_type).or_default();
    state.set_count(state.change_count.saturating_sub(count));
  }

  pub(crate) fn set_count(&mut self, entity_type: EntityType, count: usize) {
    self.states.entry(entity_type).or_default().set_count(count);
  }

  pub(crate) fn mark_synced(&mut self, entity_type: EntityType, now_millis: i64, remaining: usize) {
    let state = self.states.entry(entity_type).or_default();
    state.last_sync = now_millis;
    state.set_count(remaining);
  }
}
