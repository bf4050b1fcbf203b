//! Replays queued changes against the remote service once connectivity allows.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connectivity::ConnectivityMonitor;
use super::entity::{EntityPatch, EntityType};
use super::queue::{PendingBatch, PendingQueue};
use super::remote::RemoteBackend;
use super::state::{SyncLedger, SyncState};
use crate::cache::{EvictionReport, KeyValueStore, TtlCache};
use crate::error::{QueueError, RemoteError, SyncError};

/// Default bound on a single remote update call.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(15);

/// One entity type whose queue was fully replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeFlush {
  pub entity_type: EntityType,
  pub entities: usize,
  pub patches: usize,
}

/// One entity type whose queue was kept because replay failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeFailure {
  pub entity_type: EntityType,
  /// Record being dispatched when the failure happened
  pub entity_id: Option<String>,
  pub reason: String,
  /// Patches confirmed before the failure; these were acknowledged
  pub dispatched: usize,
}

/// Outcome of a [`SyncEngine::flush_all`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub flushed: Vec<TypeFlush>,
  pub failed: Vec<TypeFailure>,
  /// Types another flush was already working on
  pub skipped: Vec<EntityType>,
  /// Records this build could not decode, moved aside unsent
  pub quarantined: Vec<(EntityType, String)>,
  pub eviction: Option<EvictionReport>,
}

impl SyncReport {
  pub fn patches_flushed(&self) -> usize {
    self.flushed.iter().map(|f| f.patches).sum()
  }
}

/// Releases claimed entity types when a flush ends, however it ends.
struct FlushGuard<'a> {
  in_flight: &'a Mutex<BTreeSet<EntityType>>,
  types: Vec<EntityType>,
}

impl Drop for FlushGuard<'_> {
  fn drop(&mut self) {
    let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    for t in &self.types {
      in_flight.remove(t);
    }
  }
}

/// Result of replaying one entity type.
struct Replay {
  /// Confirmed patch count per entity id
  dispatched: BTreeMap<String, usize>,
  failure: Option<(Option<String>, String)>,
}

/// Orchestrates flushing the pending-change queue to the remote service.
///
/// Sync state lives in this instance, not in process-wide statics, so
/// separate engines never see each other's counters.
pub struct SyncEngine<S: KeyValueStore, R: RemoteBackend> {
  queue: PendingQueue<S>,
  cache: TtlCache<S>,
  remote: Arc<R>,
  monitor: ConnectivityMonitor,
  ledger: Mutex<SyncLedger>,
  in_flight: Mutex<BTreeSet<EntityType>>,
  dispatch_timeout: Duration,
}

impl<S: KeyValueStore, R: RemoteBackend> SyncEngine<S, R> {
  /// Create an engine over the cache's substrate.
  ///
  /// Change counts are rebuilt from whatever the queue already holds, so a
  /// restarted process still reports unflushed work.
  pub fn new(cache: TtlCache<S>, remote: Arc<R>, monitor: ConnectivityMonitor) -> Self {
    let queue = PendingQueue::new(Arc::clone(cache.storage()), Arc::clone(cache.clock()));
    let ledger = queue.rebuild_ledger();
    if ledger.total_changes() > 0 {
      info!(pending = ledger.total_changes(), "Restored pending changes from storage");
    }

    Self {
      queue,
      cache,
      remote,
      monitor,
      ledger: Mutex::new(ledger),
      in_flight: Mutex::new(BTreeSet::new()),
      dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
    }
  }

  pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
    self.dispatch_timeout = timeout;
    self
  }

  pub fn queue(&self) -> &PendingQueue<S> {
    &self.queue
  }

  pub fn cache(&self) -> &TtlCache<S> {
    &self.cache
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.monitor
  }

  fn ledger(&self) -> MutexGuard<'_, SyncLedger> {
    self.ledger.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn sync_state(&self, entity_type: EntityType) -> SyncState {
    self.ledger().state(entity_type)
  }

  /// Copy of the sync state for every entity type.
  pub fn snapshot(&self) -> SyncLedger {
    self.ledger().clone()
  }

  /// Queue a change for later replay.
  pub fn enqueue(&self, entity_id: &str, patch: EntityPatch) -> Result<(), QueueError> {
    let mut ledger = self.ledger();
    self.queue.enqueue(&mut ledger, entity_id, patch)
  }

  pub fn list_pending(&self, entity_type: EntityType) -> PendingBatch {
    let mut ledger = self.ledger();
    self.queue.list_pending(&mut ledger, entity_type)
  }

  pub fn pending_for(&self, entity_type: EntityType, entity_id: &str) -> Vec<EntityPatch> {
    let mut ledger = self.ledger();
    self.queue.pending_for(&mut ledger, entity_type, entity_id)
  }

  pub fn clear(&self, entity_type: EntityType, entity_id: Option<&str>) -> Result<(), QueueError> {
    let mut ledger = self.ledger();
    self.queue.clear(&mut ledger, entity_type, entity_id)
  }

  fn claim(&self) -> FlushGuard<'_> {
    let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    let types = EntityType::ALL
      .into_iter()
      .filter(|t| in_flight.insert(*t))
      .collect();
    FlushGuard {
      in_flight: &self.in_flight,
      types,
    }
  }

  /// Send every queued change to the remote service.
  ///
  /// Entity types are independent: a failure keeps that type's queue for a
  /// later retry while the other types still flush. Fails with
  /// [`SyncError::Unavailable`] when offline, without touching any queue.
  pub async fn flush_all(&self) -> Result<SyncReport, SyncError> {
    if !self.monitor.is_online() {
      warn!("Sync requested while offline");
      return Err(SyncError::Unavailable);
    }

    let guard = self.claim();
    let mut report = SyncReport {
      skipped: EntityType::ALL
        .into_iter()
        .filter(|t| !guard.types.contains(t))
        .collect(),
      ..Default::default()
    };
    if !report.skipped.is_empty() {
      debug!(skipped = ?report.skipped, "Flush already in progress for some types");
    }

    for &entity_type in &guard.types {
      match self.queue.quarantine_unreadable(entity_type) {
        Ok(ids) => {
          for id in ids {
            warn!(%entity_type, entity_id = %id, "Unreadable pending record set aside");
            report.quarantined.push((entity_type, id));
          }
        }
        Err(e) => warn!(%entity_type, error = %e, "Failed to set aside unreadable records"),
      }

      let replay = self.replay(entity_type).await;
      let dispatched: usize = replay.dispatched.values().sum();
      let entities = replay.dispatched.len();
      let succeeded = replay.failure.is_none();

      match (self.settle(entity_type, &replay.dispatched, succeeded), replay.failure) {
        (Ok(()), None) => {
          if dispatched > 0 {
            info!(%entity_type, entities, patches = dispatched, "Flushed pending changes");
          }
          report.flushed.push(TypeFlush {
            entity_type,
            entities,
            patches: dispatched,
          });
        }
        (settled, Some((entity_id, reason))) => {
          if let Err(e) = settled {
            warn!(%entity_type, error = %e, "Failed to acknowledge dispatched changes");
          }
          warn!(
            %entity_type,
            entity_id = ?entity_id,
            reason = %reason,
            "Sync failed, keeping queue"
          );
          report.failed.push(TypeFailure {
            entity_type,
            entity_id,
            reason,
            dispatched,
          });
        }
        (Err(e), None) => {
          warn!(%entity_type, error = %e, "Failed to clear flushed changes");
          report.failed.push(TypeFailure {
            entity_type,
            entity_id: None,
            reason: e.to_string(),
            dispatched,
          });
        }
      }
    }
    drop(guard);

    report.eviction = self.cache.evict_if_needed();

    if report.failed.is_empty() {
      Ok(report)
    } else {
      Err(SyncError::PartialFailure { report })
    }
  }

  /// Dispatch one type's queue, one entity at a time, patches in order.
  async fn replay(&self, entity_type: EntityType) -> Replay {
    let mut dispatched = BTreeMap::new();
    let listed = {
      let mut ledger = self.ledger();
      self.queue.try_list_pending(&mut ledger, entity_type)
    };
    let batch = match listed {
      Ok(batch) => batch,
      Err(e) => {
        return Replay {
          dispatched,
          failure: Some((None, e.to_string())),
        }
      }
    };

    for (entity_id, patches) in batch {
      for patch in &patches {
        if let Err(e) = self.dispatch(entity_type, &entity_id, patch).await {
          debug!(
            %entity_type,
            entity_id = %entity_id,
            transient = e.is_transient(),
            "Dispatch failed"
          );
          return Replay {
            dispatched,
            failure: Some((Some(entity_id), e.to_string())),
          };
        }
        *dispatched.entry(entity_id.clone()).or_insert(0) += 1;
      }
    }

    Replay {
      dispatched,
      failure: None,
    }
  }

  async fn dispatch(
    &self,
    entity_type: EntityType,
    entity_id: &str,
    patch: &EntityPatch,
  ) -> Result<(), RemoteError> {
    if !self.monitor.is_online() {
      return Err(RemoteError::Disconnected);
    }
    match tokio::time::timeout(
      self.dispatch_timeout,
      self.remote.update(entity_type, entity_id, patch),
    )
    .await
    {
      Ok(result) => result,
      Err(_) => Err(RemoteError::Timeout(self.dispatch_timeout)),
    }
  }

  /// Drop what the remote confirmed. A type with no stored records left is
  /// cleared and marked synced; patches queued mid-flush and records that
  /// could not be read stay for the next run.
  fn settle(
    &self,
    entity_type: EntityType,
    dispatched: &BTreeMap<String, usize>,
    succeeded: bool,
  ) -> Result<(), QueueError> {
    let mut ledger = self.ledger();
    for (entity_id, &count) in dispatched {
      self
        .queue
        .acknowledge(&mut ledger, entity_type, entity_id, count)?;
    }
    if !succeeded {
      return Ok(());
    }

    let remaining = self.queue.count(&mut ledger, entity_type)?;
    if remaining == 0 && self.queue.stored_records(entity_type)? == 0 {
      self.queue.clear(&mut ledger, entity_type, None)
    } else {
      ledger.mark_synced(entity_type, self.cache.clock().now_millis(), remaining);
      Ok(())
    }
  }
}

impl<S: KeyValueStore + 'static, R: RemoteBackend + 'static> SyncEngine<S, R> {
  /// Flush automatically on every offline-to-online transition.
  ///
  /// The task runs until aborted through the returned handle.
  pub fn spawn_reconnect_handler(self: &Arc<Self>) -> JoinHandle<()> {
    let engine = Arc::clone(self);
    let mut online_rx = engine.monitor.watch();
    tokio::spawn(async move {
      while online_rx.changed().await.is_ok() {
        if !*online_rx.borrow_and_update() {
          continue;
        }
        match engine.flush_all().await {
          Ok(report) => info!(
            patches = report.patches_flushed(),
            "Reconnect sync complete"
          ),
          Err(e) => warn!(error = %e, "Reconnect sync incomplete"),
        }
      }
    })
  }
}
