//! Offline mutation queue and its reconciliation with the remote service.
//!
//! Mutations made while disconnected are queued per record, counted per
//! entity type, and replayed oldest-first by the [`SyncEngine`] when the
//! [`ConnectivityMonitor`] reports the network is back.

mod connectivity;
mod engine;
mod entity;
mod queue;
mod remote;
mod state;

pub use connectivity::{ConnectivityMonitor, Subscription};
pub use engine::{SyncEngine, SyncReport, TypeFailure, TypeFlush, DEFAULT_DISPATCH_TIMEOUT};
pub use entity::{
  AnalyticsPatch, DashboardPatch, EntityPatch, EntityType, GoalPatch, GoalStatus,
  OrganizationPatch, Priority, TeamMemberPatch, TeamPatch,
};
pub use queue::{PendingBatch, PendingQueue, CORRUPT_PREFIX};
pub use remote::{HttpBackend, RemoteBackend};
pub use state::{SyncLedger, SyncState};
