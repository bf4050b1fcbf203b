//! Offline cache and sync layer for the strategic planning dashboard.
//!
//! Reads go through an expiring, size-bounded [`cache::TtlCache`]; writes
//! made while disconnected are queued and replayed by a
//! [`sync::SyncEngine`] when the [`sync::ConnectivityMonitor`] reports the
//! network is back. Both sit on the same [`cache::KeyValueStore`].

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod keys;
pub mod logging;
pub mod sync;

pub use cache::{KeyValueStore, TtlCache};
pub use config::Config;
pub use db::SqliteStore;
pub use sync::{ConnectivityMonitor, SyncEngine};
