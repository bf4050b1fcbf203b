//! Online/offline tracking driven by platform transition events.
//!
//! Nothing here polls. The platform adaptor calls [`ConnectivityMonitor::notify`]
//! whenever the network signal changes and listeners fire on real transitions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{info, warn};

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Listener {
  on_online: Callback,
  on_offline: Callback,
}

struct Inner {
  online: AtomicBool,
  next_id: AtomicU64,
  listeners: Mutex<BTreeMap<u64, Listener>>,
  state_tx: watch::Sender<bool>,
}

impl Inner {
  fn remove_listener(&self, id: u64) {
    let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
    listeners.remove(&id);
  }
}

/// Cheaply cloneable handle to the shared connectivity state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<Inner>,
}

impl ConnectivityMonitor {
  /// Start with the platform's current reachability.
  pub fn new(online: bool) -> Self {
    let (state_tx, _) = watch::channel(online);
    Self {
      inner: Arc::new(Inner {
        online: AtomicBool::new(online),
        next_id: AtomicU64::new(0),
        listeners: Mutex::new(BTreeMap::new()),
        state_tx,
      }),
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  /// Feed a platform signal. Repeated signals with the same value are ignored.
  pub fn notify(&self, online: bool) {
    if self.inner.online.swap(online, Ordering::SeqCst) == online {
      return;
    }

    if online {
      info!("Network reachable again");
    } else {
      warn!("Network unreachable, switching to offline mode");
    }
    self.inner.state_tx.send_replace(online);

    // Snapshot so callbacks may subscribe or unsubscribe without deadlocking
    let callbacks: Vec<Callback> = {
      let listeners = self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
      listeners
        .values()
        .map(|l| {
          if online {
            Arc::clone(&l.on_online)
          } else {
            Arc::clone(&l.on_offline)
          }
        })
        .collect()
    };
    for callback in callbacks {
      callback();
    }
  }

  /// Register transition callbacks. They stay registered until the returned
  /// [`Subscription`] is unsubscribed or dropped.
  pub fn subscribe<F, G>(&self, on_online: F, on_offline: G) -> Subscription
  where
    F: Fn() + Send + Sync + 'static,
    G: Fn() + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
    self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(
        id,
        Listener {
          on_online: Arc::new(on_online),
          on_offline: Arc::new(on_offline),
        },
      );

    Subscription {
      id,
      monitor: Arc::downgrade(&self.inner),
      active: AtomicBool::new(true),
    }
  }

  /// Async view of the online flag for tasks that await transitions.
  pub fn watch(&self) -> watch::Receiver<bool> {
    self.inner.state_tx.subscribe()
  }

  pub fn listener_count(&self) -> usize {
    self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .len()
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

impl std::fmt::Debug for ConnectivityMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectivityMonitor")
      .field("online", &self.is_online())
      .field("listeners", &self.listener_count())
      .finish()
  }
}

/// Registration handle returned by [`ConnectivityMonitor::subscribe`].
pub struct Subscription {
  id: u64,
  monitor: Weak<Inner>,
  active: AtomicBool,
}

impl Subscription {
  /// Remove both callbacks. Safe to call any number of times.
  pub fn unsubscribe(&self) {
    if !self.active.swap(false, Ordering::SeqCst) {
      return;
    }
    if let Some(inner) = self.monitor.upgrade() {
      inner.remove_listener(self.id);
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
  }

  #[test]
  fn test_fires_only_on_transitions() {
    let monitor = ConnectivityMonitor::new(true);
    let (ups, downs) = counters();
    let (u, d) = (ups.clone(), downs.clone());
    let _sub = monitor.subscribe(
      move || {
        u.fetch_add(1, Ordering::SeqCst);
      },
      move || {
        d.fetch_add(1, Ordering::SeqCst);
      },
    );

    monitor.notify(true);
    assert_eq!(ups.load(Ordering::SeqCst), 0);

    monitor.notify(false);
    monitor.notify(false);
    assert!(!monitor.is_online());
    assert_eq!(downs.load(Ordering::SeqCst), 1);

    monitor.notify(true);
    assert!(monitor.is_online());
    assert_eq!(ups.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_unsubscribe_is_idempotent() {
    let monitor = ConnectivityMonitor::new(false);
    let (ups, _) = counters();
    let u = ups.clone();
    let sub = monitor.subscribe(
      move || {
        u.fetch_add(1, Ordering::SeqCst);
      },
      || {},
    );
    let _other = monitor.subscribe(|| {}, || {});
    assert_eq!(monitor.listener_count(), 2);

    sub.unsubscribe();
    sub.unsubscribe();
    assert_eq!(monitor.listener_count(), 1);

    monitor.notify(true);
    assert_eq!(ups.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_drop_unsubscribes() {
    let monitor = ConnectivityMonitor::default();
    {
      let _sub = monitor.subscribe(|| {}, || {});
      assert_eq!(monitor.listener_count(), 1);
    }
    assert_eq!(monitor.listener_count(), 0);
  }

  #[test]
  fn test_subscription_outlives_monitor() {
    let monitor = ConnectivityMonitor::default();
    let sub = monitor.subscribe(|| {}, || {});
    drop(monitor);
    sub.unsubscribe();
  }

  #[tokio::test]
  async fn test_watch_sees_transitions() {
    let monitor = ConnectivityMonitor::new(false);
    let mut rx = monitor.watch();
    assert!(!*rx.borrow());

    monitor.notify(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
  }
}
