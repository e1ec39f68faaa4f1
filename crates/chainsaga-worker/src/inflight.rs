use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

struct Inner {
  started: Mutex<HashMap<u64, Instant>>,
  next_id: AtomicU64,
  count: watch::Sender<usize>,
}

impl Inner {
  fn started(&self) -> MutexGuard<'_, HashMap<u64, Instant>> {
    self.started.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Tracks the tasks a worker is currently running.
#[derive(Clone)]
pub struct InFlight {
  inner: Arc<Inner>,
}

impl Default for InFlight {
  fn default() -> Self {
    Self::new()
  }
}

impl InFlight {
  pub fn new() -> Self {
    let (count, _) = watch::channel(0);
    Self {
      inner: Arc::new(Inner {
        started: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(0),
        count,
      }),
    }
  }

  /// Register a task; it stays in flight until the guard is dropped.
  pub fn begin(&self) -> InFlightGuard {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let mut started = self.inner.started();
    started.insert(id, Instant::now());
    self.inner.count.send_replace(started.len());
    InFlightGuard {
      inner: self.inner.clone(),
      id,
    }
  }

  pub fn count(&self) -> usize {
    *self.inner.count.borrow()
  }

  /// Number of tasks in flight for longer than `timeout`.
  pub fn stalled(&self, timeout: Duration) -> usize {
    self
      .inner
      .started()
      .values()
      .filter(|started| started.elapsed() > timeout)
      .count()
  }

  /// Watch the in-flight count.
  pub fn subscribe(&self) -> watch::Receiver<usize> {
    self.inner.count.subscribe()
  }
}

/// Marks one task as in flight.
pub struct InFlightGuard {
  inner: Arc<Inner>,
  id: u64,
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    let mut started = self.inner.started();
    started.remove(&self.id);
    self.inner.count.send_replace(started.len());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_guards_track_count() {
    let in_flight = InFlight::new();
    let watcher = in_flight.subscribe();

    let first = in_flight.begin();
    let second = in_flight.begin();
    assert_eq!(in_flight.count(), 2);
    assert_eq!(*watcher.borrow(), 2);

    drop(first);
    assert_eq!(in_flight.count(), 1);
    drop(second);
    assert_eq!(in_flight.count(), 0);
  }

  #[test]
  fn test_stalled_counts_old_tasks() {
    let in_flight = InFlight::new();
    let _guard = in_flight.begin();

    assert_eq!(in_flight.stalled(Duration::from_secs(60)), 0);
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(in_flight.stalled(Duration::from_millis(1)), 1);
  }
}
