use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use super::signal::NetworkSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
  Online,
  Offline,
}

impl NetworkState {
  pub fn is_online(self) -> bool {
    self == NetworkState::Online
  }
}

impl From<bool> for NetworkState {
  fn from(online: bool) -> Self {
    if online {
      NetworkState::Online
    } else {
      NetworkState::Offline
    }
  }
}

impl fmt::Display for NetworkState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NetworkState::Online => f.write_str("online"),
      NetworkState::Offline => f.write_str("offline"),
    }
  }
}

type Listener = Arc<dyn Fn(NetworkState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
  next_id: u64,
  by_id: BTreeMap<u64, Listener>,
}

struct Shared {
  state: watch::Sender<NetworkState>,
  listeners: Mutex<Listeners>,
  debounce: Duration,
}

/// Debounced view of connectivity.
///
/// Cloning is cheap; all clones observe the same state and listeners.
#[derive(Clone)]
pub struct NetworkMonitor {
  shared: Arc<Shared>,
}

impl NetworkMonitor {
  pub fn new(initial: NetworkState, debounce: Duration) -> Self {
    let (state, _) = watch::channel(initial);
    Self {
      shared: Arc::new(Shared {
        state,
        listeners: Mutex::new(Listeners::default()),
        debounce,
      }),
    }
  }

  pub fn is_online(&self) -> bool {
    self.state().is_online()
  }

  pub fn state(&self) -> NetworkState {
    *self.shared.state.borrow()
  }

  /// Register a listener called once per settled transition.
  ///
  /// Listeners run on the monitor's task and must not block. They may register
  /// or drop subscriptions themselves. The listener is removed when the
  /// returned [`Subscription`] is dropped or unsubscribed.
  #[must_use = "dropping the subscription unsubscribes the listener"]
  pub fn on_change<F>(&self, listener: F) -> Subscription
  where
    F: Fn(NetworkState) + Send + Sync + 'static,
  {
    let mut listeners = self.lock_listeners();
    let id = listeners.next_id;
    listeners.next_id += 1;
    listeners.by_id.insert(id, Arc::new(listener));

    Subscription {
      id,
      shared: Arc::downgrade(&self.shared),
    }
  }

  /// Async view of the settled state, for task consumers.
  pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
    self.shared.state.subscribe()
  }

  /// Consume raw readings from `signal` until it is exhausted.
  ///
  /// A reading that differs from the published state opens a quiet window.
  /// Readings that flip the candidate value inside the window restart it;
  /// when the window closes the settled value is published only if it still
  /// differs, so flapping collapses to at most one transition.
  pub fn drive<S: NetworkSignal>(&self, mut signal: S) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let window = monitor.shared.debounce;

      while let Some(reading) = signal.next_reading().await {
        let mut candidate = NetworkState::from(reading);
        if candidate == monitor.state() {
          continue;
        }

        let mut deadline = Instant::now() + window;
        let mut exhausted = false;
        loop {
          match timeout_at(deadline, signal.next_reading()).await {
            Err(_) => break,
            Ok(None) => {
              exhausted = true;
              break;
            }
            Ok(Some(next)) => {
              let next = NetworkState::from(next);
              if next != candidate {
                debug!(from = %candidate, to = %next, "connectivity flapped, restarting debounce window");
                candidate = next;
                deadline = Instant::now() + window;
              }
            }
          }
        }

        monitor.publish(candidate);
        if exhausted {
          break;
        }
      }

      debug!("network signal exhausted");
    })
  }

  fn publish(&self, state: NetworkState) {
    if self.state() == state {
      return;
    }
    info!(%state, "connectivity changed");
    self.shared.state.send_replace(state);

    // Call outside the lock so a listener can touch the registry.
    let listeners: Vec<Listener> = self.lock_listeners().by_id.values().cloned().collect();
    for listener in listeners {
      listener(state);
    }
  }

  fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Listeners> {
    self
      .shared
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }
}

/// Handle returned by [`NetworkMonitor::on_change`].
pub struct Subscription {
  id: u64,
  shared: Weak<Shared>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work.
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(shared) = self.shared.upgrade() {
      shared
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .by_id
        .remove(&self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::ChannelSignal;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::time::sleep;

  const WINDOW: Duration = Duration::from_millis(500);

  fn counting(monitor: &NetworkMonitor) -> (Arc<AtomicUsize>, Subscription) {
    let online_events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&online_events);
    let sub = monitor.on_change(move |state| {
      if state.is_online() {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });
    (online_events, sub)
  }

  #[tokio::test(start_paused = true)]
  async fn test_single_transition_emits_once() {
    let monitor = NetworkMonitor::new(NetworkState::Offline, WINDOW);
    let (events, _sub) = counting(&monitor);
    let (tx, signal) = ChannelSignal::new();
    monitor.drive(signal);

    tx.send(true).unwrap();
    tx.send(true).unwrap();
    sleep(WINDOW * 2).await;
    tx.send(true).unwrap();
    sleep(WINDOW * 2).await;

    assert!(monitor.is_online());
    assert_eq!(events.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_flapping_collapses() {
    let monitor = NetworkMonitor::new(NetworkState::Offline, WINDOW);
    let (events, _sub) = counting(&monitor);
    let (tx, signal) = ChannelSignal::new();
    monitor.drive(signal);

    for online in [true, false, true, false, true] {
      tx.send(online).unwrap();
      sleep(Duration::from_millis(50)).await;
    }
    assert!(!monitor.is_online(), "state must not change inside the window");

    sleep(WINDOW * 2).await;
    assert!(monitor.is_online());
    assert_eq!(events.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_flap_back_to_same_state_emits_nothing() {
    let monitor = NetworkMonitor::new(NetworkState::Online, WINDOW);
    let changes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&changes);
    let _sub = monitor.on_change(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    let (tx, signal) = ChannelSignal::new();
    monitor.drive(signal);

    tx.send(false).unwrap();
    sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();
    sleep(WINDOW * 2).await;

    assert!(monitor.is_online());
    assert_eq!(changes.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unsubscribe_stops_notifications() {
    let monitor = NetworkMonitor::new(NetworkState::Offline, WINDOW);
    let (events, sub) = counting(&monitor);
    let (tx, signal) = ChannelSignal::new();
    monitor.drive(signal);

    sub.unsubscribe();
    tx.send(true).unwrap();
    sleep(WINDOW * 2).await;

    assert!(monitor.is_online());
    assert_eq!(events.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_watch_receiver_sees_transition() {
    let monitor = NetworkMonitor::new(NetworkState::Offline, WINDOW);
    let mut rx = monitor.subscribe();
    let (tx, signal) = ChannelSignal::new();
    monitor.drive(signal);

    tx.send(true).unwrap();
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), NetworkState::Online);
  }

  #[tokio::test(start_paused = true)]
  async fn test_listener_can_change_subscriptions() {
    let monitor = NetworkMonitor::new(NetworkState::Offline, WINDOW);
    let own: Arc<Mutex<Option<Subscription>>> = Arc::default();
    let added: Arc<Mutex<Vec<Subscription>>> = Arc::default();
    let later = Arc::new(AtomicUsize::new(0));

    let sub = {
      let own = Arc::clone(&own);
      let added = Arc::clone(&added);
      let later = Arc::clone(&later);
      let registry = monitor.clone();
      monitor.on_change(move |_| {
        // Unsubscribe ourselves and leave a replacement behind.
        own.lock().unwrap().take();
        let later = Arc::clone(&later);
        let replacement = registry.on_change(move |_| {
          later.fetch_add(1, Ordering::SeqCst);
        });
        added.lock().unwrap().push(replacement);
      })
    };
    *own.lock().unwrap() = Some(sub);

    let (tx, signal) = ChannelSignal::new();
    monitor.drive(signal);

    tx.send(true).unwrap();
    sleep(WINDOW * 2).await;
    assert!(monitor.is_online());
    assert!(own.lock().unwrap().is_none());
    assert_eq!(added.lock().unwrap().len(), 1);

    tx.send(false).unwrap();
    sleep(WINDOW * 2).await;
    assert!(!monitor.is_online());
    assert_eq!(later.load(Ordering::SeqCst), 1);
    assert_eq!(added.lock().unwrap().len(), 1);
  }
}
