//! Deduplication of concurrent work on the same key.
//!
//! The first caller for a key becomes the leader and runs the work; later
//! callers wait on a `watch` channel for the leader's result. The registry
//! entry is removed before the result is published, so a caller arriving
//! after completion starts fresh work instead of reading a stale result.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

struct Flight<V> {
    id: u64,
    result: watch::Receiver<Option<V>>,
}

struct Registry<K, V> {
    flights: Mutex<HashMap<K, Flight<V>>>,
    next_id: AtomicU64,
}

enum Role<V> {
    Leader {
        id: u64,
        sender: watch::Sender<Option<V>>,
    },
    Waiter(watch::Receiver<Option<V>>),
}

/// Registry of in-flight work keyed by `K`, yielding shared results `V`.
pub struct SingleFlight<K, V> {
    inner: Arc<Registry<K, V>>,
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Registry {
                flights: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Number of keys with work in progress.
    pub fn in_flight(&self) -> usize {
        self.flights().len()
    }

    /// Runs `work` inline when this caller leads.
    ///
    /// Dropping the leader's future abandons the work; waiters then retry and
    /// one of them becomes the new leader.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            match self.join(&key) {
                Role::Waiter(receiver) => {
                    if let Some(value) = wait(receiver).await {
                        return value;
                    }
                }
                Role::Leader { id, sender } => {
                    let guard = FlightGuard {
                        registry: self.clone(),
                        key: key.clone(),
                        id,
                    };
                    let value = work().await;
                    drop(guard);
                    sender.send_replace(Some(value.clone()));
                    return value;
                }
            }
        }
    }

    /// Runs `work` on a spawned task when this caller leads.
    ///
    /// The work completes even if every caller, the leader included, drops
    /// its future. A panicking or cancelled task publishes `recover(reason)`
    /// to every waiter instead.
    pub async fn run_detached<F, Fut, R>(&self, key: K, work: F, recover: R) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
        R: Fn(String) -> V + Send + Sync + 'static,
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        loop {
            match self.join(&key) {
                Role::Waiter(receiver) => {
                    if let Some(value) = wait(receiver).await {
                        return value;
                    }
                }
                Role::Leader { id, sender } => {
                    let receiver = sender.subscribe();
                    let guard = FlightGuard {
                        registry: self.clone(),
                        key: key.clone(),
                        id,
                    };
                    let recover = Arc::new(recover);
                    let publish = Arc::clone(&recover);
                    let task = tokio::spawn(work());
                    tokio::spawn(async move {
                        let value = match task.await {
                            Ok(value) => value,
                            Err(error) if error.is_panic() => {
                                (*publish)(String::from("task panicked"))
                            }
                            Err(_) => (*publish)(String::from("task was cancelled")),
                        };
                        drop(guard);
                        sender.send_replace(Some(value));
                    });

                    return match wait(receiver).await {
                        Some(value) => value,
                        None => (*recover)(String::from("task was dropped before publishing")),
                    };
                }
            }
        }
    }

    fn join(&self, key: &K) -> Role<V> {
        let mut flights = self.flights();
        if let Some(flight) = flights.get(key) {
            return Role::Waiter(flight.result.clone());
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        flights.insert(
            key.clone(),
            Flight {
                id,
                result: receiver,
            },
        );
        Role::Leader { id, sender }
    }

    fn finish(&self, key: &K, id: u64) {
        let mut flights = self.flights();
        if flights.get(key).is_some_and(|flight| flight.id == id) {
            flights.remove(key);
        }
    }

    fn flights(&self) -> std::sync::MutexGuard<'_, HashMap<K, Flight<V>>> {
        self.inner
            .flights
            .lock()
            .expect("single-flight registry should not be poisoned")
    }
}

async fn wait<V: Clone>(mut receiver: watch::Receiver<Option<V>>) -> Option<V> {
    match receiver.wait_for(Option::is_some).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    }
}

/// Removes the registry entry when the leader finishes or is dropped.
struct FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    registry: SingleFlight<K, V>,
    key: K,
    id: u64,
}

impl<K, V> Drop for FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        self.registry.finish(&self.key, self.id);
    }
}
