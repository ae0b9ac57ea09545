//! # Expiring Cache
//!
//! A get-or-create store with time-to-live expiry, optional sliding
//! expiration, and at-most-one creation in flight per key.
//!
//! This is not an LRU: entries are dropped strictly by age or inactivity.
//!
//! ## Creation de-duplication
//!
//! A miss stores the creation future itself (shared, tagged with a
//! generation) under the key before anyone awaits it. Concurrent callers for
//! the same key clone that shared future instead of starting their own, so
//! `create` runs once and everyone observes the same value or the same error.
//! Whoever sees the result first settles the slot: success becomes a ready
//! entry, failure removes the key so the next call retries.
//!
//! A creation nobody is waiting for any more, or one still running when the
//! TTL runs out, is dropped so the key does not stay stuck behind it.
//!
//! ```rust
//! use segment_tracker::{Cache, CacheOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> segment_tracker::Result<()> {
//! let cache: Cache<String, u32> = Cache::default();
//! let options = CacheOptions::sliding(600);
//!
//! let v = cache.get_or_create("answer".to_string(), options, || async { Ok(42) }).await?;
//! assert_eq!(v, 42);
//!
//! // Second call is a hit; the closure is never run.
//! let v = cache.get_or_create("answer".to_string(), options, || async { Ok(0) }).await?;
//! assert_eq!(v, 42);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Result, TrackerError};

/// Default entry lifetime in seconds.
pub const DEFAULT_TTL_SECS: u64 = 600;

/// Default interval between background sweeps in seconds.
pub const DEFAULT_CHECK_PERIOD_SECS: u64 = 120;

/// Per-entry expiry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Lifetime in seconds. 0 keeps the entry until invalidated.
    pub ttl_secs: u64,
    /// Reset the remaining lifetime on every hit.
    pub sliding_expiration: bool,
}

impl CacheOptions {
    /// Lifetime counted from creation only.
    pub fn absolute(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            sliding_expiration: false,
        }
    }

    /// Lifetime reset on every hit.
    pub fn sliding(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            sliding_expiration: true,
        }
    }

    fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::absolute(DEFAULT_TTL_SECS)
    }
}

type PendingValue<V> = Shared<BoxFuture<'static, Result<V>>>;

enum Slot<V> {
    Ready {
        value: V,
        expires_at: Option<Instant>,
        options: CacheOptions,
    },
    Pending {
        generation: u64,
        future: PendingValue<V>,
        options: CacheOptions,
        /// A creation still running past the TTL is given up on
        deadline: Option<Instant>,
        /// Callers currently awaiting `future`
        waiters: usize,
    },
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        match self {
            Slot::Ready {
                expires_at: Some(at),
                ..
            }
            | Slot::Pending {
                deadline: Some(at), ..
            } => *at <= now,
            _ => false,
        }
    }
}

struct CacheState<K, V> {
    slots: HashMap<K, Slot<V>>,
    next_generation: u64,
}

enum Lookup<V> {
    Hit(V),
    Pending(u64, PendingValue<V>),
    Miss,
}

/// A shared, expiring get-or-create cache.
///
/// Cloning is cheap and every clone sees the same entries.
pub struct Cache<K, V> {
    state: Arc<Mutex<CacheState<K, V>>>,
    check_period: Duration,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            check_period: self.check_period,
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache whose background sweeper (if spawned) runs every `check_period`.
    pub fn new(check_period: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                slots: HashMap::new(),
                next_generation: 0,
            })),
            check_period,
        }
    }

    /// Return the live value for `key`, or create it with `create`.
    ///
    /// At most one `create` runs per key at a time; concurrent callers await
    /// the same result. A failed creation is returned to every waiter and
    /// leaves no entry behind.
    ///
    /// An in-flight creation is abandoned once every waiter has dropped its
    /// future, or once it outlives the TTL. The next call then creates afresh.
    /// `create` runs outside the cache lock and may use the cache itself.
    pub async fn get_or_create<F, Fut>(&self, key: K, options: CacheOptions, create: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (generation, future, creator) = {
            let mut state = self.lock();
            let now = Instant::now();
            match Self::lookup(&mut state, &key, now) {
                Lookup::Hit(value) => return Ok(value),
                Lookup::Pending(generation, future) => {
                    if let Some(Slot::Pending { waiters, .. }) = state.slots.get_mut(&key) {
                        *waiters += 1;
                    }
                    debug!("[Cache] Joining in-flight creation");
                    (generation, future, None)
                }
                Lookup::Miss => {
                    let generation = state.next_generation;
                    state.next_generation += 1;

                    // The real future is handed over once the lock is released
                    let (tx, rx) = oneshot::channel::<BoxFuture<'static, Result<V>>>();
                    let future = async move {
                        match rx.await {
                            Ok(creation) => creation.await,
                            Err(_) => Err(TrackerError::Cancelled {
                                message: "cache entry creation was abandoned".to_string(),
                            }),
                        }
                    }
                    .boxed()
                    .shared();

                    state.slots.insert(
                        key.clone(),
                        Slot::Pending {
                            generation,
                            future: future.clone(),
                            options,
                            deadline: options.ttl().map(|ttl| now + ttl),
                            waiters: 1,
                        },
                    );
                    debug!("[Cache] Creating entry (generation {})", generation);
                    (generation, future, Some(tx))
                }
            }
        };

        let mut waiter = Waiter {
            cache: self,
            key: &key,
            generation,
            settled: false,
        };
        if let Some(tx) = creator {
            // Cannot fail: `future` holds the receiver
            let _ = tx.send(create().boxed());
        }

        let result = future.await;
        self.settle(&key, generation, &result);
        waiter.settled = true;
        result
    }

    /// Return the live value for `key` without creating one.
    ///
    /// Counts as a hit for sliding expiration. In-flight creations are not
    /// awaited and read as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        match Self::lookup(&mut state, key, Instant::now()) {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }

    /// Store a value directly, replacing any entry (ready or in flight).
    pub fn insert(&self, key: K, value: V, options: CacheOptions) {
        let now = Instant::now();
        self.lock().slots.insert(
            key,
            Slot::Ready {
                value,
                expires_at: options.ttl().map(|ttl| now + ttl),
                options,
            },
        );
    }

    /// Remove a specific key from the cache.
    pub fn invalidate(&self, key: &K) {
        self.lock().slots.remove(key);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        Self::purge(&self.state)
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        self.lock().slots.clear();
    }

    /// Number of entries, including expired ones not yet swept and
    /// in-flight creations.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    /// Check if the cache holds a live value for `key`. Does not refresh it.
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        matches!(
            self.lock().slots.get(key),
            Some(slot @ Slot::Ready { .. }) if !slot.is_expired(now)
        )
    }

    /// Spawn a tokio task that purges expired entries every check period.
    ///
    /// The task holds only a weak reference and exits once every clone of
    /// the cache has been dropped. Must be called from within a runtime.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let state: Weak<Mutex<CacheState<K, V>>> = Arc::downgrade(&self.state);
        let period = self.check_period;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                let removed = Self::purge(&state);
                if removed > 0 {
                    debug!("[Cache] Sweep removed {} expired entries", removed);
                }
            }
        })
    }

    fn lookup(state: &mut CacheState<K, V>, key: &K, now: Instant) -> Lookup<V> {
        let expired = match state.slots.get_mut(key) {
            None => return Lookup::Miss,
            Some(slot) if slot.is_expired(now) => true,
            Some(Slot::Pending {
                generation, future, ..
            }) => return Lookup::Pending(*generation, future.clone()),
            Some(Slot::Ready {
                value,
                expires_at,
                options,
            }) => {
                if options.sliding_expiration {
                    *expires_at = options.ttl().map(|ttl| now + ttl);
                }
                return Lookup::Hit(value.clone());
            }
        };

        if expired {
            state.slots.remove(key);
        }
        Lookup::Miss
    }

    fn settle(&self, key: &K, generation: u64, result: &Result<V>) {
        let mut state = self.lock();
        let options = match state.slots.get(key) {
            Some(Slot::Pending {
                generation: current,
                options,
                ..
            }) if *current == generation => *options,
            // Already settled by another waiter, or replaced
            _ => return,
        };

        match result {
            Ok(value) => {
                let expires_at = options.ttl().map(|ttl| Instant::now() + ttl);
                state.slots.insert(
                    key.clone(),
                    Slot::Ready {
                        value: value.clone(),
                        expires_at,
                        options,
                    },
                );
            }
            Err(e) => {
                debug!("[Cache] Creation failed, discarding entry: {}", e);
                state.slots.remove(key);
            }
        }
    }

    fn purge(state: &Mutex<CacheState<K, V>>) -> usize {
        let now = Instant::now();
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.slots.len();
        state.slots.retain(|_, slot| !slot.is_expired(now));
        before - state.slots.len()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks one caller awaiting an in-flight creation. When the last caller
/// goes away before the creation settles, the slot is dropped with it.
struct Waiter<'a, K: Eq + Hash, V> {
    cache: &'a Cache<K, V>,
    key: &'a K,
    generation: u64,
    settled: bool,
}

impl<K: Eq + Hash, V> Drop for Waiter<'_, K, V> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let mut state = self.cache.state.lock().unwrap_or_else(PoisonError::into_inner);
        let abandoned = match state.slots.get_mut(self.key) {
            Some(Slot::Pending {
                generation, waiters, ..
            }) if *generation == self.generation => {
                *waiters = waiters.saturating_sub(1);
                *waiters == 0
            }
            _ => false,
        };
        if abandoned {
            debug!("[Cache] Every waiter left, abandoning creation (generation {})", self.generation);
            state.slots.remove(self.key);
        }
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CHECK_PERIOD_SECS))
    }
}
