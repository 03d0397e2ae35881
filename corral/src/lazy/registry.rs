//! Once-only construction of named shared components.
//!
//! Each key owns an independent state machine: the first caller to reach an
//! unstarted key claims ownership and runs the initializer with no lock
//! held; every concurrent caller for the same key blocks until the owner
//! publishes a value or a failure, then shares the cached outcome. A single
//! registry-wide critical section is deliberately absent: it would couple
//! unrelated initializations and is the root cause of the stall this crate
//! exists to prevent.

use crate::sync::CancelToken;
use dashmap::DashMap;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Interval at which blocked requesters recheck deadlines and cancellation
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Error returned when a component cannot be served
#[derive(Error, Debug, Clone)]
pub enum LazyError {
    /// The owning initializer did not publish within the deadline
    #[error("initialization of '{key}' timed out after {timeout:?}")]
    Timeout {
        /// Component key that was being waited on
        key: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// The owning thread re-requested the key it is initializing
    #[error("cyclic initialization of '{0}'")]
    Cycle(String),

    /// The initializer failed; the failure is cached and re-surfaced
    #[error("initializer for '{key}' failed: {message}")]
    Failed {
        /// Component key whose initializer failed
        key: String,
        /// Failure description from the initializer or panic payload
        message: String,
    },

    /// Initialization was cancelled before a value was produced
    #[error("initialization of '{0}' was cancelled")]
    Cancelled(String),
}

/// Configuration for a lazy registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a requester waits for another thread's in-flight
    /// initialization before giving up
    pub init_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
        }
    }
}

/// Point-in-time snapshot of registry counters
#[derive(Debug, Default, Clone)]
pub struct RegistryStats {
    /// Number of keys the registry has seen
    pub keys: usize,

    /// Initializations that published a value
    pub initialized: usize,

    /// Initializations that published a failure
    pub failures: usize,

    /// Requests served from an already-published value
    pub cached_hits: usize,

    /// Re-entrant same-key requests rejected
    pub cycles_detected: usize,
}

/// Per-key initialization state
enum EntryState<T> {
    /// No caller has claimed this key yet
    Unstarted,

    /// One caller is running the initializer
    Initializing {
        /// Thread that owns the in-flight initialization
        owner: ThreadId,
    },

    /// The initializer published a value
    Ready(Arc<T>),

    /// The initializer published a failure; cached, never re-run
    Failed(LazyError),
}

/// One key's state machine plus the condvar its waiters block on
struct Slot<T> {
    /// Current state, guarded per key
    state: Mutex<EntryState<T>>,

    /// Signalled when the owner publishes Ready or Failed
    published: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState::Unstarted),
            published: Condvar::new(),
        }
    }
}

/// A keyed once-only initializer for shared components.
///
/// Values are published as `Arc<T>` and shared read-only by every caller.
/// Lock granularity is per key: initializing key A never blocks a lookup of
/// key B, and creating a new key's slot takes only a short sharded map
/// operation.
pub struct LazyRegistry<T> {
    /// Key to slot map; sharded, so unrelated keys do not contend
    entries: DashMap<String, Arc<Slot<T>>>,

    /// Configuration for this registry
    config: RegistryConfig,

    /// Initializations that published a value
    initialized: AtomicUsize,

    /// Initializations that published a failure
    failures: AtomicUsize,

    /// Requests served from a published value
    cached_hits: AtomicUsize,

    /// Re-entrant same-key requests rejected
    cycles_detected: AtomicUsize,
}

impl<T> Default for LazyRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LazyRegistry<T> {
    /// Create a registry with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with the specified configuration.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            initialized: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            cached_hits: AtomicUsize::new(0),
            cycles_detected: AtomicUsize::new(0),
        }
    }

    /// Return the component for `key`, constructing it on first access.
    ///
    /// The initializer runs at most once per key, with no registry lock
    /// held. Concurrent requesters for the same key block until the owner
    /// publishes, bounded by the configured init timeout; a published
    /// failure is cached and re-surfaced to every later caller without
    /// re-running the initializer. A re-entrant request for the key by its
    /// own initializer fails fast with [`LazyError::Cycle`].
    pub fn get_or_init<F>(&self, key: &str, init: F) -> Result<Arc<T>, LazyError>
    where
        F: FnOnce() -> Result<T, String>,
    {
        self.get_or_init_inner(key, None, init)
    }

    /// Like [`get_or_init`](Self::get_or_init), but observing a
    /// cancellation token.
    ///
    /// A cancelled owner publishes `Failed(Cancelled)` instead of running
    /// the initializer, waking every waiter with that failure; a cancelled
    /// waiter returns [`LazyError::Cancelled`] without touching the entry.
    pub fn get_or_init_cancellable<F>(
        &self,
        key: &str,
        cancel: &CancelToken,
        init: F,
    ) -> Result<Arc<T>, LazyError>
    where
        F: FnOnce() -> Result<T, String>,
    {
        self.get_or_init_inner(key, Some(cancel), init)
    }

    /// Whether `key` currently holds a published value.
    pub fn is_ready(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(slot) => matches!(*slot.state.lock(), EntryState::Ready(_)),
            None => false,
        }
    }

    /// Number of keys the registry has seen.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has seen no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time snapshot of registry counters.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            keys: self.entries.len(),
            initialized: self.initialized.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cached_hits: self.cached_hits.load(Ordering::Relaxed),
            cycles_detected: self.cycles_detected.load(Ordering::Relaxed),
        }
    }

    fn get_or_init_inner<F>(
        &self,
        key: &str,
        cancel: Option<&CancelToken>,
        init: F,
    ) -> Result<Arc<T>, LazyError>
    where
        F: FnOnce() -> Result<T, String>,
    {
        let deadline = Instant::now() + self.config.init_timeout;
        let me = thread::current().id();

        // Clone the slot out so no map shard lock is held while blocking.
        let slot = {
            let entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Slot::new()));
            Arc::clone(entry.value())
        };

        let mut state = slot.state.lock();

        loop {
            match &*state {
                EntryState::Ready(value) => {
                    self.cached_hits.fetch_add(1, Ordering::Relaxed);
                    trace!("'{}' served from cache", key);
                    return Ok(Arc::clone(value));
                }
                EntryState::Failed(err) => {
                    trace!("'{}' re-surfacing cached failure", key);
                    return Err(err.clone());
                }
                EntryState::Initializing { owner } if *owner == me => {
                    self.cycles_detected.fetch_add(1, Ordering::Relaxed);
                    warn!("cyclic initialization of '{}' detected", key);
                    return Err(LazyError::Cycle(key.to_string()));
                }
                EntryState::Initializing { .. } => {
                    if let Some(token) = cancel {
                        if token.is_cancelled() {
                            return Err(LazyError::Cancelled(key.to_string()));
                        }
                    }

                    // Wait in slices so cancellation is observed promptly.
                    let slice_end = std::cmp::min(deadline, Instant::now() + WAIT_SLICE);
                    let timed_out = slot.published.wait_until(&mut state, slice_end).timed_out();

                    if timed_out
                        && Instant::now() >= deadline
                        && matches!(&*state, EntryState::Initializing { .. })
                    {
                        warn!(
                            "gave up waiting for initialization of '{}' after {:.2}ms",
                            key,
                            self.config.init_timeout.as_secs_f64() * 1000.0
                        );
                        return Err(LazyError::Timeout {
                            key: key.to_string(),
                            timeout: self.config.init_timeout,
                        });
                    }
                }
                EntryState::Unstarted => break,
            }
        }

        // Claim ownership and run the initializer with no lock held.
        *state = EntryState::Initializing { owner: me };
        drop(state);

        if let Some(token) = cancel {
            if token.is_cancelled() {
                let err = LazyError::Cancelled(key.to_string());
                self.failures.fetch_add(1, Ordering::Relaxed);
                Self::publish(&slot, EntryState::Failed(err.clone()));
                debug!("'{}' cancelled before its initializer ran", key);
                return Err(err);
            }
        }

        trace!("initializing '{}'", key);
        let started = Instant::now();

        match catch_unwind(AssertUnwindSafe(init)) {
            Ok(Ok(value)) => {
                let value = Arc::new(value);
                self.initialized.fetch_add(1, Ordering::Relaxed);
                Self::publish(&slot, EntryState::Ready(Arc::clone(&value)));
                debug!(
                    "'{}' ready after {:.2}ms",
                    key,
                    started.elapsed().as_secs_f64() * 1000.0
                );
                Ok(value)
            }
            Ok(Err(message)) => {
                let err = LazyError::Failed {
                    key: key.to_string(),
                    message,
                };
                self.failures.fetch_add(1, Ordering::Relaxed);
                Self::publish(&slot, EntryState::Failed(err.clone()));
                warn!("{}", err);
                Err(err)
            }
            Err(panic) => {
                let err = LazyError::Failed {
                    key: key.to_string(),
                    message: format!("initializer panicked: {}", panic_message(&*panic)),
                };
                self.failures.fetch_add(1, Ordering::Relaxed);
                Self::publish(&slot, EntryState::Failed(err.clone()));
                warn!("initializer for '{}' panicked", key);
                Err(err)
            }
        }
    }

    /// Publish the outcome and wake every waiter for the key
    fn publish(slot: &Slot<T>, outcome: EntryState<T>) {
        let mut state = slot.state.lock();
        *state = outcome;
        slot.published.notify_all();
    }
}

/// Best-effort description of a panic payload
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<unknown panic>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ConcurrencyGauge;

    // Idempotent caching: the initializer runs exactly once.
    #[test]
    fn test_init_runs_once() {
        let registry = LazyRegistry::new();
        let runs = AtomicUsize::new(0);

        let first = registry
            .get_or_init("config", || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(41)
            })
            .unwrap();

        let second = registry
            .get_or_init("config", || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(99)
            })
            .unwrap();

        assert_eq!(*first, 41);
        assert_eq!(*second, 41);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(registry.is_ready("config"));

        let stats = registry.stats();
        assert_eq!(stats.initialized, 1);
        assert_eq!(stats.cached_hits, 1);
    }

    // Mutual exclusion: at most one initializer per key runs concurrently.
    #[test]
    fn test_single_initializer_under_contention() {
        let registry = Arc::new(LazyRegistry::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let gauge = Arc::new(ConcurrencyGauge::new());

        let mut handles = vec![];
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let runs = Arc::clone(&runs);
            let gauge = Arc::clone(&gauge);

            handles.push(thread::spawn(move || {
                registry
                    .get_or_init("shared", move || {
                        let _inside = gauge.enter();
                        runs.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(7)
                    })
                    .map(|v| *v)
            }));
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 7);
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(gauge.peak(), 1);
    }

    // Different keys never contend with each other.
    #[test]
    fn test_keys_are_independent() {
        let registry = Arc::new(LazyRegistry::new());

        let slow_registry = Arc::clone(&registry);
        let slow = thread::spawn(move || {
            slow_registry.get_or_init("slow", || {
                thread::sleep(Duration::from_millis(200));
                Ok("slow".to_string())
            })
        });

        // Give the slow initializer time to claim its key.
        thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        let fast = registry
            .get_or_init("fast", || Ok("fast".to_string()))
            .unwrap();

        assert_eq!(*fast, "fast");
        assert!(started.elapsed() < Duration::from_millis(100));

        slow.join().unwrap().unwrap();
    }

    #[test]
    fn test_cycle_detection() {
        let registry = Arc::new(LazyRegistry::new());
        let inner_registry = Arc::clone(&registry);

        let result = registry.get_or_init("root", move || {
            match inner_registry.get_or_init("root", || Ok(0)) {
                Err(LazyError::Cycle(key)) => Err(format!("cycle on '{}'", key)),
                other => Err(format!("expected a cycle, got {:?}", other.map(|v| *v))),
            }
        });

        match result {
            Err(LazyError::Failed { message, .. }) => {
                assert!(message.contains("cycle on 'root'"));
            }
            other => panic!("expected Failed, got {:?}", other.map(|v| *v)),
        }

        assert_eq!(registry.stats().cycles_detected, 1);
    }

    #[test]
    fn test_failure_is_cached() {
        let registry = LazyRegistry::<u32>::new();
        let runs = AtomicUsize::new(0);

        let first = registry.get_or_init("broken", || {
            runs.fetch_add(1, Ordering::SeqCst);
            Err("no backend".to_string())
        });
        assert!(matches!(first, Err(LazyError::Failed { .. })));

        // A known-broken initializer must not re-run.
        let second = registry.get_or_init("broken", || {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });

        match second {
            Err(LazyError::Failed { key, message }) => {
                assert_eq!(key, "broken");
                assert!(message.contains("no backend"));
            }
            other => panic!("expected cached failure, got {:?}", other.map(|v| *v)),
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().failures, 1);
    }

    #[test]
    fn test_panic_is_cached_as_failure() {
        let registry = LazyRegistry::<u32>::new();

        let first = registry.get_or_init("explosive", || panic!("boom"));
        match first {
            Err(LazyError::Failed { message, .. }) => assert!(message.contains("boom")),
            other => panic!("expected Failed, got {:?}", other.map(|v| *v)),
        }

        let second = registry.get_or_init("explosive", || Ok(1));
        assert!(matches!(second, Err(LazyError::Failed { .. })));
    }

    #[test]
    fn test_waiter_times_out() {
        let registry = Arc::new(LazyRegistry::with_config(RegistryConfig {
            init_timeout: Duration::from_millis(100),
        }));

        let owner_registry = Arc::clone(&registry);
        let owner = thread::spawn(move || {
            owner_registry.get_or_init("slow", || {
                thread::sleep(Duration::from_millis(400));
                Ok(5)
            })
        });

        thread::sleep(Duration::from_millis(30));

        let waiter = registry.get_or_init("slow", || Ok(6));
        assert!(matches!(waiter, Err(LazyError::Timeout { .. })));

        // The owner is unaffected and publishes normally.
        assert_eq!(*owner.join().unwrap().unwrap(), 5);
        assert_eq!(*registry.get_or_init("slow", || Ok(7)).unwrap(), 5);
    }

    // Cancellation cleanup: a cancelled owner publishes Failed(Cancelled)
    // and every later requester observes that failure.
    #[test]
    fn test_cancelled_owner_publishes_failure() {
        let registry = LazyRegistry::<u32>::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = registry.get_or_init_cancellable("doomed", &cancel, || Ok(1));
        assert!(matches!(result, Err(LazyError::Cancelled(_))));

        let later = registry.get_or_init("doomed", || Ok(2));
        assert!(matches!(later, Err(LazyError::Cancelled(_))));
        assert!(!registry.is_ready("doomed"));
    }

    #[test]
    fn test_cancelled_waiter_returns_promptly() {
        let registry = Arc::new(LazyRegistry::new());
        let cancel = Arc::new(CancelToken::new());

        let owner_registry = Arc::clone(&registry);
        let owner = thread::spawn(move || {
            owner_registry.get_or_init("slow", || {
                thread::sleep(Duration::from_millis(300));
                Ok(9)
            })
        });

        thread::sleep(Duration::from_millis(30));

        let waiter_registry = Arc::clone(&registry);
        let waiter_cancel = Arc::clone(&cancel);
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let result = waiter_registry.get_or_init_cancellable("slow", &waiter_cancel, || Ok(0));
            (result, started.elapsed())
        });

        thread::sleep(Duration::from_millis(30));
        cancel.cancel();

        let (result, waited) = waiter.join().unwrap();
        assert!(matches!(result, Err(LazyError::Cancelled(_))));
        assert!(waited < Duration::from_millis(250));

        // The owner still publishes; the entry is not poisoned.
        assert_eq!(*owner.join().unwrap().unwrap(), 9);
        assert!(registry.is_ready("slow"));
    }
}
