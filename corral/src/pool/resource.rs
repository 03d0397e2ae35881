//! Bounded pool of interchangeable resource handles.
//!
//! Handles are opaque tokens for units of some scarce resource (connections,
//! sessions, licenses). The pool enforces a fixed capacity, blocks checkouts
//! until a handle frees or a deadline passes, and serves blocked waiters in
//! arrival order.

use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error returned when a handle cannot be checked out or in
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// No handle became free within the checkout deadline
    #[error("checkout timed out after {0:?}")]
    Timeout(Duration),

    /// No handle is free right now (non-blocking checkout only)
    #[error("resource pool exhausted")]
    Exhausted,

    /// The handle is not an outstanding handle of this pool
    #[error("handle does not belong to this pool")]
    InvalidHandle,

    /// The pool was shut down while the caller was waiting
    #[error("checkout cancelled: resource pool is shut down")]
    Cancelled,
}

/// Configuration for a resource pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of handles the pool hands out; fixed for the pool's lifetime
    pub capacity: usize,

    /// Default deadline for blocking checkouts
    pub checkout_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            checkout_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time snapshot of pool occupancy and counters
#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    /// Configured capacity
    pub capacity: usize,

    /// Handles currently free
    pub free: usize,

    /// Handles currently checked out
    pub outstanding: usize,

    /// Callers currently blocked in checkout
    pub waiting: usize,

    /// Total successful checkouts
    pub checkouts: usize,

    /// Total checkins (explicit and via drop)
    pub checkins: usize,

    /// Checkouts that failed on the deadline
    pub timeouts: usize,

    /// Longest time a successful checkout spent waiting (microseconds)
    pub max_wait_time_us: u64,
}

/// Mutable pool state guarded by the pool mutex
struct PoolState {
    /// Free handle slots, oldest return first
    free: VecDeque<usize>,

    /// Which slots are currently checked out
    outstanding: Vec<bool>,

    /// Tickets of blocked checkouts in arrival order
    waiters: VecDeque<u64>,

    /// Whether the pool has been shut down
    shutdown: bool,
}

/// A bounded pool of opaque resource handles.
///
/// The pool owns `capacity` slots. At any instant
/// `free + outstanding == capacity`; checkouts beyond capacity block until a
/// handle is returned or the deadline passes. Waiters are granted handles
/// strictly in arrival order.
pub struct ResourcePool {
    /// Slot and waiter bookkeeping
    state: Mutex<PoolState>,

    /// Signalled whenever a handle frees or the pool shuts down
    available: Condvar,

    /// Configuration for this pool
    config: PoolConfig,

    /// Next waiter ticket
    next_ticket: AtomicU64,

    /// Total successful checkouts
    checkouts: AtomicUsize,

    /// Total checkins
    checkins: AtomicUsize,

    /// Checkouts that hit the deadline
    timeouts: AtomicUsize,

    /// Longest wait of a successful checkout (microseconds)
    max_wait_time_us: AtomicUsize,
}

impl ResourcePool {
    /// Create a new pool with the specified configuration.
    ///
    /// `config.capacity` must be at least 1.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        assert!(config.capacity > 0, "pool capacity must be at least 1");

        info!("Creating resource pool with capacity {}", config.capacity);

        Arc::new(Self {
            state: Mutex::new(PoolState {
                free: (0..config.capacity).collect(),
                outstanding: vec![false; config.capacity],
                waiters: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            config,
            next_ticket: AtomicU64::new(0),
            checkouts: AtomicUsize::new(0),
            checkins: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
            max_wait_time_us: AtomicUsize::new(0),
        })
    }

    /// Create a new pool with the given capacity and default timeouts.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Self::new(PoolConfig {
            capacity,
            ..Default::default()
        })
    }

    /// Check out a handle, blocking up to the configured default deadline.
    pub fn checkout(self: &Arc<Self>) -> Result<ResourceHandle, PoolError> {
        self.checkout_with_timeout(self.config.checkout_timeout)
    }

    /// Check out a handle, blocking up to `timeout`.
    ///
    /// On timeout the caller's place in the waiter queue is released and no
    /// other state changes; the error is reported, never retried internally.
    pub fn checkout_with_timeout(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<ResourceHandle, PoolError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();

        if state.shutdown {
            return Err(PoolError::Cancelled);
        }

        state.waiters.push_back(ticket);

        loop {
            if state.shutdown {
                Self::remove_waiter(&mut state, ticket);
                return Err(PoolError::Cancelled);
            }

            if let Some(handle) = self.try_grant(&mut state, ticket, started) {
                return Ok(handle);
            }

            if self.available.wait_until(&mut state, deadline).timed_out() {
                // A handle may have freed between the deadline and reacquiring
                // the lock; grant it if this waiter is at the front.
                if let Some(handle) = self.try_grant(&mut state, ticket, started) {
                    return Ok(handle);
                }

                Self::remove_waiter(&mut state, ticket);
                self.timeouts.fetch_add(1, Ordering::Relaxed);

                // The departed waiter may have been blocking the front of the
                // queue; let the rest re-check.
                self.available.notify_all();

                warn!(
                    "checkout timed out after {:.2}ms ({} waiting)",
                    timeout.as_secs_f64() * 1000.0,
                    state.waiters.len()
                );

                return Err(PoolError::Timeout(timeout));
            }
        }
    }

    /// Check out a handle without blocking.
    ///
    /// Fails with [`PoolError::Exhausted`] when no handle is free or when
    /// earlier callers are already queued (a non-blocking checkout never
    /// jumps the FIFO queue).
    pub fn try_checkout(self: &Arc<Self>) -> Result<ResourceHandle, PoolError> {
        let mut state = self.state.lock();

        if state.shutdown {
            return Err(PoolError::Cancelled);
        }

        if !state.waiters.is_empty() {
            return Err(PoolError::Exhausted);
        }

        match state.free.pop_front() {
            Some(slot) => {
                state.outstanding[slot] = true;
                self.checkouts.fetch_add(1, Ordering::Relaxed);
                trace!("checkout granted: slot {} (non-blocking)", slot);
                Ok(ResourceHandle::new(slot, Arc::downgrade(self)))
            }
            None => Err(PoolError::Exhausted),
        }
    }

    /// Return a handle to the pool.
    ///
    /// Fails with [`PoolError::InvalidHandle`] if the handle was not checked
    /// out from this pool; in that case the handle still returns to its own
    /// pool when dropped.
    pub fn checkin(&self, mut handle: ResourceHandle) -> Result<(), PoolError> {
        let owner = handle.pool.upgrade().ok_or(PoolError::InvalidHandle)?;

        if !std::ptr::eq(Arc::as_ptr(&owner), self as *const _) {
            // Wrong pool: leave the handle intact so its drop returns it home.
            return Err(PoolError::InvalidHandle);
        }

        match handle.slot.take() {
            Some(slot) => self.release(slot),
            None => Err(PoolError::InvalidHandle),
        }
    }

    /// Shut down the pool.
    ///
    /// Every blocked checkout fails with [`PoolError::Cancelled`], as does
    /// any later checkout. Outstanding handles may still be returned.
    pub fn shutdown(&self) {
        info!("Shutting down resource pool");

        let mut state = self.state.lock();
        state.shutdown = true;
        self.available.notify_all();
    }

    /// Configured capacity of the pool.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Number of handles currently free.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of handles currently checked out.
    pub fn outstanding_count(&self) -> usize {
        let state = self.state.lock();
        state.outstanding.iter().filter(|o| **o).count()
    }

    /// Consistent snapshot of occupancy and counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();

        PoolStats {
            capacity: self.config.capacity,
            free: state.free.len(),
            outstanding: state.outstanding.iter().filter(|o| **o).count(),
            waiting: state.waiters.len(),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            checkins: self.checkins.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            max_wait_time_us: self.max_wait_time_us.load(Ordering::Relaxed) as u64,
        }
    }

    /// Grant a free slot to `ticket` if it is at the front of the queue
    fn try_grant(
        self: &Arc<Self>,
        state: &mut PoolState,
        ticket: u64,
        started: Instant,
    ) -> Option<ResourceHandle> {
        if state.waiters.front() != Some(&ticket) {
            return None;
        }

        let slot = state.free.pop_front()?;
        state.waiters.pop_front();
        state.outstanding[slot] = true;

        let waited = started.elapsed();
        self.checkouts.fetch_add(1, Ordering::Relaxed);
        self.update_max_wait(waited.as_micros() as usize);

        // More handles may be free; let the next waiter re-check.
        self.available.notify_all();

        trace!(
            "checkout granted: slot {} (waited {:.2}ms)",
            slot,
            waited.as_secs_f64() * 1000.0
        );

        Some(ResourceHandle::new(slot, Arc::downgrade(self)))
    }

    /// Return a slot to the free list and wake waiters
    fn release(&self, slot: usize) -> Result<(), PoolError> {
        let mut state = self.state.lock();

        if slot >= state.outstanding.len() || !state.outstanding[slot] {
            return Err(PoolError::InvalidHandle);
        }

        state.outstanding[slot] = false;
        state.free.push_back(slot);
        self.checkins.fetch_add(1, Ordering::Relaxed);

        trace!("checkin: slot {} ({} waiting)", slot, state.waiters.len());

        self.available.notify_all();
        Ok(())
    }

    /// Drop `ticket` from the waiter queue
    fn remove_waiter(state: &mut PoolState, ticket: u64) {
        if let Some(pos) = state.waiters.iter().position(|t| *t == ticket) {
            state.waiters.remove(pos);
        }
    }

    /// Update the max-wait counter using compare-and-swap
    fn update_max_wait(&self, wait_time_us: usize) {
        let mut current_max = self.max_wait_time_us.load(Ordering::Relaxed);

        while wait_time_us > current_max {
            match self.max_wait_time_us.compare_exchange(
                current_max,
                wait_time_us,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_max = actual,
            }
        }
    }
}

/// An exclusively-owned token for one unit of the pooled resource.
///
/// Dropping the handle returns it to its pool; [`ResourcePool::checkin`]
/// does the same explicitly and reports misuse.
pub struct ResourceHandle {
    /// Slot index inside the owning pool; None once checked in
    slot: Option<usize>,

    /// The pool this handle came from
    pool: Weak<ResourcePool>,

    /// When this handle was checked out
    acquired_at: Instant,
}

impl ResourceHandle {
    /// Create a new handle for `slot`
    fn new(slot: usize, pool: Weak<ResourcePool>) -> Self {
        Self {
            slot: Some(slot),
            pool,
            acquired_at: Instant::now(),
        }
    }

    /// Slot index of this handle, for logging and diagnostics.
    pub fn slot(&self) -> usize {
        self.slot.expect("handle already checked in")
    }

    /// Time since this handle was checked out.
    pub fn held_duration(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Some(pool) = self.pool.upgrade() {
                if pool.release(slot).is_err() {
                    warn!("dropped handle for slot {} was not outstanding", slot);
                }
            } else {
                debug!("dropped handle for slot {} after its pool was gone", slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_checkout_checkin_basic() {
        let pool = ResourcePool::with_capacity(2);

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.outstanding_count(), 2);

        assert!(matches!(pool.try_checkout(), Err(PoolError::Exhausted)));

        pool.checkin(a).unwrap();
        assert_eq!(pool.free_count(), 1);

        let c = pool.checkout().unwrap();
        drop(b);
        drop(c);

        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[test]
    fn test_checkout_timeout_no_side_effects() {
        let pool = ResourcePool::with_capacity(1);
        let held = pool.checkout().unwrap();

        let result = pool.checkout_with_timeout(Duration::from_millis(50));
        assert!(matches!(result, Err(PoolError::Timeout(_))));

        let stats = pool.stats();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.free, 0);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.timeouts, 1);

        drop(held);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_drop_returns_handle() {
        let pool = ResourcePool::with_capacity(1);

        {
            let _handle = pool.checkout().unwrap();
            assert_eq!(pool.free_count(), 0);
        }

        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_checkin_wrong_pool() {
        let pool_a = ResourcePool::with_capacity(1);
        let pool_b = ResourcePool::with_capacity(1);

        let handle = pool_a.checkout().unwrap();
        let result = pool_b.checkin(handle);
        assert!(matches!(result, Err(PoolError::InvalidHandle)));

        // The misdirected handle was dropped by checkin and went home.
        assert_eq!(pool_a.free_count(), 1);
        assert_eq!(pool_b.free_count(), 1);
        assert_eq!(pool_b.outstanding_count(), 0);
    }

    #[test]
    fn test_blocked_checkout_wakes_on_checkin() {
        let pool = ResourcePool::with_capacity(1);
        let held = pool.checkout().unwrap();

        let pool_clone = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            pool_clone
                .checkout_with_timeout(Duration::from_secs(2))
                .map(|h| h.slot())
        });

        thread::sleep(Duration::from_millis(50));
        drop(held);

        let slot = waiter.join().unwrap().unwrap();
        assert_eq!(slot, 0);
        assert_eq!(pool.free_count(), 1);
    }

    // Capacity invariant: free + outstanding == capacity at every sample.
    #[test]
    fn test_capacity_invariant_under_churn() {
        let pool = ResourcePool::with_capacity(3);
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = vec![];
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            let stop = Arc::clone(&stop);
            handles.push(thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if let Ok(handle) = pool.checkout_with_timeout(Duration::from_millis(100)) {
                        thread::sleep(Duration::from_millis(2));
                        drop(handle);
                    }
                }
            }));
        }

        for _ in 0..50 {
            let stats = pool.stats();
            assert_eq!(stats.free + stats.outstanding, stats.capacity);
            thread::sleep(Duration::from_millis(2));
        }

        stop.store(true, Ordering::SeqCst);
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.free, 3);
        assert_eq!(stats.outstanding, 0);
    }

    // FIFO fairness: waiters are granted handles in arrival order.
    #[test]
    fn test_fifo_fairness() {
        let pool = ResourcePool::with_capacity(1);
        let held = pool.checkout().unwrap();
        let grant_order = Arc::new(Mutex::new(Vec::new()));

        let mut waiters = vec![];
        for i in 0..4 {
            let pool = Arc::clone(&pool);
            let grant_order = Arc::clone(&grant_order);

            waiters.push(thread::spawn(move || {
                let handle = pool.checkout_with_timeout(Duration::from_secs(5)).unwrap();
                grant_order.lock().push(i);
                thread::sleep(Duration::from_millis(10));
                drop(handle);
            }));

            // Stagger arrivals so queue order matches spawn order.
            thread::sleep(Duration::from_millis(40));
        }

        drop(held);
        for waiter in waiters {
            waiter.join().unwrap();
        }

        assert_eq!(*grant_order.lock(), vec![0, 1, 2, 3]);
    }

    // Cancellation cleanup: a waiter that never acquired releases nothing.
    #[test]
    fn test_shutdown_wakes_waiters() {
        let pool = ResourcePool::with_capacity(1);
        let held = pool.checkout().unwrap();

        let pool_clone = Arc::clone(&pool);
        let waiter = thread::spawn(move || pool_clone.checkout_with_timeout(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(50));
        pool.shutdown();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(PoolError::Cancelled)));

        // The cancelled waiter held nothing and left nothing behind.
        let stats = pool.stats();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.outstanding, 1);

        drop(held);
        assert!(matches!(pool.try_checkout(), Err(PoolError::Cancelled)));
    }
}
