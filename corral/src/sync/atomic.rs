//! Atomic cancellation and concurrency-tracking primitives.
//!
//! Provides lock-free building blocks used by the pool, registry, and
//! worker modules.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A set-once cancellation flag shared between a controller and the
/// operations it may need to abort.
///
/// Blocking operations in this crate poll the token at their wakeup points,
/// so a cancelled waiter observes the signal within a bounded interval.
#[derive(Debug, Default)]
pub struct CancelToken {
    /// Whether cancellation has been requested
    cancelled: AtomicBool,
}

impl CancelToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }

    /// Request cancellation.
    ///
    /// Returns true if this call was the one that set the flag, false if the
    /// token was already cancelled.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait for the token to be cancelled, returning true if it was
    /// cancelled within the timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        while !self.is_cancelled() {
            if start.elapsed() >= timeout {
                return false;
            }

            // Short sleep to avoid spinning
            std::thread::sleep(Duration::from_micros(50));
        }

        true
    }
}

/// Tracks how many callers are inside a region concurrently, along with the
/// peak ever observed.
///
/// Entry hands back a [`GaugeGuard`] so the count drops on every exit path,
/// including panics.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    /// Number of callers currently inside the region
    current: AtomicUsize,

    /// Highest concurrent count observed
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    /// Create a new gauge with zero occupancy.
    pub fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Enter the region, returning a guard that exits on drop.
    pub fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_peak(now);

        GaugeGuard {
            gauge: Arc::clone(self),
        }
    }

    /// Number of callers currently inside the region.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest concurrent count ever observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Update the peak using compare-and-swap
    fn update_peak(&self, candidate: usize) {
        let mut current_max = self.peak.load(Ordering::Relaxed);

        while candidate > current_max {
            match self.peak.compare_exchange(
                current_max,
                candidate,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_max = actual,
            }
        }
    }
}

/// RAII guard returned by [`ConcurrencyGauge::enter`].
#[derive(Debug)]
pub struct GaugeGuard {
    /// The gauge this guard decrements on drop
    gauge: Arc<ConcurrencyGauge>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_token_basic() {
        let token = CancelToken::new();

        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(token.is_cancelled());

        // Second cancel is a no-op
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_token_single_winner() {
        let token = Arc::new(CancelToken::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];

        for _ in 0..5 {
            let token = Arc::clone(&token);
            let winners = Arc::clone(&winners);

            handles.push(thread::spawn(move || {
                if token.cancel() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_token_wait() {
        let token = Arc::new(CancelToken::new());
        let token_clone = Arc::clone(&token);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token_clone.cancel();
        });

        assert!(token.wait(Duration::from_millis(500)));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_token_wait_timeout() {
        let token = CancelToken::new();
        assert!(!token.wait(Duration::from_millis(20)));
    }

    #[test]
    fn test_gauge_basic() {
        let gauge = Arc::new(ConcurrencyGauge::new());

        assert_eq!(gauge.current(), 0);

        {
            let _a = gauge.enter();
            let _b = gauge.enter();
            assert_eq!(gauge.current(), 2);
        }

        assert_eq!(gauge.current(), 0);
        assert_eq!(gauge.peak(), 2);
    }

    #[test]
    fn test_gauge_peak_across_threads() {
        let gauge = Arc::new(ConcurrencyGauge::new());
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let mut handles = vec![];

        for _ in 0..8 {
            let gauge = Arc::clone(&gauge);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let _guard = gauge.enter();
                // Hold until every thread is inside the region at once.
                barrier.wait();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(gauge.current(), 0);
        assert_eq!(gauge.peak(), 8);
    }
}
