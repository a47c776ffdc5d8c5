//! Progress mechanism
//!
//! There are no internal progress threads. Requests make progress only when their owner calls
//! `test` or `wait`, which advance the underlying schedule. A blocked waiter parks on the
//! engine between attempts; anything that changes runtime state asynchronously (a request
//! completing, a process failure disabling any-source receipt) calls `signal_completion` so
//! that parked waiters re-check immediately instead of sleeping out their interval.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Upper bound on how long a waiter sleeps between progress attempts.
pub(crate) const PARK_INTERVAL: Duration = Duration::from_micros(200);

/// Completion signalling shared by all requests of one `Universe`.
#[derive(Debug, Default)]
pub struct ProgressEngine {
    generation: Mutex<u64>,
    wakeup: Condvar,
    active: AtomicUsize,
}

impl ProgressEngine {
    /// A fresh engine with no posted requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests posted and not yet retired.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Number of completion signals raised so far.
    pub fn generation(&self) -> u64 {
        *self
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Wake every parked waiter.
    pub fn signal_completion(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.wakeup.notify_all();
    }

    /// Sleep until a completion is signalled after generation `seen`, or `timeout` elapses.
    pub fn park(&self, seen: u64, timeout: Duration) {
        let guard = self
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *guard != seen {
            return;
        }
        let _ = self.wakeup.wait_timeout_while(guard, timeout, |g| *g == seen);
    }

    pub(crate) fn post(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn retire(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.signal_completion();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn post_and_retire_track_active_requests() {
        let engine = ProgressEngine::new();
        engine.post();
        engine.post();
        assert_eq!(engine.active(), 2);
        let before = engine.generation();
        engine.retire();
        assert_eq!(engine.active(), 1);
        assert_eq!(engine.generation(), before + 1);
    }

    #[test]
    fn park_returns_early_on_signal() {
        let engine = Arc::new(ProgressEngine::new());
        let seen = engine.generation();
        let signaller = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                engine.signal_completion();
            })
        };
        let start = Instant::now();
        engine.park(seen, Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(10));
        signaller.join().unwrap();
    }

    #[test]
    fn park_with_stale_generation_does_not_sleep() {
        let engine = ProgressEngine::new();
        let seen = engine.generation();
        engine.signal_completion();
        let start = Instant::now();
        engine.park(seen, Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
