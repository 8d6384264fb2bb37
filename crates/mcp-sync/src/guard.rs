//! Feedback-loop suppression.
//!
//! Every local mutation of an external source marks the guard. Reconciliation
//! stays out while the cooldown since the last mark has not elapsed, so the
//! manager does not react to its own writes. One guard is shared by every
//! component of a process; cross-process coordination is out of scope.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Reads tokio's clock, so paused-time tests drive the cooldown.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

#[derive(Debug)]
struct GuardState {
    last_operation_at: Option<Instant>,
    cooldown: Duration,
}

impl GuardState {
    fn quiet_at(&self, now: Instant) -> bool {
        match self.last_operation_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.cooldown,
        }
    }
}

pub struct OperationGuard {
    state: Mutex<GuardState>,
    clock: Arc<dyn Clock>,
}

impl OperationGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self::with_clock(cooldown, Arc::new(TokioClock))
    }

    pub fn with_clock(cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(GuardState {
                last_operation_at: None,
                cooldown,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Record that a local mutation is about to happen.
    pub fn mark_operation_start(&self) {
        let mut state = self.lock();
        state.last_operation_at = Some(self.clock.now());
        tracing::debug!("local operation marked");
    }

    /// True when no local mutation happened within the cooldown.
    pub fn is_sync_safe(&self) -> bool {
        let state = self.lock();
        state.quiet_at(self.clock.now())
    }

    /// True when no local mutation was marked after `since` and the cooldown
    /// has elapsed. Checked again right before a reconciliation applies what
    /// it detected from snapshots taken at `since`.
    pub fn quiet_since(&self, since: Instant) -> bool {
        let state = self.lock();
        let untouched = state.last_operation_at.is_none_or(|at| at <= since);
        untouched && state.quiet_at(self.clock.now())
    }

    /// Time left until the cooldown elapses, if any.
    pub fn remaining(&self) -> Option<Duration> {
        let state = self.lock();
        let at = state.last_operation_at?;
        let elapsed = self.clock.now().saturating_duration_since(at);
        state.cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

impl Default for OperationGuard {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Clock advanced by hand.
    pub(crate) struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        pub(crate) fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;

    #[test]
    fn fresh_guard_is_safe() {
        let guard = OperationGuard::with_clock(DEFAULT_COOLDOWN, ManualClock::new());
        assert!(guard.is_sync_safe());
        assert_eq!(guard.remaining(), None);
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let clock = ManualClock::new();
        let guard = OperationGuard::with_clock(Duration::from_secs(2), clock.clone());
        guard.mark_operation_start();
        assert!(!guard.is_sync_safe());
        clock.advance(Duration::from_millis(1500));
        assert!(!guard.is_sync_safe());
        assert_eq!(guard.remaining(), Some(Duration::from_millis(500)));
        clock.advance(Duration::from_millis(500));
        assert!(guard.is_sync_safe());
    }

    #[test]
    fn mark_after_snapshot_start_is_not_quiet() {
        let clock = ManualClock::new();
        let guard = OperationGuard::with_clock(Duration::ZERO, clock.clone());
        let started = guard.now();
        assert!(guard.quiet_since(started));
        clock.advance(Duration::from_millis(10));
        guard.mark_operation_start();
        assert!(guard.is_sync_safe());
        assert!(!guard.quiet_since(started));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let guard = OperationGuard::new(Duration::from_secs(2));
        guard.mark_operation_start();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!guard.is_sync_safe());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(guard.is_sync_safe());
    }

    #[test]
    fn concurrent_marks_are_serialized() {
        let guard = Arc::new(OperationGuard::with_clock(
            Duration::from_secs(60),
            ManualClock::new(),
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = guard.clone();
                std::thread::spawn(move || {
                    g.mark_operation_start();
                    g.is_sync_safe()
                })
            })
            .collect();
        for h in handles {
            assert!(!h.join().unwrap());
        }
    }
}
