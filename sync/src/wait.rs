//! Atomic wait/notify cell.
//!
//! `wait(expected, timeout)` parks the calling thread only while the cell still
//! holds `expected`. The value check and the park happen under the same
//! internal mutex that notifiers take before signalling, so a notify issued
//! after the value changed can never be lost.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a notify (or spuriously); re-check the value.
    Woken,
    /// The cell no longer held the expected value.
    Mismatch,
    TimedOut,
}

#[derive(Debug, Default)]
pub struct WaitCell {
    value: AtomicU32,
    park: Mutex<()>,
    cond: Condvar,
}

impl WaitCell {
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
            park: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// The state word. Mutate it through the atomic, then notify.
    #[must_use]
    pub fn atomic(&self) -> &AtomicU32 {
        &self.value
    }

    #[must_use]
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    fn park(&self) -> MutexGuard<'_, ()> {
        self.park.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block while the cell holds `expected`, up to `timeout` (`None` waits
    /// indefinitely).
    pub fn wait(&self, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let guard = self.park();
        if self.value.load(Ordering::Acquire) != expected {
            return WaitOutcome::Mismatch;
        }
        match deadline {
            None => {
                drop(self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner));
                WaitOutcome::Woken
            }
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return WaitOutcome::TimedOut;
                }
                let (_guard, result) = self
                    .cond
                    .wait_timeout(guard, remaining)
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() {
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Woken
                }
            }
        }
    }

    pub fn notify_one(&self) {
        drop(self.park());
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        drop(self.park());
        self.cond.notify_all();
    }
}
