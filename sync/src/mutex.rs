//! Exclusive locks over a single `0 = free / 1 = held` state word.
//!
//! [`SharedMutex`] blocks the calling OS thread while it waits, so it must only
//! be used off interactive or async-executor threads. [`CooperativeMutex`]
//! exposes the same acquire/guard surface but suspends the task instead.

use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::context::ContextId;
use crate::error::LockError;
use crate::metrics::LockMetrics;
use crate::wait::WaitCell;

const FREE: u32 = 0;
const HELD: u32 = 1;

pub(crate) const ANONYMOUS: &str = "anonymous";

pub struct SharedMutex {
    name: String,
    cell: WaitCell,
    metrics: LockMetrics,
}

impl Default for SharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMutex")
            .field("name", &self.name)
            .field("held", &self.is_locked())
            .field("owner", &self.metrics.owner())
            .finish()
    }
}

impl SharedMutex {
    #[must_use]
    pub fn new() -> Self {
        Self::named(ANONYMOUS)
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cell: WaitCell::new(FREE),
            metrics: LockMetrics::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.cell.load() == HELD
    }

    fn try_cell(&self) -> bool {
        self.cell
            .atomic()
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn acquired(&self, started: Instant, contended: bool) -> MutexGuard<'_> {
        self.metrics.record_acquired(started.elapsed(), contended);
        self.metrics.set_owner(Some(ContextId::current()));
        MutexGuard {
            lock: self,
            acquired: Instant::now(),
        }
    }

    pub fn try_acquire(&self) -> Option<MutexGuard<'_>> {
        let started = Instant::now();
        self.try_cell().then(|| self.acquired(started, false))
    }

    /// Block until the lock is free.
    pub fn acquire(&self) -> MutexGuard<'_> {
        let started = Instant::now();
        let mut contended = false;
        loop {
            if self.try_cell() {
                return self.acquired(started, contended);
            }
            contended = true;
            self.cell.wait(HELD, None);
        }
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Result<MutexGuard<'_>, LockError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut contended = false;
        loop {
            if self.try_cell() {
                return Ok(self.acquired(started, contended));
            }
            contended = true;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out(&self.name, &self.metrics, started.elapsed()));
            }
            self.cell.wait(HELD, Some(remaining));
        }
    }

    /// Acquire without a guard. Pair with [`SharedMutex::unlock`] from the
    /// same context.
    pub fn lock(&self) {
        std::mem::forget(self.acquire());
    }

    /// Release a lock taken with [`SharedMutex::lock`].
    pub fn unlock(&self) -> Result<(), LockError> {
        let context = ContextId::current();
        if !self.is_locked() || self.metrics.owner() != Some(context) {
            return Err(LockError::NotHeld {
                lock: self.name.clone(),
                context: context.to_string(),
            });
        }
        self.release();
        Ok(())
    }

    fn release(&self) {
        self.metrics.set_owner(None);
        self.cell.atomic().store(FREE, Ordering::Release);
        self.cell.notify_one();
    }
}

pub(crate) fn timed_out(name: &str, metrics: &LockMetrics, waited: Duration) -> LockError {
    metrics.record_timeout(waited);
    tracing::warn!(
        lock = name,
        waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        owner = ?metrics.owner(),
        "Lock acquisition timed out"
    );
    LockError::Timeout {
        lock: name.to_string(),
        waited,
    }
}

/// Releases the [`SharedMutex`] on drop, waking one waiter.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct MutexGuard<'a> {
    lock: &'a SharedMutex,
    acquired: Instant,
}

impl MutexGuard<'_> {
    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.lock.metrics.record_released(self.acquired.elapsed());
        self.lock.release();
    }
}

impl fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard").field("lock", &self.lock.name).finish()
    }
}

/// Async counterpart of [`SharedMutex`] for executor threads.
pub struct CooperativeMutex {
    name: String,
    state: AtomicU32,
    notify: Notify,
    metrics: LockMetrics,
}

impl Default for CooperativeMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CooperativeMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CooperativeMutex")
            .field("name", &self.name)
            .field("held", &self.is_locked())
            .finish()
    }
}

impl CooperativeMutex {
    #[must_use]
    pub fn new() -> Self {
        Self::named(ANONYMOUS)
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU32::new(FREE),
            notify: Notify::new(),
            metrics: LockMetrics::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) == HELD
    }

    fn try_cell(&self) -> bool {
        self.state
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn acquired(&self, started: Instant, contended: bool) -> CooperativeGuard<'_> {
        self.metrics.record_acquired(started.elapsed(), contended);
        self.metrics.set_owner(Some(ContextId::current()));
        CooperativeGuard {
            lock: self,
            acquired: Instant::now(),
        }
    }

    pub fn try_acquire(&self) -> Option<CooperativeGuard<'_>> {
        let started = Instant::now();
        self.try_cell().then(|| self.acquired(started, false))
    }

    pub async fn acquire(&self) -> CooperativeGuard<'_> {
        let started = Instant::now();
        let mut contended = false;
        loop {
            // Register interest before checking, so a release between the
            // check and the await still wakes us.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.try_cell() {
                return self.acquired(started, contended);
            }
            contended = true;
            notified.await;
        }
    }

    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<CooperativeGuard<'_>, LockError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(timed_out(&self.name, &self.metrics, started.elapsed())),
        }
    }

    fn release(&self) {
        self.metrics.set_owner(None);
        self.state.store(FREE, Ordering::Release);
        self.notify.notify_one();
    }
}

#[must_use = "dropping the guard releases the lock immediately"]
pub struct CooperativeGuard<'a> {
    lock: &'a CooperativeMutex,
    acquired: Instant,
}

impl CooperativeGuard<'_> {
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for CooperativeGuard<'_> {
    fn drop(&mut self) {
        self.lock.metrics.record_released(self.acquired.elapsed());
        self.lock.release();
    }
}

impl fmt::Debug for CooperativeGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CooperativeGuard")
            .field("lock", &self.lock.name)
            .finish()
    }
}
