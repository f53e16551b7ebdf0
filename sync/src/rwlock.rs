//! Reader-writer lock over one state word: the high bit marks a writer, the
//! remaining bits count active readers. Readers and a writer never coexist.
//!
//! Waiting writers do not block new readers, so a steady stream of readers can
//! delay a writer indefinitely.

use std::fmt;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::context::ContextId;
use crate::error::LockError;
use crate::metrics::LockMetrics;
use crate::mutex::{ANONYMOUS, timed_out};
use crate::wait::WaitCell;

const WRITER: u32 = 1 << 31;
const READERS: u32 = WRITER - 1;

pub struct RwLock {
    name: String,
    cell: WaitCell,
    metrics: LockMetrics,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("name", &self.name)
            .field("readers", &self.readers())
            .field("writer", &self.is_write_locked())
            .finish()
    }
}

impl RwLock {
    #[must_use]
    pub fn new() -> Self {
        Self::named(ANONYMOUS)
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cell: WaitCell::new(0),
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
    pub fn readers(&self) -> u32 {
        self.cell.load() & READERS
    }

    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.cell.load() & WRITER != 0
    }

    /// One CAS attempt. `Err` carries the state that blocked us.
    fn try_read_cell(&self) -> Result<(), u32> {
        let state = self.cell.atomic();
        let mut current = state.load(Ordering::Relaxed);
        loop {
            if current & WRITER != 0 || current & READERS == READERS {
                return Err(current);
            }
            match state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn try_write_cell(&self) -> Result<(), u32> {
        self.cell
            .atomic()
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .map(drop)
    }

    fn read_guard(&self, started: Instant, contended: bool) -> ReadGuard<'_> {
        self.metrics.record_acquired(started.elapsed(), contended);
        ReadGuard {
            lock: self,
            acquired: Instant::now(),
        }
    }

    fn write_guard(&self, started: Instant, contended: bool) -> WriteGuard<'_> {
        self.metrics.record_acquired(started.elapsed(), contended);
        self.metrics.set_owner(Some(ContextId::current()));
        WriteGuard {
            lock: self,
            acquired: Instant::now(),
        }
    }

    /// Park until `attempt` succeeds. `attempt` returns the blocking state
    /// on failure; the thread sleeps until that state changes.
    fn block_on(&self, attempt: impl Fn() -> Result<(), u32>) -> bool {
        let mut contended = false;
        while let Err(observed) = attempt() {
            contended = true;
            self.cell.wait(observed, None);
        }
        contended
    }

    /// Bounded [`RwLock::block_on`]; `Err` carries the time waited.
    fn block_until(
        &self,
        timeout: Duration,
        attempt: impl Fn() -> Result<(), u32>,
    ) -> Result<bool, Duration> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut contended = false;
        while let Err(observed) = attempt() {
            contended = true;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(started.elapsed());
            }
            self.cell.wait(observed, Some(remaining));
        }
        Ok(contended)
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        let started = Instant::now();
        self.try_read_cell()
            .ok()
            .map(|()| self.read_guard(started, false))
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        let started = Instant::now();
        self.try_write_cell()
            .ok()
            .map(|()| self.write_guard(started, false))
    }

    /// Block until no writer holds the lock.
    pub fn read(&self) -> ReadGuard<'_> {
        let started = Instant::now();
        let contended = self.block_on(|| self.try_read_cell());
        self.read_guard(started, contended)
    }

    /// Block until there are no readers and no writer.
    pub fn write(&self) -> WriteGuard<'_> {
        let started = Instant::now();
        let contended = self.block_on(|| self.try_write_cell());
        self.write_guard(started, contended)
    }

    pub fn read_timeout(&self, timeout: Duration) -> Result<ReadGuard<'_>, LockError> {
        let started = Instant::now();
        self.block_until(timeout, || self.try_read_cell())
            .map(|contended| self.read_guard(started, contended))
            .map_err(|waited| timed_out(&self.name, &self.metrics, waited))
    }

    pub fn write_timeout(&self, timeout: Duration) -> Result<WriteGuard<'_>, LockError> {
        let started = Instant::now();
        self.block_until(timeout, || self.try_write_cell())
            .map(|contended| self.write_guard(started, contended))
            .map_err(|waited| timed_out(&self.name, &self.metrics, waited))
    }
}

#[must_use = "dropping the guard releases the lock immediately"]
pub struct ReadGuard<'a> {
    lock: &'a RwLock,
    acquired: Instant,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.metrics.record_released(self.acquired.elapsed());
        let previous = self.lock.cell.atomic().fetch_sub(1, Ordering::Release);
        if previous & READERS == 1 {
            self.lock.cell.notify_all();
        }
    }
}

impl fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard").field("lock", &self.lock.name).finish()
    }
}

#[must_use = "dropping the guard releases the lock immediately"]
pub struct WriteGuard<'a> {
    lock: &'a RwLock,
    acquired: Instant,
}

impl<'a> WriteGuard<'a> {
    /// Atomically trade exclusive access for shared access and wake every
    /// waiting reader. No writer can slip in between.
    pub fn downgrade(self) -> ReadGuard<'a> {
        let lock = self.lock;
        lock.metrics.record_released(self.acquired.elapsed());
        lock.metrics.set_owner(None);
        std::mem::forget(self);
        lock.cell.atomic().store(1, Ordering::Release);
        lock.cell.notify_all();
        ReadGuard {
            lock,
            acquired: Instant::now(),
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.metrics.record_released(self.acquired.elapsed());
        self.lock.metrics.set_owner(None);
        self.lock.cell.atomic().store(0, Ordering::Release);
        self.lock.cell.notify_all();
    }
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard").field("lock", &self.lock.name).finish()
    }
}
