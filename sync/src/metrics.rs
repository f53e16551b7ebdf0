use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::context::ContextId;

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Contention and timing counters for one lock.
#[derive(Debug, Default)]
pub struct LockMetrics {
    acquisitions: AtomicU64,
    contentions: AtomicU64,
    timeouts: AtomicU64,
    wait_nanos: AtomicU64,
    hold_nanos: AtomicU64,
    owner: AtomicU64,
}

impl LockMetrics {
    pub(crate) fn record_acquired(&self, waited: Duration, contended: bool) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contentions.fetch_add(1, Ordering::Relaxed);
        }
        self.wait_nanos.fetch_add(nanos(waited), Ordering::Relaxed);
    }

    pub(crate) fn record_released(&self, held: Duration) {
        self.hold_nanos.fetch_add(nanos(held), Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self, waited: Duration) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.contentions.fetch_add(1, Ordering::Relaxed);
        self.wait_nanos.fetch_add(nanos(waited), Ordering::Relaxed);
    }

    pub(crate) fn set_owner(&self, owner: Option<ContextId>) {
        self.owner
            .store(owner.map_or(0, ContextId::value), Ordering::Relaxed);
    }

    #[must_use]
    pub fn owner(&self) -> Option<ContextId> {
        ContextId::from_raw(self.owner.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            wait_us: self.wait_nanos.load(Ordering::Relaxed) / 1_000,
            hold_us: self.hold_nanos.load(Ordering::Relaxed) / 1_000,
            owner: self.owner(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockMetricsSnapshot {
    pub acquisitions: u64,
    pub contentions: u64,
    pub timeouts: u64,
    /// Cumulative time spent waiting to acquire.
    pub wait_us: u64,
    /// Cumulative time the lock was held.
    pub hold_us: u64,
    pub owner: Option<ContextId>,
}
