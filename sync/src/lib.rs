//! Lock primitives built on atomic wait/notify.
//!
//! - [`WaitCell`]: a `u32` state word threads can park on.
//! - [`SharedMutex`] / [`CooperativeMutex`]: exclusive locks, blocking and async.
//! - [`RwLock`]: shared readers, exclusive writer, write-to-read downgrade.
//! - [`LockManager`]: named registry with per-lock [`LockMetrics`].
//!
//! Every acquisition returns a guard that releases on drop, including during
//! unwinding.

mod context;
mod error;
mod manager;
mod metrics;
mod mutex;
mod rwlock;
mod wait;

pub use context::ContextId;
pub use error::{LockError, LockKind};
pub use manager::{LockManager, LockName, LockSnapshot};
pub use metrics::{LockMetrics, LockMetricsSnapshot};
pub use mutex::{CooperativeGuard, CooperativeMutex, MutexGuard, SharedMutex};
pub use rwlock::{ReadGuard, RwLock, WriteGuard};
pub use wait::{WaitCell, WaitOutcome};
