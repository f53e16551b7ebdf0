use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<u64> = const { Cell::new(0) };
}

/// Stable numeric identity of an execution context (an OS thread), used for
/// lock ownership bookkeeping. Ids are never reused and never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContextId(u64);

impl ContextId {
    /// Id of the calling thread, assigned on first use.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|current| {
            if current.get() == 0 {
                current.set(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
            }
            Self(current.get())
        })
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}
