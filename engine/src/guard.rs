//! Guards: prioritized, possibly asynchronous admission checks run before fetch.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use thiserror::Error;

use crate::error::GateFailure;

/// The only output a guard may produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass {
        latency: Duration,
    },
    Reject {
        reason: String,
        retry_after: Option<Duration>,
    },
}

impl GateVerdict {
    #[must_use]
    pub fn pass() -> Self {
        Self::Pass {
            latency: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// A rejection the pipeline may retry after `retry_after`.
    #[must_use]
    pub fn reject_retryable(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self::Reject {
            reason: reason.into(),
            retry_after: Some(retry_after),
        }
    }

    #[must_use]
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass { .. })
    }
}

/// Error raised inside a guard. Treated as a non-retryable rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct GuardError(pub String);

impl From<&str> for GuardError {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for GuardError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

pub type GuardFut<'a> = Pin<Box<dyn Future<Output = Result<GateVerdict, GuardError>> + Send + 'a>>;

pub trait Guard: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> i32;

    fn check(&self) -> GuardFut<'_>;
}

struct FnGuard<F> {
    name: String,
    priority: i32,
    check: F,
}

impl<F, Fut> Guard for FnGuard<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<GateVerdict, GuardError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn check(&self) -> GuardFut<'_> {
        Box::pin((self.check)())
    }
}

impl<F> fmt::Debug for FnGuard<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnGuard")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Build a guard from a closure returning a future.
pub fn guard_fn<F, Fut>(name: impl Into<String>, priority: i32, check: F) -> Arc<dyn Guard>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GateVerdict, GuardError>> + Send + 'static,
{
    Arc::new(FnGuard {
        name: name.into(),
        priority,
        check,
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "guard panicked".to_string()
    }
}

/// Run one guard, folding errors and panics into a non-retryable rejection.
async fn run_guard(guard: &dyn Guard) -> GateVerdict {
    let started = Instant::now();
    let check = match std::panic::catch_unwind(AssertUnwindSafe(|| guard.check())) {
        Ok(check) => check,
        Err(payload) => return GateVerdict::reject(panic_message(payload.as_ref())),
    };
    match AssertUnwindSafe(check).catch_unwind().await {
        Ok(Ok(GateVerdict::Pass { latency })) => GateVerdict::Pass {
            latency: latency.max(started.elapsed()),
        },
        Ok(Ok(reject)) => reject,
        Ok(Err(error)) => GateVerdict::reject(error.0),
        Err(payload) => GateVerdict::reject(panic_message(payload.as_ref())),
    }
}

/// Run `guards` sequentially in ascending priority (stable for ties). The first
/// rejection stops the chain; later guards are never invoked.
pub(crate) async fn run_guards(guards: &[Arc<dyn Guard>]) -> Result<Duration, GateFailure> {
    let mut ordered: Vec<&Arc<dyn Guard>> = guards.iter().collect();
    ordered.sort_by_key(|guard| guard.priority());

    let mut total = Duration::ZERO;
    for guard in ordered {
        match run_guard(guard.as_ref()).await {
            GateVerdict::Pass { latency } => total += latency,
            GateVerdict::Reject {
                reason,
                retry_after,
            } => {
                tracing::debug!(guard = guard.name(), %reason, "Guard rejected intent");
                return Err(GateFailure {
                    guard: guard.name().to_string(),
                    reason,
                    retry_after,
                });
            }
        }
    }
    Ok(total)
}
