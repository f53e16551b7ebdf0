use std::fmt;
use std::time::Duration;

use thiserror::Error;

use membrane_core::MembraneError;
use membrane_types::UnregisteredDomain;

/// Pipeline stage at which an execution stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Resolve,
    Gate,
    Fetch,
    Seal,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Gate => "gate",
            Self::Fetch => "fetch",
            Self::Seal => "seal",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy could not turn parameters into an intent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ResolveError {
    pub message: String,
}

impl ResolveError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A guard rejected the intent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("guard `{guard}` rejected: {reason}")]
pub struct GateFailure {
    pub guard: String,
    pub reason: String,
    pub retry_after: Option<Duration>,
}

/// Strategy I/O failed or the upstream answered with a non-success status.
///
/// `retry_after` is `Some` only for transient failures; `Some(Duration::ZERO)`
/// asks the retry loop for its own backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FetchFailure {
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl FetchFailure {
    /// A failure that retrying will not fix.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// A transient failure. `retry_after` of zero means "use backoff".
    #[must_use]
    pub fn transient(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: Some(retry_after),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Unregistered(#[from] UnregisteredDomain),
    #[error("resolve failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Gate(#[from] GateFailure),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchFailure),
    #[error(transparent)]
    Seal(#[from] MembraneError),
    /// A strategy panicked; the panic is contained to this execution.
    #[error("strategy panicked during {stage}: {message}")]
    Panicked { stage: Stage, message: String },
}

impl PipelineError {
    /// Retry hint carried by the failure, if the failure is transient.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Gate(failure) => failure.retry_after,
            Self::Fetch(failure) => failure.retry_after,
            Self::Unregistered(_) | Self::Resolve(_) | Self::Seal(_) | Self::Panicked { .. } => None,
        }
    }
}
