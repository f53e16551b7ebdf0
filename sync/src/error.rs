use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Mutex,
    Cooperative,
    RwLock,
}

impl LockKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mutex => "mutex",
            Self::Cooperative => "cooperative",
            Self::RwLock => "rwlock",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock '{lock}' not acquired within {waited:?}")]
    Timeout { lock: String, waited: Duration },
    #[error("lock '{lock}' is not held by {context}")]
    NotHeld { lock: String, context: String },
    #[error("lock '{name}' is registered as {existing}, requested as {requested}")]
    KindMismatch {
        name: String,
        existing: LockKind,
        requested: LockKind,
    },
    #[error("invalid lock name '{name}': expected 'namespace/name'")]
    InvalidName { name: String },
}

impl LockError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
