//! Process-wide registry of named locks.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::error::{LockError, LockKind};
use crate::metrics::{LockMetrics, LockMetricsSnapshot};
use crate::mutex::{CooperativeMutex, SharedMutex};
use crate::rwlock::RwLock;

/// A validated `namespace/name` lock identifier.
///
/// The namespace is lowercase ASCII letters, digits, `-` or `_`. The name is
/// any non-empty text without whitespace or control characters, so it can
/// carry storage keys such as `storage/profile.v2`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LockName(String);

impl LockName {
    pub fn new(namespace: &str, name: &str) -> Result<Self, LockError> {
        format!("{namespace}/{name}").parse()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.split_once('/').map_or("", |(ns, _)| ns)
    }
}

impl FromStr for LockName {
    type Err = LockError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || LockError::InvalidName {
            name: raw.to_string(),
        };
        let (namespace, name) = raw.split_once('/').ok_or_else(invalid)?;
        let namespace_ok = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        let name_ok = !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || c.is_control());
        if namespace_ok && name_ok {
            Ok(Self(raw.to_string()))
        } else {
            Err(invalid())
        }
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
enum Entry {
    Mutex(Arc<SharedMutex>),
    Cooperative(Arc<CooperativeMutex>),
    RwLock(Arc<RwLock>),
}

impl Entry {
    fn kind(&self) -> LockKind {
        match self {
            Self::Mutex(_) => LockKind::Mutex,
            Self::Cooperative(_) => LockKind::Cooperative,
            Self::RwLock(_) => LockKind::RwLock,
        }
    }

    fn metrics(&self) -> &LockMetrics {
        match self {
            Self::Mutex(lock) => lock.metrics(),
            Self::Cooperative(lock) => lock.metrics(),
            Self::RwLock(lock) => lock.metrics(),
        }
    }

    /// True once the registry holds the only reference.
    fn is_idle(&self) -> bool {
        match self {
            Self::Mutex(lock) => Arc::strong_count(lock) == 1,
            Self::Cooperative(lock) => Arc::strong_count(lock) == 1,
            Self::RwLock(lock) => Arc::strong_count(lock) == 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSnapshot {
    pub name: LockName,
    pub kind: LockKind,
    #[serde(flatten)]
    pub metrics: LockMetricsSnapshot,
}

/// Hands out shared lock instances by name so independent subsystems agree
/// on the same lock without passing it around. A name is bound to one lock
/// kind while its entry is registered.
///
/// Entries nobody else references are evicted whenever a new name is
/// registered, so the registry grows with the locks in use rather than with
/// every name ever requested. An idle entry stays visible to [`snapshot`]
/// until then.
///
/// [`snapshot`]: LockManager::snapshot
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<BTreeMap<LockName, Entry>>,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager").field("locks", &self.len()).finish()
    }
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(
        &self,
        name: &str,
        requested: LockKind,
        create: impl FnOnce(&LockName) -> Entry,
    ) -> Result<Entry, LockError> {
        let name: LockName = name.parse()?;
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = locks.get(&name) {
            if existing.kind() != requested {
                return Err(LockError::KindMismatch {
                    name: name.to_string(),
                    existing: existing.kind(),
                    requested,
                });
            }
            return Ok(existing.clone());
        }
        let before = locks.len();
        locks.retain(|_, entry| !entry.is_idle());
        let evicted = before - locks.len();
        if evicted > 0 {
            tracing::trace!(evicted, "Evicted idle locks");
        }
        tracing::debug!(lock = %name, kind = %requested, "Registering lock");
        let entry = create(&name);
        locks.insert(name, entry.clone());
        Ok(entry)
    }

    pub fn mutex(&self, name: &str) -> Result<Arc<SharedMutex>, LockError> {
        match self.entry(name, LockKind::Mutex, |name| {
            Entry::Mutex(Arc::new(SharedMutex::named(name.as_str())))
        })? {
            Entry::Mutex(lock) => Ok(lock),
            other => Err(mismatch(name, &other, LockKind::Mutex)),
        }
    }

    pub fn cooperative(&self, name: &str) -> Result<Arc<CooperativeMutex>, LockError> {
        match self.entry(name, LockKind::Cooperative, |name| {
            Entry::Cooperative(Arc::new(CooperativeMutex::named(name.as_str())))
        })? {
            Entry::Cooperative(lock) => Ok(lock),
            other => Err(mismatch(name, &other, LockKind::Cooperative)),
        }
    }

    pub fn rwlock(&self, name: &str) -> Result<Arc<RwLock>, LockError> {
        match self.entry(name, LockKind::RwLock, |name| {
            Entry::RwLock(Arc::new(RwLock::named(name.as_str())))
        })? {
            Entry::RwLock(lock) => Ok(lock),
            other => Err(mismatch(name, &other, LockKind::RwLock)),
        }
    }

    /// Drop every entry that only the registry still references. Returns
    /// how many were removed.
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();
        locks.retain(|_, entry| !entry.is_idle());
        before - locks.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metrics for every registered lock, ordered by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LockSnapshot> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, entry)| LockSnapshot {
                name: name.clone(),
                kind: entry.kind(),
                metrics: entry.metrics().snapshot(),
            })
            .collect()
    }
}

fn mismatch(name: &str, existing: &Entry, requested: LockKind) -> LockError {
    LockError::KindMismatch {
        name: name.to_string(),
        existing: existing.kind(),
        requested,
    }
}
