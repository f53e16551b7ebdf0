//! Membrane error taxonomy.

use membrane_types::{DomainKey, Epoch, UnregisteredDomain};
use thiserror::Error;

/// A sealed envelope failed verification: its payload or epoch no longer
/// matches its signature, or it was signed under another seal version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("integrity violation: envelope sealed at epoch {epoch} does not match its signature")]
pub struct IntegrityViolation {
    epoch: Epoch,
    signature: String,
}

impl IntegrityViolation {
    pub(crate) fn new(epoch: Epoch, signature: impl Into<String>) -> Self {
        Self {
            epoch,
            signature: signature.into(),
        }
    }

    /// Epoch as observed on the rejected envelope. It may be the tampered
    /// value, not the one the seal was made with.
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Signature carried by the rejected envelope.
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// A raw payload could not be adapted into a projection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdaptError {
    #[error("{domain}: payload is not an object")]
    NotAnObject { domain: DomainKey },
    #[error("{domain}: missing field `{field}`")]
    MissingField {
        domain: DomainKey,
        field: &'static str,
    },
    #[error("{domain}: invalid `{field}`: {reason}")]
    InvalidValue {
        domain: DomainKey,
        field: &'static str,
        reason: String,
    },
    #[error("projection for {found} cannot be sealed as {expected}")]
    DomainMismatch {
        expected: DomainKey,
        found: DomainKey,
    },
}

#[derive(Debug, Error)]
pub enum MembraneError {
    #[error(transparent)]
    Unregistered(#[from] UnregisteredDomain),
    #[error(transparent)]
    Adapt(#[from] AdaptError),
    #[error("failed to canonicalize payload: {0}")]
    Canonicalize(#[from] serde_json::Error),
}
