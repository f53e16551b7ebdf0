//! Sealed envelopes.
//!
//! A [`Sealed`] value is created only by the membrane. Its payload sits behind
//! an `Arc` with no mutable access, so an envelope can be shared across any
//! number of consumers without copying or locking. Refetching produces a new
//! envelope; an existing one is never updated in place.
//!
//! Envelopes are serializable so they can cross storage and cache boundaries.
//! A deserialized envelope is untrusted until [`Sealed::verify`] or
//! [`Sealed::unseal`] has accepted it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use membrane_types::{Epoch, Projection};

use crate::canonical::{canonicalize, sign};
use crate::error::IntegrityViolation;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sealed<T> {
    payload: Arc<T>,
    signature: String,
    epoch: Epoch,
}

/// A sealed domain projection.
pub type SealedProjection = Sealed<Projection>;

/// Sign `data` at `epoch`.
pub(crate) fn seal<T: Serialize>(data: T, epoch: Epoch) -> Result<Sealed<T>, serde_json::Error> {
    let canonical = canonicalize(&data)?;
    let signature = sign(&canonical, epoch);
    Ok(Sealed {
        payload: Arc::new(data),
        signature,
        epoch,
    })
}

impl<T: Serialize> Sealed<T> {
    /// Recompute the signature from the payload and epoch and compare.
    ///
    /// Never fails: a payload that cannot be canonicalized does not verify.
    #[must_use]
    pub fn verify(&self) -> bool {
        match canonicalize(self.payload.as_ref()) {
            Ok(canonical) => sign(&canonical, self.epoch) == self.signature,
            Err(_) => false,
        }
    }

    /// Verified access to the payload.
    pub fn unseal(&self) -> Result<&T, IntegrityViolation> {
        if self.verify() {
            Ok(&self.payload)
        } else {
            tracing::warn!(
                epoch = %self.epoch,
                signature = %self.signature,
                "Rejected sealed envelope with mismatched signature"
            );
            Err(IntegrityViolation::new(self.epoch, self.signature.clone()))
        }
    }

    /// Like [`Self::unseal`], handing out the shared payload itself.
    pub fn unseal_shared(&self) -> Result<Arc<T>, IntegrityViolation> {
        self.unseal()?;
        Ok(Arc::clone(&self.payload))
    }

    /// Verified access for call sites that degrade gracefully.
    #[must_use]
    pub fn unseal_safe(&self) -> Option<&T> {
        self.verify().then_some(self.payload.as_ref())
    }

    /// Verify, then derive a value from the payload. Every transformation of
    /// sealed data goes through a verification this way.
    pub fn apply_morphism<U, F>(&self, f: F) -> Result<U, IntegrityViolation>
    where
        F: FnOnce(&T) -> U,
    {
        self.unseal().map(f)
    }
}

impl<T> Sealed<T> {
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}
