//! The membrane: the only place raw payloads become sealed projections.

use std::fmt;
use std::sync::Arc;

use membrane_types::{DomainKey, DomainProjection, Epoch, Projection};

use crate::adapters::AdapterRegistry;
use crate::envelope::RawEnvelope;
use crate::error::{AdaptError, MembraneError};
use crate::seal::{SealedProjection, seal};

type Clock = Arc<dyn Fn() -> Epoch + Send + Sync>;

#[derive(Clone)]
pub struct Membrane {
    adapters: AdapterRegistry,
    clock: Clock,
}

impl Membrane {
    /// A membrane over a total adapter registry.
    #[must_use]
    pub fn new(adapters: AdapterRegistry) -> Self {
        Self {
            adapters,
            clock: Arc::new(Epoch::now),
        }
    }

    /// A membrane over the built-in adapters.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(AdapterRegistry::standard())
    }

    /// Replace the epoch source (deterministic epochs in tests and replays).
    #[must_use]
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> Epoch + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Adapt `envelope.body` with the adapter registered for `key`, then seal.
    pub fn transduce(
        &self,
        key: DomainKey,
        envelope: &RawEnvelope,
    ) -> Result<SealedProjection, MembraneError> {
        let adapter = self.adapters.get(key)?;
        let projection = adapter(&envelope.body)?;
        self.seal_direct(key, projection)
    }

    /// [`Self::transduce`] addressed by wire name. Unknown names are
    /// `UnregisteredDomain`, never an empty result.
    pub fn transduce_named(
        &self,
        name: &str,
        envelope: &RawEnvelope,
    ) -> Result<SealedProjection, MembraneError> {
        let key: DomainKey = name.parse()?;
        self.transduce(key, envelope)
    }

    /// Seal pre-adapted data (cached, demo or precomputed values).
    pub fn seal_direct(
        &self,
        key: DomainKey,
        data: Projection,
    ) -> Result<SealedProjection, MembraneError> {
        if data.key() != key {
            return Err(AdaptError::DomainMismatch {
                expected: key,
                found: data.key(),
            }
            .into());
        }
        let epoch = (self.clock)();
        let sealed = seal(data, epoch)?;
        tracing::trace!(domain = %key, epoch = %epoch, signature = sealed.signature(), "Sealed projection");
        Ok(sealed)
    }

    /// Seal a typed projection under its own domain key.
    pub fn seal_typed<P: DomainProjection>(&self, data: P) -> Result<SealedProjection, MembraneError> {
        self.seal_direct(P::KEY, data.into_projection())
    }

    /// Transduce a heterogeneous batch; output order follows input order.
    pub fn transduce_batch<'a, I>(&self, entries: I) -> Vec<Result<SealedProjection, MembraneError>>
    where
        I: IntoIterator<Item = (DomainKey, &'a RawEnvelope)>,
    {
        entries
            .into_iter()
            .map(|(key, envelope)| self.transduce(key, envelope))
            .collect()
    }
}

impl Default for Membrane {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for Membrane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Membrane")
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}
