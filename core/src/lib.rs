//! Anti-corruption membrane.
//!
//! Converts untrusted, loosely-typed payloads into immutable, integrity-signed,
//! unit-branded projections:
//!
//! ```text
//! RawEnvelope --adapter--> Projection --seal--> Sealed<Projection>
//!                                                  |
//!                                  verify / unseal / apply_morphism
//! ```
//!
//! The seal signature is tamper-evidence for a reactive consumer graph
//! (accidental mutation, aliasing, stale seal versions). It is deliberately a
//! fast non-cryptographic hash; see [`canonical`].

pub mod adapters;
pub mod canonical;
pub mod envelope;
pub mod error;
pub mod membrane;
pub mod seal;

pub use adapters::{AdapterFn, AdapterRegistry, AdapterRegistryBuilder, adapt};
pub use canonical::{SEAL_SALT, SEAL_VERSION};
pub use envelope::RawEnvelope;
pub use error::{AdaptError, IntegrityViolation, MembraneError};
pub use membrane::Membrane;
pub use seal::{Sealed, SealedProjection};
