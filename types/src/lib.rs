//! Core domain types for Membrane.
//!
//! This crate contains the domain registry, unit brands and projections. It has
//! no IO and no async; every other Membrane crate builds on it.

pub mod domain;
pub mod ids;
pub mod projection;
pub mod units;

pub use domain::{DomainKey, FieldShape, ProjectionShape, UnregisteredDomain, registry};
pub use ids::{Epoch, IntentToken};
pub use projection::{
    BloodPressure, BodyTemperature, DomainProjection, Glucose, HeartRate, OxygenSaturation,
    Projection, Sleep, Weight,
};
pub use units::{
    Bpm, Branded, Celsius, EpochMillis, Kilograms, MgPerDl, Minutes, Mmhg, NonFiniteUnit, Percent,
    UnitBrand,
};
