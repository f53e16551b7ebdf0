//! Canonical per-domain projections.
//!
//! A projection is the trusted, unit-branded form of one domain's data. Only
//! the membrane adapts raw payloads into projections; everything downstream
//! consumes them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{
    BLOOD_PRESSURE_SHAPE, BODY_TEMPERATURE_SHAPE, DomainKey, GLUCOSE_SHAPE, HEART_RATE_SHAPE,
    OXYGEN_SATURATION_SHAPE, ProjectionShape, SLEEP_SHAPE, WEIGHT_SHAPE,
};
use crate::units::{Bpm, Celsius, EpochMillis, Kilograms, MgPerDl, Minutes, Mmhg, Percent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloodPressure {
    pub systolic: Mmhg,
    pub diastolic: Mmhg,
    pub pulse: Bpm,
    pub measured_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRate {
    pub resting: Bpm,
    pub average: Bpm,
    pub peak: Bpm,
    pub measured_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Glucose {
    pub level: MgPerDl,
    pub measured_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weight {
    pub mass: Kilograms,
    pub measured_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OxygenSaturation {
    pub saturation: Percent,
    pub pulse: Bpm,
    pub measured_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyTemperature {
    pub temperature: Celsius,
    pub measured_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sleep {
    pub asleep: Minutes,
    pub deep: Minutes,
    pub rem: Minutes,
    pub measured_at: EpochMillis,
}

/// Projection of any domain. The serialized form carries the domain tag, so a
/// signature over it is bound to the domain as well as the values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain")]
pub enum Projection {
    #[serde(rename = "bp")]
    BloodPressure(BloodPressure),
    #[serde(rename = "hr")]
    HeartRate(HeartRate),
    #[serde(rename = "glucose")]
    Glucose(Glucose),
    #[serde(rename = "weight")]
    Weight(Weight),
    #[serde(rename = "spo2")]
    OxygenSaturation(OxygenSaturation),
    #[serde(rename = "temp")]
    BodyTemperature(BodyTemperature),
    #[serde(rename = "sleep")]
    Sleep(Sleep),
}

impl Projection {
    #[must_use]
    pub fn key(&self) -> DomainKey {
        match self {
            Self::BloodPressure(_) => DomainKey::BloodPressure,
            Self::HeartRate(_) => DomainKey::HeartRate,
            Self::Glucose(_) => DomainKey::Glucose,
            Self::Weight(_) => DomainKey::Weight,
            Self::OxygenSaturation(_) => DomainKey::OxygenSaturation,
            Self::BodyTemperature(_) => DomainKey::BodyTemperature,
            Self::Sleep(_) => DomainKey::Sleep,
        }
    }

    #[must_use]
    pub fn measured_at(&self) -> EpochMillis {
        match self {
            Self::BloodPressure(p) => p.measured_at,
            Self::HeartRate(p) => p.measured_at,
            Self::Glucose(p) => p.measured_at,
            Self::Weight(p) => p.measured_at,
            Self::OxygenSaturation(p) => p.measured_at,
            Self::BodyTemperature(p) => p.measured_at,
            Self::Sleep(p) => p.measured_at,
        }
    }

    /// Typed view of the projection for domain `P::KEY`.
    #[must_use]
    pub fn as_domain<P: DomainProjection>(&self) -> Option<&P> {
        P::from_projection(self)
    }
}

/// Links a projection struct to its domain key, giving typed `Projection<K>`
/// access on top of the closed [`Projection`] sum.
pub trait DomainProjection:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KEY: DomainKey;
    const SHAPE: &'static ProjectionShape;

    fn into_projection(self) -> Projection;

    fn from_projection(projection: &Projection) -> Option<&Self>;
}

macro_rules! domain_projection {
    ($ty:ident, $key:ident, $shape:ident) => {
        impl DomainProjection for $ty {
            const KEY: DomainKey = DomainKey::$key;
            const SHAPE: &'static ProjectionShape = &$shape;

            fn into_projection(self) -> Projection {
                Projection::$key(self)
            }

            fn from_projection(projection: &Projection) -> Option<&Self> {
                match projection {
                    Projection::$key(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Projection {
            fn from(value: $ty) -> Self {
                value.into_projection()
            }
        }
    };
}

domain_projection!(BloodPressure, BloodPressure, BLOOD_PRESSURE_SHAPE);
domain_projection!(HeartRate, HeartRate, HEART_RATE_SHAPE);
domain_projection!(Glucose, Glucose, GLUCOSE_SHAPE);
domain_projection!(Weight, Weight, WEIGHT_SHAPE);
domain_projection!(OxygenSaturation, OxygenSaturation, OXYGEN_SATURATION_SHAPE);
domain_projection!(BodyTemperature, BodyTemperature, BODY_TEMPERATURE_SHAPE);
domain_projection!(Sleep, Sleep, SLEEP_SHAPE);
