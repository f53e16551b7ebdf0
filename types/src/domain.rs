//! Domain registry: the closed set of health-indicator domains and the
//! canonical shape of each domain's projection.
//!
//! The registry is total by construction. Every lookup is an exhaustive
//! `match` on [`DomainKey`], so adding a key without a shape does not compile.
//! Runtime registries (adapters, strategies) use [`DomainKey::missing_from`]
//! to assert the same totality at startup.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::units::UnitBrand;

/// Stable identifier of one health-indicator domain.
///
/// The serialized form (`"bp"`, `"hr"`, ...) is the vocabulary shared with the
/// request/cache layer for addressing cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DomainKey {
    #[serde(rename = "bp")]
    BloodPressure,
    #[serde(rename = "hr")]
    HeartRate,
    #[serde(rename = "glucose")]
    Glucose,
    #[serde(rename = "weight")]
    Weight,
    #[serde(rename = "spo2")]
    OxygenSaturation,
    #[serde(rename = "temp")]
    BodyTemperature,
    #[serde(rename = "sleep")]
    Sleep,
}

impl DomainKey {
    pub const ALL: [DomainKey; 7] = [
        Self::BloodPressure,
        Self::HeartRate,
        Self::Glucose,
        Self::Weight,
        Self::OxygenSaturation,
        Self::BodyTemperature,
        Self::Sleep,
    ];

    /// Wire name of the key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BloodPressure => "bp",
            Self::HeartRate => "hr",
            Self::Glucose => "glucose",
            Self::Weight => "weight",
            Self::OxygenSaturation => "spo2",
            Self::BodyTemperature => "temp",
            Self::Sleep => "sleep",
        }
    }

    /// Human-readable indicator name, used in resolved intents and logs.
    #[must_use]
    pub const fn indicator(self) -> &'static str {
        match self {
            Self::BloodPressure => "blood_pressure",
            Self::HeartRate => "heart_rate",
            Self::Glucose => "blood_glucose",
            Self::Weight => "body_weight",
            Self::OxygenSaturation => "oxygen_saturation",
            Self::BodyTemperature => "body_temperature",
            Self::Sleep => "sleep_duration",
        }
    }

    #[must_use]
    pub const fn shape(self) -> &'static ProjectionShape {
        match self {
            Self::BloodPressure => &BLOOD_PRESSURE_SHAPE,
            Self::HeartRate => &HEART_RATE_SHAPE,
            Self::Glucose => &GLUCOSE_SHAPE,
            Self::Weight => &WEIGHT_SHAPE,
            Self::OxygenSaturation => &OXYGEN_SATURATION_SHAPE,
            Self::BodyTemperature => &BODY_TEMPERATURE_SHAPE,
            Self::Sleep => &SLEEP_SHAPE,
        }
    }

    /// Keys absent from `present`, in registry order.
    #[must_use]
    pub fn missing_from<I>(present: I) -> Vec<DomainKey>
    where
        I: IntoIterator<Item = DomainKey>,
    {
        let present: Vec<DomainKey> = present.into_iter().collect();
        Self::ALL
            .into_iter()
            .filter(|key| !present.contains(key))
            .collect()
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainKey {
    type Err = UnregisteredDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| UnregisteredDomain::named(s))
    }
}

/// A domain is referenced that has no adapter or strategy, or is not a known
/// key at all. Always a programming error; never silently skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unregistered domain: {}", names.join(", "))]
pub struct UnregisteredDomain {
    names: Vec<String>,
}

impl UnregisteredDomain {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
        }
    }

    #[must_use]
    pub fn missing(keys: &[DomainKey]) -> Self {
        Self {
            names: keys.iter().map(|k| k.as_str().to_string()).collect(),
        }
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One field of a projection shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldShape {
    pub name: &'static str,
    pub brand: UnitBrand,
}

/// Canonical shape of a domain projection: field names and their unit brands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProjectionShape {
    pub key: DomainKey,
    pub fields: &'static [FieldShape],
}

impl ProjectionShape {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldShape> {
        self.fields.iter().find(|f| f.name == name)
    }
}

const fn field(name: &'static str, brand: UnitBrand) -> FieldShape {
    FieldShape { name, brand }
}

pub(crate) const BLOOD_PRESSURE_SHAPE: ProjectionShape = ProjectionShape {
    key: DomainKey::BloodPressure,
    fields: &[
        field("systolic", UnitBrand::Mmhg),
        field("diastolic", UnitBrand::Mmhg),
        field("pulse", UnitBrand::Bpm),
        field("measured_at", UnitBrand::EpochMillis),
    ],
};

pub(crate) const HEART_RATE_SHAPE: ProjectionShape = ProjectionShape {
    key: DomainKey::HeartRate,
    fields: &[
        field("resting", UnitBrand::Bpm),
        field("average", UnitBrand::Bpm),
        field("peak", UnitBrand::Bpm),
        field("measured_at", UnitBrand::EpochMillis),
    ],
};

pub(crate) const GLUCOSE_SHAPE: ProjectionShape = ProjectionShape {
    key: DomainKey::Glucose,
    fields: &[
        field("level", UnitBrand::MgPerDl),
        field("measured_at", UnitBrand::EpochMillis),
    ],
};

pub(crate) const WEIGHT_SHAPE: ProjectionShape = ProjectionShape {
    key: DomainKey::Weight,
    fields: &[
        field("mass", UnitBrand::Kilograms),
        field("measured_at", UnitBrand::EpochMillis),
    ],
};

pub(crate) const OXYGEN_SATURATION_SHAPE: ProjectionShape = ProjectionShape {
    key: DomainKey::OxygenSaturation,
    fields: &[
        field("saturation", UnitBrand::Percent),
        field("pulse", UnitBrand::Bpm),
        field("measured_at", UnitBrand::EpochMillis),
    ],
};

pub(crate) const BODY_TEMPERATURE_SHAPE: ProjectionShape = ProjectionShape {
    key: DomainKey::BodyTemperature,
    fields: &[
        field("temperature", UnitBrand::Celsius),
        field("measured_at", UnitBrand::EpochMillis),
    ],
};

pub(crate) const SLEEP_SHAPE: ProjectionShape = ProjectionShape {
    key: DomainKey::Sleep,
    fields: &[
        field("asleep", UnitBrand::Minutes),
        field("deep", UnitBrand::Minutes),
        field("rem", UnitBrand::Minutes),
        field("measured_at", UnitBrand::EpochMillis),
    ],
};

/// All registered shapes, in key order.
#[must_use]
pub fn registry() -> Vec<&'static ProjectionShape> {
    DomainKey::ALL.into_iter().map(DomainKey::shape).collect()
}
