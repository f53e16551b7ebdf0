//! Unit-branded numeric types.
//!
//! Every numeric field of a projection carries its unit in the type. The brand
//! exists only at compile time: each unit is a `#[repr(transparent)]` newtype
//! over `f64` (or `i64` for timestamps), serialized as a plain number.
//!
//! Values of different units cannot be combined:
//!
//! ```compile_fail
//! use membrane_types::units::{Bpm, Mmhg};
//!
//! let _ = Mmhg::new(120.0) + Bpm::new(65.0);
//! ```
//!
//! nor passed where another unit is expected:
//!
//! ```compile_fail
//! use membrane_types::units::{Bpm, Mmhg};
//!
//! fn systolic(_: Mmhg) {}
//! systolic(Bpm::new(65.0));
//! ```

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime name of a unit brand, used by shape descriptors and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitBrand {
    Mmhg,
    Bpm,
    MgPerDl,
    Kilograms,
    Percent,
    Celsius,
    Minutes,
    EpochMillis,
}

impl UnitBrand {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Mmhg => "mmHg",
            Self::Bpm => "bpm",
            Self::MgPerDl => "mg/dL",
            Self::Kilograms => "kg",
            Self::Percent => "%",
            Self::Celsius => "°C",
            Self::Minutes => "min",
            Self::EpochMillis => "ms",
        }
    }
}

impl fmt::Display for UnitBrand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("{brand} value must be finite, got {value}")]
pub struct NonFiniteUnit {
    pub brand: UnitBrand,
    pub value: f64,
}

/// Implemented by every branded type.
pub trait Branded: Copy {
    const BRAND: UnitBrand;
}

macro_rules! unit_brand {
    ($(#[$meta:meta])* $name:ident => $brand:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
        #[serde(try_from = "f64", into = "f64")]
        #[repr(transparent)]
        pub struct $name(f64);

        impl $name {
            /// Brand a raw value. Callers at trust boundaries use [`Self::try_new`].
            #[must_use]
            pub const fn new(value: f64) -> Self {
                Self(value)
            }

            pub fn try_new(value: f64) -> Result<Self, NonFiniteUnit> {
                if value.is_finite() {
                    Ok(Self(value))
                } else {
                    Err(NonFiniteUnit {
                        brand: UnitBrand::$brand,
                        value,
                    })
                }
            }

            #[must_use]
            pub const fn value(self) -> f64 {
                self.0
            }
        }

        impl Branded for $name {
            const BRAND: UnitBrand = UnitBrand::$brand;
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $name {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self {
                Self(self.0 - rhs.0)
            }
        }

        impl TryFrom<f64> for $name {
            type Error = NonFiniteUnit;

            fn try_from(value: f64) -> Result<Self, Self::Error> {
                Self::try_new(value)
            }
        }

        impl From<$name> for f64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} {}", self.0, UnitBrand::$brand.symbol())
            }
        }
    };
}

unit_brand!(
    /// Pressure in millimetres of mercury.
    Mmhg => Mmhg
);
unit_brand!(
    /// Beats per minute.
    Bpm => Bpm
);
unit_brand!(
    /// Blood glucose concentration.
    MgPerDl => MgPerDl
);
unit_brand!(Kilograms => Kilograms);
unit_brand!(
    /// A percentage in `0..=100`. The range is checked by adapters, not here.
    Percent => Percent
);
unit_brand!(Celsius => Celsius);
unit_brand!(Minutes => Minutes);

/// Milliseconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct EpochMillis(i64);

impl EpochMillis {
    #[must_use]
    pub const fn new(millis: i64) -> Self {
        Self(millis)
    }

    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }
}

impl Branded for EpochMillis {
    const BRAND: UnitBrand = UnitBrand::EpochMillis;
}

impl fmt::Display for EpochMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
