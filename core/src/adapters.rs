//! Per-domain adapters: raw payload → projection.
//!
//! Upstream payloads are loosely typed. Numbers may arrive as strings, fields
//! under short or legacy aliases, timestamps as epoch millis or RFC 3339. The
//! adapters accept all of that and emit a projection whose every field is
//! branded and finite, or an [`AdaptError`] naming the offending field.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::DateTime;
use serde_json::{Map, Value};

use membrane_types::{
    BloodPressure, BodyTemperature, Bpm, Celsius, DomainKey, EpochMillis, Glucose, HeartRate,
    Kilograms, MgPerDl, Minutes, Mmhg, OxygenSaturation, Percent, Projection, Sleep,
    UnregisteredDomain, Weight,
};

use crate::error::AdaptError;

/// Adapter from a raw body to a projection.
pub type AdapterFn = Arc<dyn Fn(&Value) -> Result<Projection, AdaptError> + Send + Sync>;

const TIMESTAMP_ALIASES: &[&str] = &["measured_at", "timestamp", "t", "τ", "ts"];

/// Reads aliased fields out of one payload object.
struct FieldReader<'a> {
    domain: DomainKey,
    object: &'a Map<String, Value>,
}

impl<'a> FieldReader<'a> {
    fn new(domain: DomainKey, body: &'a Value) -> Result<Self, AdaptError> {
        match body {
            Value::Object(object) => Ok(Self { domain, object }),
            _ => Err(AdaptError::NotAnObject { domain }),
        }
    }

    fn lookup(&self, aliases: &[&str]) -> Option<&'a Value> {
        aliases
            .iter()
            .find_map(|alias| self.object.get(*alias))
            .filter(|v| !v.is_null())
    }

    fn invalid(&self, field: &'static str, reason: impl Into<String>) -> AdaptError {
        AdaptError::InvalidValue {
            domain: self.domain,
            field,
            reason: reason.into(),
        }
    }

    /// A finite, non-negative number under `field` or one of its aliases.
    fn number(&self, field: &'static str, aliases: &[&str]) -> Result<f64, AdaptError> {
        let mut names = vec![field];
        names.extend_from_slice(aliases);
        let raw = self
            .lookup(&names)
            .ok_or(AdaptError::MissingField {
                domain: self.domain,
                field,
            })?;
        let value = match raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| self.invalid(field, format!("expected a number, got {raw}")))?;

        if !value.is_finite() {
            return Err(self.invalid(field, "value is not finite"));
        }
        if value < 0.0 {
            return Err(self.invalid(field, format!("value {value} is negative")));
        }
        Ok(value)
    }

    fn percent(&self, field: &'static str, aliases: &[&str]) -> Result<Percent, AdaptError> {
        let value = self.number(field, aliases)?;
        if value > 100.0 {
            return Err(self.invalid(field, format!("{value} exceeds 100%")));
        }
        Ok(Percent::new(value))
    }

    fn timestamp(&self) -> Result<EpochMillis, AdaptError> {
        let field = "measured_at";
        let raw = self
            .lookup(TIMESTAMP_ALIASES)
            .ok_or(AdaptError::MissingField {
                domain: self.domain,
                field,
            })?;
        match raw {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
                .map(EpochMillis::new)
                .ok_or_else(|| self.invalid(field, format!("unusable timestamp {n}"))),
            Value::String(s) => {
                let s = s.trim();
                if let Ok(millis) = s.parse::<i64>() {
                    return Ok(EpochMillis::new(millis));
                }
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| EpochMillis::new(dt.timestamp_millis()))
                    .map_err(|e| self.invalid(field, format!("unparseable timestamp: {e}")))
            }
            other => Err(self.invalid(field, format!("expected a timestamp, got {other}"))),
        }
    }
}

pub fn adapt_blood_pressure(body: &Value) -> Result<BloodPressure, AdaptError> {
    let r = FieldReader::new(DomainKey::BloodPressure, body)?;
    Ok(BloodPressure {
        systolic: Mmhg::new(r.number("systolic", &["sys", "s"])?),
        diastolic: Mmhg::new(r.number("diastolic", &["dia", "d"])?),
        pulse: Bpm::new(r.number("pulse", &["bpm", "p"])?),
        measured_at: r.timestamp()?,
    })
}

pub fn adapt_heart_rate(body: &Value) -> Result<HeartRate, AdaptError> {
    let r = FieldReader::new(DomainKey::HeartRate, body)?;
    Ok(HeartRate {
        resting: Bpm::new(r.number("resting", &["rest", "r"])?),
        average: Bpm::new(r.number("average", &["avg", "a"])?),
        peak: Bpm::new(r.number("peak", &["max", "m"])?),
        measured_at: r.timestamp()?,
    })
}

pub fn adapt_glucose(body: &Value) -> Result<Glucose, AdaptError> {
    let r = FieldReader::new(DomainKey::Glucose, body)?;
    Ok(Glucose {
        level: MgPerDl::new(r.number("level", &["value", "mg_dl", "g"])?),
        measured_at: r.timestamp()?,
    })
}

pub fn adapt_weight(body: &Value) -> Result<Weight, AdaptError> {
    let r = FieldReader::new(DomainKey::Weight, body)?;
    Ok(Weight {
        mass: Kilograms::new(r.number("mass", &["kg", "weight", "w"])?),
        measured_at: r.timestamp()?,
    })
}

pub fn adapt_oxygen_saturation(body: &Value) -> Result<OxygenSaturation, AdaptError> {
    let r = FieldReader::new(DomainKey::OxygenSaturation, body)?;
    Ok(OxygenSaturation {
        saturation: r.percent("saturation", &["spo2", "o"])?,
        pulse: Bpm::new(r.number("pulse", &["bpm", "p"])?),
        measured_at: r.timestamp()?,
    })
}

pub fn adapt_body_temperature(body: &Value) -> Result<BodyTemperature, AdaptError> {
    let r = FieldReader::new(DomainKey::BodyTemperature, body)?;
    Ok(BodyTemperature {
        temperature: Celsius::new(r.number("temperature", &["celsius", "c"])?),
        measured_at: r.timestamp()?,
    })
}

pub fn adapt_sleep(body: &Value) -> Result<Sleep, AdaptError> {
    let r = FieldReader::new(DomainKey::Sleep, body)?;
    Ok(Sleep {
        asleep: Minutes::new(r.number("asleep", &["total", "duration"])?),
        deep: Minutes::new(r.number("deep", &[])?),
        rem: Minutes::new(r.number("rem", &[])?),
        measured_at: r.timestamp()?,
    })
}

/// Built-in adapter for `key`.
pub fn adapt(key: DomainKey, body: &Value) -> Result<Projection, AdaptError> {
    match key {
        DomainKey::BloodPressure => adapt_blood_pressure(body).map(Projection::from),
        DomainKey::HeartRate => adapt_heart_rate(body).map(Projection::from),
        DomainKey::Glucose => adapt_glucose(body).map(Projection::from),
        DomainKey::Weight => adapt_weight(body).map(Projection::from),
        DomainKey::OxygenSaturation => adapt_oxygen_saturation(body).map(Projection::from),
        DomainKey::BodyTemperature => adapt_body_temperature(body).map(Projection::from),
        DomainKey::Sleep => adapt_sleep(body).map(Projection::from),
    }
}

fn builtin(key: DomainKey) -> AdapterFn {
    Arc::new(move |body: &Value| adapt(key, body))
}

/// Total mapping from domain key to adapter.
///
/// Only obtainable through [`AdapterRegistry::standard`] or a builder that has
/// proven every key is covered.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<DomainKey, AdapterFn>,
}

impl AdapterRegistry {
    /// Registry of the built-in adapters.
    #[must_use]
    pub fn standard() -> Self {
        let adapters = DomainKey::ALL
            .into_iter()
            .map(|key| (key, builtin(key)))
            .collect();
        Self { adapters }
    }

    #[must_use]
    pub fn builder() -> AdapterRegistryBuilder {
        AdapterRegistryBuilder::default()
    }

    pub fn get(&self, key: DomainKey) -> Result<&AdapterFn, UnregisteredDomain> {
        self.adapters
            .get(&key)
            .ok_or_else(|| UnregisteredDomain::named(key.as_str()))
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.adapters.keys().collect();
        keys.sort();
        f.debug_struct("AdapterRegistry")
            .field("domains", &keys)
            .finish()
    }
}

#[derive(Default)]
pub struct AdapterRegistryBuilder {
    adapters: HashMap<DomainKey, AdapterFn>,
}

impl AdapterRegistryBuilder {
    /// Fill every key not yet registered with its built-in adapter.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        for key in DomainKey::ALL {
            self.adapters.entry(key).or_insert_with(|| builtin(key));
        }
        self
    }

    #[must_use]
    pub fn adapter<F>(mut self, key: DomainKey, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Projection, AdaptError> + Send + Sync + 'static,
    {
        self.adapters.insert(key, Arc::new(f));
        self
    }

    /// Fails with every missing key when the mapping is not total.
    pub fn build(self) -> Result<AdapterRegistry, UnregisteredDomain> {
        let missing = DomainKey::missing_from(self.adapters.keys().copied());
        if !missing.is_empty() {
            return Err(UnregisteredDomain::missing(&missing));
        }
        Ok(AdapterRegistry {
            adapters: self.adapters,
        })
    }
}
