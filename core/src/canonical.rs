//! Canonical serialization and the seal signature.
//!
//! The signature is a 32-bit DJB-style hash (`h = h * 33 + byte`, seeded with
//! 5381) over the canonical JSON of the payload, the epoch, a fixed salt and the
//! seal format version, hex-encoded to 8 characters.
//!
//! This is tamper-evidence against accidental mutation and aliasing. It is not
//! a MAC and must not be treated as an authentication boundary.

use serde::Serialize;
use serde_json::Value;

use membrane_types::Epoch;

/// Fixed salt mixed into every signature.
pub const SEAL_SALT: &str = "membrane.seal";

/// Seal format version. Bumping it invalidates every existing envelope.
pub const SEAL_VERSION: u32 = 1;

const DJB_SEED: u32 = 5381;

/// Serialize `data` to canonical JSON: compact, object keys sorted at every depth.
pub fn canonicalize<T: Serialize + ?Sized>(data: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(data)?;
    let mut out = String::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(val, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

fn djb_mix(hash: u32, bytes: &[u8]) -> u32 {
    bytes.iter().fold(hash, |h, &b| {
        h.wrapping_mul(33).wrapping_add(u32::from(b))
    })
}

/// Compute the signature of a canonical payload at `epoch`.
#[must_use]
pub fn sign(canonical: &str, epoch: Epoch) -> String {
    let epoch = epoch.value().to_string();
    let version = SEAL_VERSION.to_string();
    let parts: [&[u8]; 7] = [
        canonical.as_bytes(),
        b"|",
        epoch.as_bytes(),
        b"|",
        SEAL_SALT.as_bytes(),
        b"|v",
        version.as_bytes(),
    ];
    let hash = parts.into_iter().fold(DJB_SEED, djb_mix);
    format!("{hash:08x}")
}
