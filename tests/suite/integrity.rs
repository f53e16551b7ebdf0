//! Seal integrity across serialization boundaries.

use membrane_core::{MembraneError, RawEnvelope, SealedProjection};
use membrane_types::{BloodPressure, Bpm, DomainKey, EpochMillis, Mmhg, Projection};
use serde_json::{Value, json};

use crate::common::{FIXED_EPOCH, fixed_membrane, sample_body};

fn sealed_bp() -> SealedProjection {
    fixed_membrane()
        .transduce(
            DomainKey::BloodPressure,
            &RawEnvelope::ok(sample_body(DomainKey::BloodPressure)),
        )
        .unwrap()
}

fn through_json(value: Value) -> SealedProjection {
    serde_json::from_value(value).unwrap()
}

#[test]
fn test_loose_blood_pressure_seals_and_unseals() {
    let sealed = sealed_bp();
    assert!(sealed.verify());
    assert_eq!(sealed.epoch().value(), FIXED_EPOCH);

    let expected = BloodPressure {
        systolic: Mmhg::new(120.0),
        diastolic: Mmhg::new(80.0),
        pulse: Bpm::new(65.0),
        measured_at: EpochMillis::new(1_700_000_000_000),
    };
    let projection = sealed.unseal().unwrap();
    assert_eq!(projection.as_domain::<BloodPressure>(), Some(&expected));
}

#[test]
fn test_untouched_round_trip_still_verifies() {
    let sealed = sealed_bp();
    let restored = through_json(serde_json::to_value(&sealed).unwrap());
    assert!(restored.verify());
    assert_eq!(restored.signature(), sealed.signature());
}

#[test]
fn test_tampered_epoch_is_an_integrity_violation() {
    let sealed = sealed_bp();
    let mut json = serde_json::to_value(&sealed).unwrap();
    json["epoch"] = json!(FIXED_EPOCH + 1);

    let tampered = through_json(json);
    assert!(!tampered.verify());
    let violation = tampered.unseal().unwrap_err();
    assert_eq!(violation.epoch().value(), FIXED_EPOCH + 1);
    assert_eq!(violation.signature(), sealed.signature());
    assert!(tampered.unseal_safe().is_none());
}

#[test]
fn test_tampered_payload_is_rejected() {
    let mut json = serde_json::to_value(sealed_bp()).unwrap();
    json["payload"]["systolic"] = json!(180.0);

    let tampered = through_json(json);
    assert!(!tampered.verify());
    assert!(tampered.apply_morphism(Projection::key).is_err());
}

#[test]
fn test_every_single_character_signature_change_fails_verification() {
    let sealed = sealed_bp();
    let original = sealed.signature().to_string();
    let json = serde_json::to_value(&sealed).unwrap();

    for (index, ch) in original.char_indices() {
        let replacement = if ch == '0' { '1' } else { '0' };
        let mut signature = original.clone();
        signature.replace_range(index..index + ch.len_utf8(), &replacement.to_string());

        let mut forged = json.clone();
        forged["signature"] = json!(signature);
        assert!(
            !through_json(forged).verify(),
            "signature edit at {index} still verified"
        );
    }
}

#[test]
fn test_morphism_reads_through_the_seal() {
    let sealed = sealed_bp();
    let systolic = sealed
        .apply_morphism(|projection| {
            projection
                .as_domain::<BloodPressure>()
                .map(|bp| bp.systolic.value())
        })
        .unwrap();
    assert_eq!(systolic, Some(120.0));
}

#[test]
fn test_unknown_domain_name_is_unregistered() {
    let err = fixed_membrane()
        .transduce_named("unknown_key", &RawEnvelope::ok(json!({})))
        .unwrap_err();
    match err {
        MembraneError::Unregistered(unregistered) => {
            assert_eq!(unregistered.names(), ["unknown_key".to_string()]);
        }
        other => panic!("expected UnregisteredDomain, got {other:?}"),
    }
}

#[test]
fn test_batch_transduction_keeps_input_order() {
    let membrane = fixed_membrane();
    let envelopes: Vec<(DomainKey, RawEnvelope)> = DomainKey::ALL
        .into_iter()
        .rev()
        .map(|key| (key, RawEnvelope::ok(sample_body(key))))
        .collect();
    let results = membrane.transduce_batch(envelopes.iter().map(|(key, raw)| (*key, raw)));

    assert_eq!(results.len(), envelopes.len());
    for ((key, _), result) in envelopes.iter().zip(results) {
        let sealed = result.unwrap();
        assert_eq!(sealed.unseal().unwrap().key(), *key);
    }
}
