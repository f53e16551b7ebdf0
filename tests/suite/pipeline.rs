//! Pipeline ordering, gating and retry behavior.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use membrane_engine::{
    FetchFailure, GateVerdict, Pipeline, PipelineError, PipelineResult, QueryBridge, RetryPolicy,
    Stage, create_strategy,
};
use membrane_types::{BloodPressure, DomainKey};
use serde_json::Value;

use crate::common::{
    counting_guard, delayed_strategy_config, failing_pipeline, fixed_membrane, sample_pipeline,
};

#[tokio::test]
async fn test_lower_priority_rejection_stops_before_later_guards() {
    let pipeline = sample_pipeline();
    let (late, late_calls) = counting_guard("late", 10, GateVerdict::pass());
    let (early, early_calls) = counting_guard("early", 5, GateVerdict::reject("quota exhausted"));

    let result = pipeline
        .execute(DomainKey::Glucose, &Value::Null, &[late, early])
        .await;

    assert_eq!(result.stage(), Some(Stage::Gate));
    assert_eq!(early_calls.load(Ordering::SeqCst), 1);
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    match result {
        PipelineResult::Failure { reason, token, .. } => {
            assert!(reason.contains("quota exhausted"), "{reason}");
            assert!(token.is_some());
        }
        PipelineResult::Success { .. } => panic!("rejected intent was fetched"),
    }
}

#[tokio::test]
async fn test_every_guard_passing_reaches_seal() {
    let pipeline = sample_pipeline();
    let (first, first_calls) = counting_guard("first", 0, GateVerdict::pass());
    let (second, second_calls) = counting_guard("second", 1, GateVerdict::pass());

    let result = pipeline
        .execute(DomainKey::BloodPressure, &Value::Null, &[second, first])
        .await;

    let sealed = result.sealed().expect("pipeline failed");
    assert!(sealed.verify());
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fatal_fetch_failure_is_not_retried() {
    let (pipeline, attempts) =
        failing_pipeline(DomainKey::Weight, FetchFailure::fatal("bad request").with_status(400));
    let policy = RetryPolicy::new(3, Duration::from_millis(1));

    let result = pipeline
        .execute_with_retry(DomainKey::Weight, &Value::Null, &[], &policy)
        .await;

    assert_eq!(result.stage(), Some(Stage::Fetch));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_fetch_failure_exhausts_retries() {
    let (pipeline, attempts) = failing_pipeline(
        DomainKey::Sleep,
        FetchFailure::transient("busy", Duration::from_millis(100)).with_status(503),
    );
    let policy = RetryPolicy::new(3, Duration::from_millis(10));

    let result = pipeline
        .execute_with_retry(DomainKey::Sleep, &Value::Null, &[], &policy)
        .await;

    assert_eq!(result.stage(), Some(Stage::Fetch));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(result.retry_after().is_some());
}

#[tokio::test]
async fn test_batch_results_follow_input_order() {
    let mut pipeline = Pipeline::new(fixed_membrane());
    let delays = [
        (DomainKey::HeartRate, 40),
        (DomainKey::Glucose, 5),
        (DomainKey::BodyTemperature, 20),
    ];
    for (key, millis) in delays {
        pipeline.register_strategy(create_strategy(delayed_strategy_config(
            key,
            Duration::from_millis(millis),
        )));
    }

    let entries: Vec<(DomainKey, Value)> =
        delays.iter().map(|(key, _)| (*key, Value::Null)).collect();
    let results = pipeline.execute_batch(&entries, &[]).await;

    let keys: Vec<DomainKey> = results
        .iter()
        .map(|result| result.sealed().unwrap().unseal().unwrap().key())
        .collect();
    assert_eq!(
        keys,
        vec![
            DomainKey::HeartRate,
            DomainKey::Glucose,
            DomainKey::BodyTemperature
        ]
    );
}

#[tokio::test]
async fn test_unknown_name_fails_at_resolve() {
    let pipeline = sample_pipeline();
    let result = pipeline
        .execute_named("unknown_key", &Value::Null, &[])
        .await;

    match result {
        PipelineResult::Failure {
            stage, token, error, ..
        } => {
            assert_eq!(stage, Stage::Resolve);
            assert!(token.is_none());
            assert!(matches!(error, PipelineError::Unregistered(_)));
        }
        PipelineResult::Success { .. } => panic!("unknown domain executed"),
    }
}

#[tokio::test]
async fn test_missing_strategy_is_reported() {
    let mut pipeline = Pipeline::new(fixed_membrane());
    pipeline.register_strategy(create_strategy(delayed_strategy_config(
        DomainKey::Weight,
        Duration::ZERO,
    )));

    let err = pipeline.assert_complete().unwrap_err();
    assert!(!err.names().contains(&"weight".to_string()));
    assert_eq!(err.names().len(), DomainKey::ALL.len() - 1);

    let result = pipeline
        .execute(DomainKey::Glucose, &Value::Null, &[])
        .await;
    assert_eq!(result.stage(), Some(Stage::Resolve));
}

#[tokio::test]
async fn test_query_bridge_selects_from_verified_envelope() {
    let pipeline = Arc::new(sample_pipeline());
    let bridge = QueryBridge::new(pipeline, Duration::from_secs(30));
    let query = bridge.query(DomainKey::BloodPressure, Value::Null, |projection| {
        projection
            .as_domain::<BloodPressure>()
            .map(|bp| (bp.systolic.value(), bp.diastolic.value()))
    });

    let state = query.refetch().await;
    assert!(state.integrity_ok);
    assert!(!state.is_error);
    assert_eq!(state.data.flatten(), Some((120.0, 80.0)));
}
