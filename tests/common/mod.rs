//! Shared test utilities and fixtures

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use membrane_core::{Membrane, RawEnvelope};
use membrane_engine::{
    FetchFailure, GateVerdict, Guard, Pipeline, StrategyConfig, create_strategy, fetch_fn,
    guard_fn,
};
use membrane_types::{DomainKey, Epoch};
use serde_json::{Value, json};

pub const FIXED_EPOCH: i64 = 1_700_000_000_123;

/// A membrane whose clock never moves.
pub fn fixed_membrane() -> Membrane {
    Membrane::standard().with_clock(|| Epoch::new(FIXED_EPOCH))
}

/// A loosely-shaped upstream body that adapts cleanly for `key`.
pub fn sample_body(key: DomainKey) -> Value {
    match key {
        DomainKey::BloodPressure => json!({"s": 120, "d": 80, "p": 65, "τ": 1_700_000_000_000_i64}),
        DomainKey::HeartRate => json!({"rest": 55, "avg": 70, "peak": "150", "t": 1_700_000_000_000_i64}),
        DomainKey::Glucose => json!({"value": 101.5, "timestamp": "2023-11-14T22:13:20Z"}),
        DomainKey::Weight => json!({"weight": "80.2", "t": 1_700_000_000_000_i64}),
        DomainKey::OxygenSaturation => json!({"saturation": 97, "pulse": 61, "t": 1_700_000_000_000_i64}),
        DomainKey::BodyTemperature => json!({"temperature": 37.1, "t": 1_700_000_000_000_i64}),
        DomainKey::Sleep => json!({"asleep": 420, "deep": 80, "rem": 100, "t": 1_700_000_000_000_i64}),
    }
}

/// A guard returning `verdict` and counting how often it ran.
pub fn counting_guard(
    name: &str,
    priority: i32,
    verdict: GateVerdict,
) -> (Arc<dyn Guard>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let guard = guard_fn(name, priority, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let verdict = verdict.clone();
        async move { Ok(verdict) }
    });
    (guard, calls)
}

/// A pipeline where every domain answers with its sample body.
pub fn sample_pipeline() -> Pipeline {
    let mut pipeline = Pipeline::new(fixed_membrane());
    pipeline.register_strategies(DomainKey::ALL.into_iter().map(|key| {
        create_strategy(StrategyConfig::new(
            key,
            format!("test://{}", key.as_str()),
            fetch_fn(move |_intent| async move { Ok(RawEnvelope::ok(sample_body(key))) }),
        ))
    }));
    pipeline
}

/// A strategy for `key` whose fetch fails with `failure` and counts attempts.
pub fn failing_pipeline(key: DomainKey, failure: FetchFailure) -> (Pipeline, Arc<AtomicUsize>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let mut pipeline = Pipeline::new(fixed_membrane());
    pipeline.register_strategy(create_strategy(StrategyConfig::new(
        key,
        "test://failing",
        fetch_fn(move |_intent| {
            counter.fetch_add(1, Ordering::SeqCst);
            let failure = failure.clone();
            async move { Err(failure) }
        }),
    )));
    (pipeline, attempts)
}

/// A strategy for `key` that answers after `delay`.
pub fn delayed_strategy_config(key: DomainKey, delay: Duration) -> StrategyConfig {
    StrategyConfig::new(
        key,
        format!("test://slow/{}", key.as_str()),
        fetch_fn(move |_intent| async move {
            tokio::time::sleep(delay).await;
            Ok(RawEnvelope::ok(sample_body(key)))
        }),
    )
}
