//! End-to-end walk through every layer with in-memory collaborators.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use membrane_config::MembraneConfig;
use membrane_core::{Membrane, RawEnvelope, SealedProjection};
use membrane_engine::{
    GateVerdict, Guard, Pipeline, PipelineResult, QueryBridge, StrategyConfig, create_strategy,
    fetch_fn, guard_fn,
};
use membrane_types::{BloodPressure, DomainKey};
use membrane_worker::{MemoryStorage, WorkerBridge};
use serde_json::{Value, json};

const DEMO_USER: &str = "demo";
const DEMO_SECRET: &str = "demo";

/// Canned upstream body per domain, in the loose shapes real feeds send.
pub fn sample_body(key: DomainKey) -> Value {
    match key {
        DomainKey::BloodPressure => json!({"s": 120, "d": 80, "p": 65, "τ": 1_700_000_000_000_i64}),
        DomainKey::HeartRate => {
            json!({"resting": 58, "avg": "72", "max": 141, "timestamp": "2024-03-01T08:00:00Z"})
        }
        DomainKey::Glucose => json!({"mg_dl": "96", "t": 1_700_000_000_000_i64}),
        DomainKey::Weight => json!({"kg": 71.4, "measured_at": "2024-03-01T07:30:00+01:00"}),
        DomainKey::OxygenSaturation => json!({"spo2": 98, "bpm": 64, "ts": 1_700_000_000_000_i64}),
        DomainKey::BodyTemperature => json!({"celsius": 36.8, "t": 1_700_000_000_000_i64}),
        DomainKey::Sleep => json!({"total": 452, "deep": 95, "rem": 110, "t": 1_700_000_000_000_i64}),
    }
}

/// Pipeline with an in-memory strategy for every domain.
pub fn demo_pipeline() -> Result<Pipeline> {
    let mut pipeline = Pipeline::new(Membrane::standard());
    pipeline.register_strategies(DomainKey::ALL.into_iter().map(|key| {
        create_strategy(StrategyConfig::new(
            key,
            format!("memory://{}", key.as_str()),
            fetch_fn(move |_intent| async move { Ok(RawEnvelope::ok(sample_body(key))) }),
        ))
    }));
    pipeline
        .assert_complete()
        .context("demo pipeline is missing strategies")?;
    Ok(pipeline)
}

fn demo_guards() -> Vec<Arc<dyn Guard>> {
    vec![
        guard_fn("session-present", 0, || async { Ok(GateVerdict::pass()) }),
        guard_fn("rate-limit", 10, || async { Ok(GateVerdict::pass()) }),
    ]
}

pub async fn run(config: &MembraneConfig) -> Result<Value> {
    let pipeline = Arc::new(demo_pipeline()?);
    let guards = demo_guards();

    let entries: Vec<(DomainKey, Value)> = DomainKey::ALL
        .into_iter()
        .map(|key| (key, Value::Null))
        .collect();
    let results = pipeline.execute_batch(&entries, &guards).await;

    let mut sealed: Vec<SealedProjection> = Vec::with_capacity(results.len());
    for result in results {
        match result {
            PipelineResult::Success { sealed: envelope, .. } => sealed.push(envelope),
            PipelineResult::Failure { reason, stage, .. } => {
                bail!("demo pipeline failed at {stage}: {reason}");
            }
        }
    }
    tracing::info!(count = sealed.len(), "Sealed every domain");

    let bridge = QueryBridge::new(Arc::clone(&pipeline), config.stale_time())
        .with_guards(guards)
        .with_retry(config.retry_policy());
    let query = bridge.query(DomainKey::BloodPressure, Value::Null, |projection| {
        projection
            .as_domain::<BloodPressure>()
            .map(|bp| bp.systolic.value())
    });
    let state = query.refetch().await;

    let worker = WorkerBridge::spawn(config.worker_config(), Box::new(MemoryStorage::new()))
        .context("failed to start worker")?;
    let user = config.worker.user.as_deref().unwrap_or(DEMO_USER);
    let secret = config.worker.secret.as_deref().unwrap_or(DEMO_SECRET);
    worker.authenticate(user, secret).await?;

    let mut keys = Vec::with_capacity(sealed.len());
    for envelope in &sealed {
        let key = format!("sealed.{}", envelope.unseal()?.key().as_str());
        worker
            .storage_write(&key, serde_json::to_value(envelope)?)
            .await?;
        keys.push(key);
    }
    worker.prefetch(keys.clone());

    // Envelopes crossing the storage boundary are re-verified on the way back.
    let mut restored_ok = 0;
    for key in &keys {
        let Some(stored) = worker.storage_read(key).await? else {
            bail!("worker lost {key}");
        };
        let envelope: SealedProjection = serde_json::from_value(stored)?;
        if envelope.verify() {
            restored_ok += 1;
        }
    }

    let diagnostics = worker.diagnostics().await?;
    worker.logout().await?;
    worker.shutdown().await;

    Ok(json!({
        "projections": sealed,
        "query": {
            "systolic_mmhg": state.data.flatten(),
            "integrity_ok": state.integrity_ok,
            "is_error": state.is_error,
        },
        "storage": { "written": keys.len(), "verified": restored_ok },
        "worker": diagnostics,
    }))
}
