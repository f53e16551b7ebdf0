//! Worker bridge driving pipeline admission and storing sealed envelopes.

use std::sync::Arc;

use membrane_core::SealedProjection;
use membrane_engine::{GateVerdict, GuardError, Stage, guard_fn};
use membrane_rpc::StatusCode;
use membrane_types::DomainKey;
use membrane_worker::{MemoryStorage, WorkerBridge, WorkerConfig};
use serde_json::{Value, json};

use crate::common::sample_pipeline;

fn spawn_worker(storage: MemoryStorage) -> Arc<WorkerBridge> {
    Arc::new(WorkerBridge::spawn(WorkerConfig::default(), Box::new(storage)).unwrap())
}

#[tokio::test]
async fn test_guard_consults_worker_storage() {
    let worker = spawn_worker(MemoryStorage::with_entries([(
        "flags.sync",
        json!({"enabled": false}),
    )]));
    worker.authenticate("ada", "pw").await.unwrap();

    let flags = Arc::clone(&worker);
    let guard = guard_fn("sync-enabled", 0, move || {
        let flags = Arc::clone(&flags);
        async move {
            let flag = flags
                .storage_read("flags.sync")
                .await
                .map_err(|e| GuardError(e.to_string()))?;
            let enabled = flag
                .as_ref()
                .and_then(|v| v["enabled"].as_bool())
                .unwrap_or(false);
            Ok::<_, GuardError>(if enabled {
                GateVerdict::pass()
            } else {
                GateVerdict::reject("sync disabled")
            })
        }
    });

    let pipeline = sample_pipeline();
    let guards = [guard];
    let rejected = pipeline
        .execute(DomainKey::HeartRate, &Value::Null, &guards)
        .await;
    assert_eq!(rejected.stage(), Some(Stage::Gate));

    worker
        .storage_write("flags.sync", json!({"enabled": true}))
        .await
        .unwrap();
    let admitted = pipeline
        .execute(DomainKey::HeartRate, &Value::Null, &guards)
        .await;
    assert!(admitted.is_success());
}

#[tokio::test]
async fn test_sealed_envelopes_survive_worker_storage() {
    let worker = spawn_worker(MemoryStorage::new());
    worker.authenticate("ada", "pw").await.unwrap();

    let pipeline = sample_pipeline();
    let entries: Vec<(DomainKey, Value)> = DomainKey::ALL
        .into_iter()
        .map(|key| (key, Value::Null))
        .collect();
    for (result, (key, _)) in pipeline
        .execute_batch(&entries, &[])
        .await
        .into_iter()
        .zip(&entries)
    {
        let sealed = result.sealed().unwrap();
        worker
            .storage_write(key.as_str(), serde_json::to_value(sealed).unwrap())
            .await
            .unwrap();
    }

    worker.prefetch(DomainKey::ALL.map(DomainKey::as_str));
    for key in DomainKey::ALL {
        let stored = worker.storage_read(key.as_str()).await.unwrap().unwrap();
        let envelope: SealedProjection = serde_json::from_value(stored).unwrap();
        assert_eq!(envelope.unseal().unwrap().key(), key);
    }
    assert_eq!(worker.storage_read("absent").await.unwrap(), None);
}

#[tokio::test]
async fn test_worker_requires_a_session() {
    let worker = spawn_worker(MemoryStorage::new());
    let err = worker.storage_read("anything").await.unwrap_err();
    assert_eq!(err.code, StatusCode::Unauthenticated);

    worker.authenticate("ada", "pw").await.unwrap();
    assert!(worker.session_token().is_some());
    assert!(worker.storage_read("anything").await.unwrap().is_none());
}
