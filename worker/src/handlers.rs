//! Worker-side RPC handlers.
//!
//! Storage access always goes through the `storage/<key>` reader-writer lock:
//! reads and prefetch take it shared, writes take it exclusive, so at most one
//! write per key is ever in flight. Every wait is bounded by the configured
//! lock timeout; a timeout is reported as `DEADLINE_EXCEEDED` rather than
//! blocking the worker indefinitely.

use std::collections::HashMap;
use std::future::ready;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use membrane_rpc::{MethodId, RpcError, RpcServer, handler};
use membrane_sync::{ContextId, LockError, LockManager, RwLock};
use serde_json::{Value, json};

use crate::session::{Authenticator, SessionStore};
use crate::storage::{StorageBackend, StorageError};

pub(crate) struct WorkerState {
    pub(crate) storage: Box<dyn StorageBackend>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) sessions: SessionStore,
    pub(crate) locks: LockManager,
    pub(crate) cache: Mutex<HashMap<String, Value>>,
    pub(crate) lock_timeout: Duration,
}

impl WorkerState {
    pub(crate) fn new(
        storage: Box<dyn StorageBackend>,
        authenticator: Arc<dyn Authenticator>,
        lock_timeout: Duration,
        max_sessions: usize,
    ) -> Self {
        Self {
            storage,
            authenticator,
            sessions: SessionStore::new(max_sessions),
            locks: LockManager::new(),
            cache: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    fn require_session(&self, payload: &Value) -> Result<String, RpcError> {
        self.sessions
            .user_for(payload)
            .ok_or_else(|| RpcError::unauthenticated("missing or unknown session token"))
    }

    fn storage_lock(&self, key: &str) -> Result<Arc<RwLock>, RpcError> {
        self.locks
            .rwlock(&format!("storage/{key}"))
            .map_err(lock_error)
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_error(error: LockError) -> RpcError {
    match error {
        LockError::Timeout { .. } => RpcError::deadline_exceeded(error.to_string()),
        LockError::InvalidName { .. } => RpcError::invalid_argument(error.to_string()),
        LockError::NotHeld { .. } | LockError::KindMismatch { .. } => {
            RpcError::internal(error.to_string())
        }
    }
}

fn storage_error(error: StorageError) -> RpcError {
    RpcError::internal(error.to_string())
}

fn string_field<'a>(payload: &'a Value, field: &str) -> Result<&'a str, RpcError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RpcError::invalid_argument(format!("'{field}' must be a non-empty string")))
}

/// Run lock-taking storage work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, RpcError>
where
    F: FnOnce() -> Result<T, RpcError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RpcError::internal(format!("storage task failed: {e}")))?
}

fn ping(payload: Value) -> Result<Value, RpcError> {
    Ok(json!({ "pong": true, "echo": payload }))
}

fn authenticate(state: &WorkerState, payload: &Value) -> Result<Value, RpcError> {
    let user = string_field(payload, "user")?;
    let secret = payload.get("secret").and_then(Value::as_str).unwrap_or_default();
    if !state.authenticator.authenticate(user, secret) {
        tracing::debug!(user, "Authentication rejected");
        return Err(RpcError::unauthenticated(format!("credentials rejected for '{user}'")));
    }
    let token = state.sessions.issue(user);
    tracing::info!(user, "Session opened");
    Ok(json!({ "session": token, "user": user }))
}

fn logout(state: &WorkerState, payload: &Value) -> Result<Value, RpcError> {
    let user = state
        .sessions
        .revoke(payload)
        .ok_or_else(|| RpcError::unauthenticated("missing or unknown session token"))?;
    tracing::info!(user = %user, "Session closed");
    Ok(json!({ "user": user, "revoked": true }))
}

async fn storage_read(state: Arc<WorkerState>, payload: Value) -> Result<Value, RpcError> {
    state.require_session(&payload)?;
    let key = string_field(&payload, "key")?.to_string();
    blocking(move || {
        let lock = state.storage_lock(&key)?;
        let _guard = lock.read_timeout(state.lock_timeout).map_err(lock_error)?;
        if let Some(value) = state.cache().get(&key).cloned() {
            return Ok(json!({ "key": key, "value": value, "cached": true }));
        }
        match state.storage.read(&key).map_err(storage_error)? {
            Some(value) => Ok(json!({ "key": key, "value": value, "cached": false })),
            None => Err(RpcError::not_found(format!("no value stored under '{key}'"))),
        }
    })
    .await
}

async fn storage_write(state: Arc<WorkerState>, payload: Value) -> Result<Value, RpcError> {
    state.require_session(&payload)?;
    let key = string_field(&payload, "key")?.to_string();
    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    blocking(move || {
        let lock = state.storage_lock(&key)?;
        let _guard = lock.write_timeout(state.lock_timeout).map_err(lock_error)?;
        state.storage.write(&key, value).map_err(storage_error)?;
        state.cache().remove(&key);
        Ok(json!({ "key": key, "written": true }))
    })
    .await
}

async fn prefetch(state: Arc<WorkerState>, payload: Value) -> Result<Value, RpcError> {
    state.require_session(&payload)?;
    let keys: Vec<String> = payload
        .get("keys")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::invalid_argument("'keys' must be an array of strings"))?
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    blocking(move || {
        let mut warmed = 0_usize;
        for key in &keys {
            // Best effort: a contended or missing key is skipped, not fatal.
            let lock = match state.storage_lock(key) {
                Ok(lock) => lock,
                Err(error) => {
                    tracing::debug!(key = %key, "Prefetch skipped: {}", error.message);
                    continue;
                }
            };
            let Ok(_guard) = lock.read_timeout(state.lock_timeout) else {
                tracing::debug!(key = %key, "Prefetch skipped: lock busy");
                continue;
            };
            if state.cache().contains_key(key) {
                warmed += 1;
                continue;
            }
            match state.storage.read(key) {
                Ok(Some(value)) => {
                    state.cache().insert(key.clone(), value);
                    warmed += 1;
                }
                Ok(None) => {}
                Err(error) => tracing::debug!(key = %key, "Prefetch read failed: {error}"),
            }
        }
        Ok(json!({ "requested": keys.len(), "warmed": warmed }))
    })
    .await
}

fn diagnostics(state: &WorkerState) -> Result<Value, RpcError> {
    let locks = serde_json::to_value(state.locks.snapshot())
        .map_err(|e| RpcError::internal(format!("failed to encode lock metrics: {e}")))?;
    Ok(json!({
        "context": ContextId::current(),
        "sessions": state.sessions.len(),
        "cache_entries": state.cache().len(),
        "locks": locks,
    }))
}

pub(crate) fn build_server(state: &Arc<WorkerState>, max_frame_bytes: usize) -> RpcServer {
    let mut server = RpcServer::new().with_max_frame_bytes(max_frame_bytes);
    server.register(MethodId::Ping, handler(|payload| ready(ping(payload))));
    let s = Arc::clone(state);
    server.register(
        MethodId::Authenticate,
        handler(move |payload| ready(authenticate(&s, &payload))),
    );
    let s = Arc::clone(state);
    server.register(
        MethodId::Logout,
        handler(move |payload| ready(logout(&s, &payload))),
    );
    let s = Arc::clone(state);
    server.register(
        MethodId::StorageRead,
        handler(move |payload| storage_read(Arc::clone(&s), payload)),
    );
    let s = Arc::clone(state);
    server.register(
        MethodId::StorageWrite,
        handler(move |payload| storage_write(Arc::clone(&s), payload)),
    );
    let s = Arc::clone(state);
    server.register(
        MethodId::Prefetch,
        handler(move |payload| prefetch(Arc::clone(&s), payload)),
    );
    let s = Arc::clone(state);
    server.register(
        MethodId::Diagnostics,
        handler(move |_| ready(diagnostics(&s))),
    );
    server
}
