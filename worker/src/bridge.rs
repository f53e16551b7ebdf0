//! Caller-facing handle to the isolated worker.
//!
//! The worker owns a dedicated OS thread with its own current-thread runtime,
//! so blocking lock waits there never stall the caller's executor. The two
//! sides share nothing but an in-memory byte stream carrying RPC frames.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use membrane_rpc::{
    CallOptions, ChannelMetricsSnapshot, ClientConfig, Interceptor, MethodId, RpcClient, RpcError,
    StatusCode, TracingInterceptor,
};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{duplex, split};
use tokio::sync::oneshot;

use crate::handlers::{WorkerState, build_server};
use crate::session::{
    Authenticator, DEFAULT_MAX_SESSIONS, NonEmptyCredentials, SessionInterceptor,
};
use crate::storage::StorageBackend;

const DEFAULT_CHANNEL_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to build worker runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub thread_name: String,
    /// Upper bound on every lock wait inside the worker.
    pub lock_timeout: Duration,
    /// Caller-side channel settings. Its frame limit also bounds the
    /// worker's replies; the session and tracing interceptors run ahead of
    /// any listed here.
    pub rpc: ClientConfig,
    /// Open sessions kept by the worker before the oldest is evicted.
    pub max_sessions: usize,
    /// Buffer size of the in-memory stream between caller and worker.
    pub channel_bytes: usize,
    pub authenticator: Arc<dyn Authenticator>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: "membrane-worker".to_string(),
            lock_timeout: Duration::from_secs(2),
            rpc: ClientConfig::default(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            channel_bytes: DEFAULT_CHANNEL_BYTES,
            authenticator: Arc::new(NonEmptyCredentials),
        }
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("thread_name", &self.thread_name)
            .field("lock_timeout", &self.lock_timeout)
            .field("rpc", &self.rpc)
            .field("max_sessions", &self.max_sessions)
            .field("channel_bytes", &self.channel_bytes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: String,
    pub token: String,
}

/// Channel metrics from the caller's side merged with the worker's own report.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub channel: ChannelMetricsSnapshot,
    pub worker_context: u64,
    pub sessions: u64,
    pub cache_entries: u64,
    pub locks: Value,
}

pub struct WorkerBridge {
    client: Arc<RpcClient>,
    session: Arc<SessionInterceptor>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for WorkerBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerBridge")
            .field("running", &self.thread.is_some())
            .field("authenticated", &self.session.token().is_some())
            .finish_non_exhaustive()
    }
}

impl WorkerBridge {
    /// Start the worker thread. Must be called from within a tokio runtime;
    /// the client half runs on the caller's runtime.
    pub fn spawn(
        config: WorkerConfig,
        storage: Box<dyn StorageBackend>,
    ) -> Result<Self, WorkerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(WorkerError::Runtime)?;

        let state = Arc::new(WorkerState::new(
            storage,
            Arc::clone(&config.authenticator),
            config.lock_timeout,
            config.max_sessions,
        ));
        let server = build_server(&state, config.rpc.max_frame_bytes);

        let (client_io, worker_io) = duplex(config.channel_bytes);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread_name = config.thread_name.clone();

        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                tracing::info!(thread = %thread_name, "Worker started");
                runtime.block_on(async move {
                    let (reader, writer) = split(worker_io);
                    tokio::select! {
                        result = server.serve(reader, writer) => {
                            if let Err(e) = result {
                                tracing::warn!("Worker channel failed: {e}");
                            }
                        }
                        _ = shutdown_rx => {}
                    }
                });
                tracing::info!(thread = %thread_name, "Worker stopped");
            })
            .map_err(WorkerError::Spawn)?;

        let session = Arc::new(SessionInterceptor::default());
        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::clone(&session) as Arc<dyn Interceptor>,
            Arc::new(TracingInterceptor),
        ];
        interceptors.extend(config.rpc.interceptors.iter().cloned());
        let (reader, writer) = split(client_io);
        let client = RpcClient::connect(
            reader,
            writer,
            ClientConfig {
                interceptors,
                ..config.rpc
            },
        );

        Ok(Self {
            client: Arc::new(client),
            session,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    async fn call(&self, method: MethodId, payload: Value) -> Result<Value, RpcError> {
        self.client
            .call(method, payload, CallOptions::default())
            .await
    }

    pub async fn ping(&self) -> Result<Value, RpcError> {
        self.call(MethodId::Ping, json!({})).await
    }

    /// Open a session; later storage calls carry its token automatically.
    pub async fn authenticate(&self, user: &str, secret: &str) -> Result<Session, RpcError> {
        let reply = self
            .call(MethodId::Authenticate, json!({ "user": user, "secret": secret }))
            .await?;
        let token = reply
            .get("session")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::internal("authenticate reply carried no session"))?
            .to_string();
        self.session.set(token.clone());
        Ok(Session {
            user: user.to_string(),
            token,
        })
    }

    /// Close the current session on the worker. A no-op without one.
    pub async fn logout(&self) -> Result<(), RpcError> {
        if self.session.token().is_none() {
            return Ok(());
        }
        let result = self.call(MethodId::Logout, json!({})).await;
        self.session.clear();
        result.map(drop)
    }

    /// `Ok(None)` when nothing is stored under `key`.
    pub async fn storage_read(&self, key: &str) -> Result<Option<Value>, RpcError> {
        match self.call(MethodId::StorageRead, json!({ "key": key })).await {
            Ok(mut reply) => Ok(Some(take_field(&mut reply, "value"))),
            Err(e) if e.code == StatusCode::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn storage_write(&self, key: &str, value: Value) -> Result<(), RpcError> {
        self.call(MethodId::StorageWrite, json!({ "key": key, "value": value }))
            .await
            .map(drop)
    }

    /// Ask the worker to warm its cache for `keys`. Returns immediately; the
    /// outcome is only logged.
    pub fn prefetch<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            let count = keys.len();
            match client
                .call(MethodId::Prefetch, json!({ "keys": keys }), CallOptions::default())
                .await
            {
                Ok(reply) => tracing::debug!(requested = count, warmed = %reply["warmed"], "Prefetch finished"),
                Err(e) => tracing::debug!(requested = count, "Prefetch failed: {e}"),
            }
        });
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics, RpcError> {
        let mut report = self.call(MethodId::Diagnostics, json!({})).await?;
        Ok(Diagnostics {
            channel: self.client.metrics().await,
            worker_context: report["context"].as_u64().unwrap_or_default(),
            sessions: report["sessions"].as_u64().unwrap_or_default(),
            cache_entries: report["cache_entries"].as_u64().unwrap_or_default(),
            locks: take_field(&mut report, "locks"),
        })
    }

    #[must_use]
    pub fn session_token(&self) -> Option<String> {
        self.session.token()
    }

    /// Stop the worker and wait for its thread to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::warn!("Worker thread did not exit cleanly");
            }
        }
    }
}

fn take_field(reply: &mut Value, field: &str) -> Value {
    reply.get_mut(field).map(Value::take).unwrap_or_default()
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StorageError};
    use futures_util::future::join_all;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that records how many operations per kind overlap.
    #[derive(Default)]
    struct SlowStorage {
        inner: MemoryStorage,
        delay: Duration,
        writes_in_flight: AtomicU32,
        max_writes_in_flight: AtomicU32,
        reads_in_flight: AtomicU32,
        max_reads_in_flight: AtomicU32,
        write_order: Mutex<Vec<String>>,
    }

    impl SlowStorage {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }
    }

    fn track(current: &AtomicU32, max: &AtomicU32, delay: Duration) {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(delay);
        current.fetch_sub(1, Ordering::SeqCst);
    }

    struct Shared(Arc<SlowStorage>);

    impl StorageBackend for Shared {
        fn read(&self, key: &str) -> Result<Option<Value>, StorageError> {
            track(&self.0.reads_in_flight, &self.0.max_reads_in_flight, self.0.delay);
            self.0.inner.read(key)
        }

        fn write(&self, key: &str, value: Value) -> Result<(), StorageError> {
            track(&self.0.writes_in_flight, &self.0.max_writes_in_flight, self.0.delay);
            self.0
                .write_order
                .lock()
                .unwrap()
                .push(value.to_string());
            self.0.inner.write(key, value)
        }
    }

    async fn authed(storage: Box<dyn StorageBackend>) -> WorkerBridge {
        let bridge = WorkerBridge::spawn(WorkerConfig::default(), storage).unwrap();
        bridge.authenticate("ada", "secret").await.unwrap();
        bridge
    }

    #[tokio::test]
    async fn test_round_trip_through_worker_thread() {
        let bridge = authed(Box::new(MemoryStorage::new())).await;
        assert!(bridge.session_token().is_some());

        assert_eq!(bridge.storage_read("profile").await.unwrap(), None);
        bridge
            .storage_write("profile", json!({"name": "ada"}))
            .await
            .unwrap();
        assert_eq!(
            bridge.storage_read("profile").await.unwrap(),
            Some(json!({"name": "ada"}))
        );
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_storage_without_session_is_unauthenticated() {
        let bridge = WorkerBridge::spawn(WorkerConfig::default(), Box::new(MemoryStorage::new())).unwrap();
        let err = bridge.storage_read("profile").await.unwrap_err();
        assert_eq!(err.code, StatusCode::Unauthenticated);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_logout_closes_the_worker_session() {
        let bridge = authed(Box::new(MemoryStorage::new())).await;
        assert_eq!(bridge.diagnostics().await.unwrap().sessions, 1);

        bridge.logout().await.unwrap();
        assert!(bridge.session_token().is_none());
        assert_eq!(bridge.diagnostics().await.unwrap().sessions, 0);
        let err = bridge.storage_read("profile").await.unwrap_err();
        assert_eq!(err.code, StatusCode::Unauthenticated);
        bridge.logout().await.unwrap();
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_settings_reach_the_channel() {
        let config = WorkerConfig {
            rpc: ClientConfig {
                max_frame_bytes: 512,
                ..ClientConfig::default()
            },
            ..WorkerConfig::default()
        };
        let bridge = WorkerBridge::spawn(config, Box::new(MemoryStorage::new())).unwrap();
        bridge.authenticate("ada", "secret").await.unwrap();

        let err = bridge
            .storage_write("big", json!("x".repeat(1024)))
            .await
            .unwrap_err();
        assert_eq!(err.code, StatusCode::ResourceExhausted);
        bridge.storage_write("small", json!("x")).await.unwrap();
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_writes_to_one_key_never_overlap() {
        let storage = SlowStorage::new(Duration::from_millis(20));
        let bridge = authed(Box::new(Shared(Arc::clone(&storage)))).await;

        let writes = (0..4).map(|i| bridge.storage_write("counter", json!(i)));
        for result in join_all(writes).await {
            result.unwrap();
        }
        assert_eq!(storage.max_writes_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(storage.write_order.lock().unwrap().len(), 4);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_reads_of_one_key_run_concurrently() {
        let storage = SlowStorage::new(Duration::from_millis(100));
        storage.inner.write("profile", json!(1)).unwrap();
        let bridge = authed(Box::new(Shared(Arc::clone(&storage)))).await;

        let reads = (0..3).map(|_| bridge.storage_read("profile"));
        for result in join_all(reads).await {
            assert_eq!(result.unwrap(), Some(json!(1)));
        }
        assert!(storage.max_reads_in_flight.load(Ordering::SeqCst) > 1);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_prefetch_returns_immediately_and_warms_cache() {
        let storage = MemoryStorage::with_entries(HashMap::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
        ]));
        let bridge = authed(Box::new(storage)).await;

        bridge.prefetch(["a", "b", "missing"]);

        let mut cache_entries = 0;
        for _ in 0..50 {
            cache_entries = bridge.diagnostics().await.unwrap().cache_entries;
            if cache_entries == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache_entries, 2);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_diagnostics_merges_channel_and_lock_metrics() {
        let bridge = authed(Box::new(MemoryStorage::new())).await;
        bridge.storage_write("k", json!(true)).await.unwrap();

        let report = bridge.diagnostics().await.unwrap();
        assert!(report.channel.calls >= 2);
        assert_eq!(report.sessions, 1);
        assert_ne!(report.worker_context, 0);
        assert_ne!(report.worker_context, membrane_sync::ContextId::current().value());
        assert_eq!(report.locks[0]["name"], "storage/k");
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let bridge = authed(Box::new(MemoryStorage::new())).await;
        let client = Arc::clone(&bridge.client);
        bridge.shutdown().await;
        let err = client
            .call(MethodId::Ping, json!({}), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.code,
            StatusCode::Unavailable | StatusCode::DeadlineExceeded
        ));
    }
}
