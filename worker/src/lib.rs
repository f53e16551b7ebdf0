//! Worker bridge: authentication, storage and prefetch served from an
//! isolated thread over the Membrane RPC channel.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use membrane_worker::{MemoryStorage, WorkerBridge, WorkerConfig};
//! use serde_json::json;
//!
//! let bridge = WorkerBridge::spawn(WorkerConfig::default(), Box::new(MemoryStorage::new()))?;
//! bridge.authenticate("ada", "secret").await?;
//! bridge.storage_write("profile", json!({"units": "metric"})).await?;
//! bridge.prefetch(["profile"]);
//! let report = bridge.diagnostics().await?;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod bridge;
mod handlers;
mod session;
mod storage;

pub use bridge::{Diagnostics, Session, WorkerBridge, WorkerConfig, WorkerError};
pub use session::{
    Authenticator, DEFAULT_MAX_SESSIONS, NonEmptyCredentials, SESSION_FIELD, SessionInterceptor,
};
pub use storage::{MemoryStorage, StorageBackend, StorageError};
