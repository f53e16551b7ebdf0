//! Membrane configuration.
//!
//! Read from `$MEMBRANE_CONFIG` when set, otherwise `~/.membrane/config.toml`.
//! Every section and field is optional:
//!
//! ```toml
//! [pipeline]
//! max_retries = 3
//! base_delay_ms = 250
//! max_delay_ms = 8000
//!
//! [rpc]
//! call_timeout_ms = 5000
//! max_frame_bytes = 4194304
//!
//! [worker]
//! thread_name = "membrane-worker"
//! lock_timeout_ms = 2000
//! max_sessions = 1024
//! user = "${MEMBRANE_USER}"
//! secret = "${MEMBRANE_SECRET}"
//!
//! [query]
//! stale_time_ms = 30000
//! ```
//!
//! String values may reference environment variables as `${VAR}`.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fmt, fs};

use membrane_engine::RetryPolicy;
use membrane_rpc::{ClientConfig, DEFAULT_MAX_FRAME_BYTES};
use membrane_worker::{DEFAULT_MAX_SESSIONS, WorkerConfig};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV: &str = "MEMBRANE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MembraneConfig {
    pub pipeline: PipelineConfig,
    pub rpc: RpcConfig,
    pub worker: WorkerSettings,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: millis(policy.base_delay),
            max_delay_ms: millis(policy.max_delay),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub call_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub thread_name: String,
    pub lock_timeout_ms: u64,
    pub max_sessions: usize,
    /// Credentials the CLI uses to open a worker session.
    pub user: Option<String>,
    pub secret: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            thread_name: "membrane-worker".to_string(),
            lock_timeout_ms: 2_000,
            max_sessions: DEFAULT_MAX_SESSIONS,
            user: None,
            secret: None,
        }
    }
}

// Keep the secret out of logs.
impl fmt::Debug for WorkerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSettings")
            .field("thread_name", &self.thread_name)
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("max_sessions", &self.max_sessions)
            .field("user", &self.user)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub stale_time_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: 30_000,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Replace every `${VAR}` with the variable's value (empty when unset).
/// An unterminated `${` is kept verbatim.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if !var.is_empty() {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".membrane").join("config.toml"))
}

impl MembraneConfig {
    /// Load from the default location. A missing file yields defaults; an
    /// unreadable or malformed one is logged and also yields defaults.
    #[must_use]
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("{err}; using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.expand_env();
        Ok(config)
    }

    fn expand_env(&mut self) {
        let worker = &mut self.worker;
        worker.thread_name = expand_env_vars(&worker.thread_name);
        for field in [&mut worker.user, &mut worker.secret] {
            if let Some(value) = field.as_mut() {
                *value = expand_env_vars(value);
            }
            if field.as_deref().is_some_and(str::is_empty) {
                *field = None;
            }
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.pipeline.max_retries,
            base_delay: Duration::from_millis(self.pipeline.base_delay_ms),
            max_delay: Duration::from_millis(self.pipeline.max_delay_ms),
        }
    }

    #[must_use]
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.query.stale_time_ms)
    }

    /// Channel settings from `[rpc]`; the worker bridge's client uses them.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            call_timeout: Duration::from_millis(self.rpc.call_timeout_ms),
            max_frame_bytes: self.rpc.max_frame_bytes,
            ..ClientConfig::default()
        }
    }

    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            thread_name: self.worker.thread_name.clone(),
            lock_timeout: Duration::from_millis(self.worker.lock_timeout_ms),
            rpc: self.client_config(),
            max_sessions: self.worker.max_sessions,
            ..WorkerConfig::default()
        }
    }
}
