//! Strategies: the per-domain resolve/fetch/adapt triplet.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use membrane_core::{AdaptError, AdapterFn, RawEnvelope, adapt};
use membrane_types::{DomainKey, IntentToken, Projection};

use crate::error::{FetchFailure, ResolveError};
use crate::retry::{is_retryable_status, parse_retry_after};

/// A fully resolved description of one pipeline invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIntent {
    pub key: DomainKey,
    pub indicator: String,
    pub endpoint: String,
    pub method: String,
    pub params: Value,
    pub token: IntentToken,
}

pub type FetchFut<'a> = Pin<Box<dyn Future<Output = Result<RawEnvelope, FetchFailure>> + Send + 'a>>;

pub trait Strategy: Send + Sync {
    fn key(&self) -> DomainKey;

    fn resolve(&self, params: &Value) -> Result<ResolvedIntent, ResolveError>;

    fn fetch<'a>(&'a self, intent: &'a ResolvedIntent) -> FetchFut<'a>;

    /// Turn a successful envelope into a projection. Defaults to the
    /// membrane's built-in adapter for [`Strategy::key`].
    fn adapt(&self, raw: &RawEnvelope) -> Result<Projection, AdaptError> {
        adapt(self.key(), &raw.body)
    }
}

/// Transport used by a standard strategy. Receives the resolved intent and
/// returns whatever the upstream answered; status handling happens afterwards.
pub type FetchFn = Arc<dyn Fn(ResolvedIntent) -> FetchFut<'static> + Send + Sync>;

/// Wrap an async closure as a [`FetchFn`].
pub fn fetch_fn<F, Fut>(f: F) -> FetchFn
where
    F: Fn(ResolvedIntent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RawEnvelope, FetchFailure>> + Send + 'static,
{
    Arc::new(move |intent| -> FetchFut<'static> { Box::pin(f(intent)) })
}

/// Configuration for [`create_strategy`].
pub struct StrategyConfig {
    pub key: DomainKey,
    pub endpoint: String,
    pub method: String,
    /// Defaults to the key's registry indicator.
    pub indicator: Option<String>,
    /// Defaults to the membrane's built-in adapter for `key`.
    pub adapt_body: Option<AdapterFn>,
    pub fetch_fn: FetchFn,
}

impl StrategyConfig {
    /// `GET` config for `key` with the default indicator and adapter.
    #[must_use]
    pub fn new(key: DomainKey, endpoint: impl Into<String>, fetch_fn: FetchFn) -> Self {
        Self {
            key,
            endpoint: endpoint.into(),
            method: "GET".to_string(),
            indicator: None,
            adapt_body: None,
            fetch_fn,
        }
    }
}

struct StandardStrategy {
    key: DomainKey,
    endpoint: String,
    method: String,
    indicator: String,
    adapt_body: Option<AdapterFn>,
    fetch_fn: FetchFn,
}

impl fmt::Debug for StandardStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardStrategy")
            .field("key", &self.key)
            .field("endpoint", &self.endpoint)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

fn status_failure(endpoint: &str, raw: &RawEnvelope) -> FetchFailure {
    let message = format!("{endpoint} responded with status {}", raw.status);
    let failure = if is_retryable_status(raw.status) {
        FetchFailure::transient(message, parse_retry_after(raw).unwrap_or(Duration::ZERO))
    } else {
        FetchFailure::fatal(message)
    };
    failure.with_status(raw.status)
}

impl Strategy for StandardStrategy {
    fn key(&self) -> DomainKey {
        self.key
    }

    fn resolve(&self, params: &Value) -> Result<ResolvedIntent, ResolveError> {
        if !(params.is_null() || params.is_object()) {
            return Err(ResolveError::new(format!(
                "{}: params must be an object",
                self.key
            )));
        }
        Ok(ResolvedIntent {
            key: self.key,
            indicator: self.indicator.clone(),
            endpoint: self.endpoint.clone(),
            method: self.method.clone(),
            params: params.clone(),
            token: IntentToken::generate(),
        })
    }

    fn fetch<'a>(&'a self, intent: &'a ResolvedIntent) -> FetchFut<'a> {
        Box::pin(async move {
            let raw = (self.fetch_fn)(intent.clone()).await?;
            if raw.is_success() {
                Ok(raw)
            } else {
                Err(status_failure(&self.endpoint, &raw))
            }
        })
    }

    fn adapt(&self, raw: &RawEnvelope) -> Result<Projection, AdaptError> {
        match &self.adapt_body {
            Some(adapt_body) => adapt_body(&raw.body),
            None => adapt(self.key, &raw.body),
        }
    }
}

/// Build the common "call an endpoint, then adapt the body" strategy.
///
/// Non-2xx envelopes become [`FetchFailure`]s; 408, 429 and 5xx are transient
/// and carry the upstream `retry-after-ms`/`retry-after` hint when present.
#[must_use]
pub fn create_strategy(config: StrategyConfig) -> Arc<dyn Strategy> {
    let indicator = config
        .indicator
        .unwrap_or_else(|| config.key.indicator().to_string());
    Arc::new(StandardStrategy {
        key: config.key,
        endpoint: config.endpoint,
        method: config.method,
        indicator,
        adapt_body: config.adapt_body,
        fetch_fn: config.fetch_fn,
    })
}
