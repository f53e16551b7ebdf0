//! Sealed query bridge: connects a request/cache layer to sealed projections.
//!
//! The cache stores envelopes, never unsealed payloads. Every read re-verifies
//! the stored envelope and derives the caller's view through
//! [`membrane_core::Sealed::apply_morphism`], so a corrupted entry surfaces as
//! an error state instead of data. Refetching supersedes the entry with a new
//! envelope; an entry is never updated in place.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use membrane_core::SealedProjection;
use membrane_types::{DomainKey, Projection};

use crate::error::Stage;
use crate::guard::Guard;
use crate::pipeline::{Pipeline, PipelineResult};
use crate::retry::RetryPolicy;

/// Cache address. Domain-scoped queries use the domain's wire name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(String);

impl QueryKey {
    #[must_use]
    pub fn domain(key: DomainKey) -> Self {
        Self(key.as_str().to_string())
    }

    #[must_use]
    pub fn scoped(key: DomainKey, scope: &str) -> Self {
        Self(format!("{}:{scope}", key.as_str()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct QueryError {
    pub message: String,
    pub stage: Option<Stage>,
    pub retry_after: Option<Duration>,
}

impl QueryError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stage: None,
            retry_after: None,
        }
    }
}

fn into_query_result(result: PipelineResult) -> Result<SealedProjection, QueryError> {
    match result {
        PipelineResult::Success { sealed, .. } => Ok(sealed),
        PipelineResult::Failure {
            reason,
            stage,
            retry_after,
            ..
        } => Err(QueryError {
            message: reason,
            stage: Some(stage),
            retry_after,
        }),
    }
}

pub type QueryFut = Pin<Box<dyn Future<Output = Result<SealedProjection, QueryError>> + Send>>;
pub type QueryFn = Arc<dyn Fn() -> QueryFut + Send + Sync>;
pub type Select<T> = Arc<dyn Fn(&Projection) -> T + Send + Sync>;

#[derive(Debug, Default)]
struct Slot {
    sealed: Option<SealedProjection>,
    updated_at: Option<Instant>,
    error: Option<QueryError>,
    /// Refetches currently in flight for this key.
    fetching: usize,
}

/// Shared store of sealed envelopes keyed by [`QueryKey`].
#[derive(Debug, Default)]
pub struct QueryCache {
    slots: Mutex<HashMap<QueryKey, Slot>>,
}

impl QueryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<QueryKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The stored envelope, unverified.
    #[must_use]
    pub fn get(&self, key: &QueryKey) -> Option<SealedProjection> {
        self.slots().get(key).and_then(|slot| slot.sealed.clone())
    }

    /// Supersede the entry for `key` with a freshly sealed envelope.
    pub fn insert(&self, key: QueryKey, sealed: SealedProjection) {
        let mut slots = self.slots();
        let slot = slots.entry(key).or_default();
        slot.sealed = Some(sealed);
        slot.updated_at = Some(Instant::now());
        slot.error = None;
    }

    pub fn invalidate(&self, key: &QueryKey) {
        if let Some(slot) = self.slots().get_mut(key) {
            slot.updated_at = None;
        }
    }

    pub fn remove(&self, key: &QueryKey) -> Option<SealedProjection> {
        self.slots().remove(key).and_then(|slot| slot.sealed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots().values().filter(|slot| slot.sealed.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark a refetch in flight until the returned guard drops, including when
    /// the refetch future is cancelled or the query function panics.
    fn begin_fetch<'a>(&'a self, key: &'a QueryKey) -> InFlight<'a> {
        self.slots().entry(key.clone()).or_default().fetching += 1;
        InFlight { cache: self, key }
    }

    fn end_fetch(&self, key: &QueryKey) {
        if let Some(slot) = self.slots().get_mut(key) {
            slot.fetching = slot.fetching.saturating_sub(1);
        }
    }

    fn finish_fetch(&self, key: &QueryKey, outcome: Result<SealedProjection, QueryError>) {
        let mut slots = self.slots();
        let slot = slots.entry(key.clone()).or_default();
        match outcome {
            Ok(sealed) => {
                slot.sealed = Some(sealed);
                slot.updated_at = Some(Instant::now());
                slot.error = None;
            }
            Err(error) => slot.error = Some(error),
        }
    }

    fn is_stale(&self, key: &QueryKey, stale_time: Duration) -> bool {
        self.slots()
            .get(key)
            .and_then(|slot| slot.updated_at)
            .is_none_or(|at| at.elapsed() >= stale_time)
    }

    fn snapshot(&self, key: &QueryKey) -> (Option<SealedProjection>, Option<QueryError>, bool) {
        self.slots().get(key).map_or((None, None, false), |slot| {
            (slot.sealed.clone(), slot.error.clone(), slot.fetching > 0)
        })
    }
}

struct InFlight<'a> {
    cache: &'a QueryCache,
    key: &'a QueryKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.cache.end_fetch(self.key);
    }
}

/// What a consumer sees for one query.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub sealed: Option<SealedProjection>,
    pub integrity_ok: bool,
    pub is_loading: bool,
    pub is_fetching: bool,
    pub is_error: bool,
    pub error: Option<String>,
}

/// Handle built from a `{query_key, query_fn, select}` triplet.
pub struct SealedQuery<T> {
    key: QueryKey,
    query_fn: QueryFn,
    select: Select<T>,
    stale_time: Duration,
    cache: Arc<QueryCache>,
}

impl<T> SealedQuery<T> {
    pub fn new(
        cache: Arc<QueryCache>,
        key: QueryKey,
        query_fn: QueryFn,
        select: Select<T>,
        stale_time: Duration,
    ) -> Self {
        Self {
            key,
            query_fn,
            select,
            stale_time,
            cache,
        }
    }

    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current state. The cached envelope is verified on every call.
    #[must_use]
    pub fn state(&self) -> QueryState<T> {
        let (sealed, fetch_error, fetching) = self.cache.snapshot(&self.key);
        let mut state = QueryState {
            data: None,
            integrity_ok: false,
            is_loading: fetching && sealed.is_none(),
            is_fetching: fetching,
            is_error: fetch_error.is_some(),
            error: fetch_error.map(|e| e.message),
            sealed: None,
        };
        if let Some(sealed) = sealed {
            match sealed.apply_morphism(|projection| (self.select)(projection)) {
                Ok(data) => {
                    state.data = Some(data);
                    state.integrity_ok = true;
                }
                Err(violation) => {
                    state.is_error = true;
                    state.error = Some(violation.to_string());
                }
            }
            state.sealed = Some(sealed);
        }
        state
    }

    /// Run the query now and supersede the cached envelope on success. A
    /// failed refetch keeps the previous envelope and records the error.
    pub async fn refetch(&self) -> QueryState<T> {
        let in_flight = self.cache.begin_fetch(&self.key);
        let outcome = (self.query_fn)().await;
        if let Err(error) = &outcome {
            tracing::debug!(query = %self.key, %error, "Query refetch failed");
        }
        self.cache.finish_fetch(&self.key, outcome);
        drop(in_flight);
        self.state()
    }

    /// Refetch when the entry is missing, older than the stale time, or no
    /// longer verifies; otherwise serve the cache.
    pub async fn fetch_if_stale(&self) -> QueryState<T> {
        let current = self.state();
        if current.integrity_ok && !self.cache.is_stale(&self.key, self.stale_time) {
            return current;
        }
        self.refetch().await
    }
}

impl<T> fmt::Debug for SealedQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedQuery")
            .field("key", &self.key)
            .field("stale_time", &self.stale_time)
            .finish_non_exhaustive()
    }
}

/// Builds pipeline-backed queries over a shared cache.
pub struct QueryBridge {
    pipeline: Arc<Pipeline>,
    cache: Arc<QueryCache>,
    guards: Arc<[Arc<dyn Guard>]>,
    retry: Option<RetryPolicy>,
    stale_time: Duration,
}

impl QueryBridge {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>, stale_time: Duration) -> Self {
        Self {
            pipeline,
            cache: Arc::new(QueryCache::new()),
            guards: Arc::from(Vec::new()),
            retry: None,
            stale_time,
        }
    }

    #[must_use]
    pub fn with_guards(mut self, guards: Vec<Arc<dyn Guard>>) -> Self {
        self.guards = Arc::from(guards);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// A query function that runs the pipeline for `key` with `params`.
    #[must_use]
    pub fn pipeline_query(&self, key: DomainKey, params: Value) -> QueryFn {
        let pipeline = Arc::clone(&self.pipeline);
        let guards = Arc::clone(&self.guards);
        let retry = self.retry.clone();
        Arc::new(move || -> QueryFut {
            let pipeline = Arc::clone(&pipeline);
            let guards = Arc::clone(&guards);
            let params = params.clone();
            let retry = retry.clone();
            Box::pin(async move {
                let result = match retry {
                    Some(policy) => {
                        pipeline
                            .execute_with_retry(key, &params, &guards, &policy)
                            .await
                    }
                    None => pipeline.execute(key, &params, &guards).await,
                };
                into_query_result(result)
            })
        })
    }

    /// A query for `key` that derives its data with `select`.
    pub fn query<T, F>(&self, key: DomainKey, params: Value, select: F) -> SealedQuery<T>
    where
        F: Fn(&Projection) -> T + Send + Sync + 'static,
    {
        SealedQuery::new(
            Arc::clone(&self.cache),
            QueryKey::domain(key),
            self.pipeline_query(key, params),
            Arc::new(select),
            self.stale_time,
        )
    }
}

impl fmt::Debug for QueryBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBridge")
            .field("pipeline", &self.pipeline)
            .field("guards", &self.guards.len())
            .field("retry", &self.retry)
            .field("stale_time", &self.stale_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{StrategyConfig, create_strategy, fetch_fn};
    use membrane_core::{Membrane, RawEnvelope};
    use membrane_types::{BloodPressure, Epoch, Mmhg};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bridge(calls: Arc<AtomicUsize>) -> QueryBridge {
        let mut pipeline = Pipeline::new(Membrane::standard());
        pipeline.register_strategy(create_strategy(StrategyConfig::new(
            DomainKey::BloodPressure,
            "/v1/bp",
            fetch_fn(move |_intent| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(RawEnvelope::ok(json!({"s": 120 + n, "d": 80, "p": 65, "t": 1})))
                }
            }),
        )));
        QueryBridge::new(Arc::new(pipeline), Duration::from_secs(30))
    }

    fn systolic(projection: &Projection) -> Option<Mmhg> {
        projection.as_domain::<BloodPressure>().map(|bp| bp.systolic)
    }

    #[tokio::test]
    async fn test_state_before_first_fetch_is_empty() {
        let bridge = bridge(Arc::new(AtomicUsize::new(0)));
        let query = bridge.query(DomainKey::BloodPressure, Value::Null, systolic);
        let state = query.state();
        assert!(state.data.is_none());
        assert!(!state.integrity_ok);
        assert!(!state.is_error);
    }

    #[tokio::test]
    async fn test_refetch_seals_and_selects() {
        let bridge = bridge(Arc::new(AtomicUsize::new(0)));
        let query = bridge.query(DomainKey::BloodPressure, Value::Null, systolic);
        let state = query.refetch().await;
        assert!(state.integrity_ok);
        assert_eq!(state.data, Some(Some(Mmhg::new(120.0))));
        assert!(!state.is_fetching);
        assert!(state.sealed.unwrap().verify());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_if_stale_serves_fresh_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bridge = bridge(Arc::clone(&calls));
        let query = bridge.query(DomainKey::BloodPressure, Value::Null, systolic);

        query.fetch_if_stale().await;
        query.fetch_if_stale().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let state = query.fetch_if_stale().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(state.data, Some(Some(Mmhg::new(121.0))));
    }

    #[tokio::test]
    async fn test_refetch_supersedes_envelope() {
        let bridge = bridge(Arc::new(AtomicUsize::new(0)));
        let query = bridge.query(DomainKey::BloodPressure, Value::Null, systolic);
        let first = query.refetch().await.sealed.unwrap();
        let second = query.refetch().await.sealed.unwrap();
        assert!(first.verify());
        assert!(second.verify());
        assert_ne!(first.unseal().unwrap(), second.unseal().unwrap());
    }

    #[tokio::test]
    async fn test_tampered_cache_entry_is_an_error_state() {
        let bridge = bridge(Arc::new(AtomicUsize::new(0)));
        let query = bridge.query(DomainKey::BloodPressure, Value::Null, systolic);
        let sealed = query.refetch().await.sealed.unwrap();

        let mut json = serde_json::to_value(&sealed).unwrap();
        json["epoch"] = json!(sealed.epoch().value() + 1);
        let tampered: SealedProjection = serde_json::from_value(json).unwrap();
        bridge.cache().insert(query.key().clone(), tampered);

        let state = query.state();
        assert!(!state.integrity_ok);
        assert!(state.is_error);
        assert!(state.data.is_none());
        assert!(state.error.unwrap().contains(&(sealed.epoch().value() + 1).to_string()));

        let recovered = query.fetch_if_stale().await;
        assert!(recovered.integrity_ok);
        assert_ne!(recovered.sealed.unwrap().epoch(), Epoch::new(sealed.epoch().value() + 1));
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_previous_envelope() {
        let cache = Arc::new(QueryCache::new());
        let healthy = bridge(Arc::new(AtomicUsize::new(0)));
        let good = healthy
            .query(DomainKey::BloodPressure, Value::Null, systolic)
            .refetch()
            .await
            .sealed
            .unwrap();
        cache.insert(QueryKey::domain(DomainKey::BloodPressure), good);

        let failing: QueryFn =
            Arc::new(|| -> QueryFut { Box::pin(async { Err(QueryError::new("offline")) }) });
        let query = SealedQuery::<Option<Mmhg>>::new(
            Arc::clone(&cache),
            QueryKey::domain(DomainKey::BloodPressure),
            failing,
            Arc::new(systolic),
            Duration::from_secs(30),
        );
        let state = query.refetch().await;
        assert!(state.is_error);
        assert_eq!(state.error.as_deref(), Some("offline"));
        assert!(state.integrity_ok);
        assert_eq!(state.data, Some(Some(Mmhg::new(120.0))));
    }

    fn key_of() -> Select<DomainKey> {
        Arc::new(Projection::key)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_refetch_clears_fetching() {
        let cache = Arc::new(QueryCache::new());
        let hanging: QueryFn = Arc::new(|| -> QueryFut {
            Box::pin(std::future::pending::<Result<SealedProjection, QueryError>>())
        });
        let query = SealedQuery::new(
            Arc::clone(&cache),
            QueryKey::domain(DomainKey::Glucose),
            hanging,
            key_of(),
            Duration::from_secs(30),
        );

        let mut refetch = Box::pin(query.refetch());
        tokio::select! {
            _ = &mut refetch => panic!("hanging query completed"),
            () = tokio::time::sleep(Duration::from_millis(10)) => {
                assert!(query.state().is_fetching);
                assert!(query.state().is_loading);
            }
        }
        drop(refetch);

        let state = query.state();
        assert!(!state.is_fetching);
        assert!(!state.is_loading);
        assert!(!state.is_error);
    }

    #[tokio::test]
    async fn test_panicking_query_clears_fetching() {
        use futures_util::FutureExt;

        let cache = Arc::new(QueryCache::new());
        fn explode() -> Result<SealedProjection, QueryError> {
            panic!("query exploded")
        }

        let exploding: QueryFn = Arc::new(|| -> QueryFut { Box::pin(async { explode() }) });
        let query = SealedQuery::new(
            cache,
            QueryKey::domain(DomainKey::Sleep),
            exploding,
            key_of(),
            Duration::from_secs(30),
        );

        let outcome = std::panic::AssertUnwindSafe(query.refetch()).catch_unwind().await;
        assert!(outcome.is_err());
        assert!(!query.state().is_fetching);
    }
}
