//! Staged executor: `resolve -> gate -> fetch -> seal`.
//!
//! Each stage consumes the marker produced by the one before it, so a stage can
//! be neither skipped nor reordered. Every failure path ends in a
//! [`PipelineResult::Failure`]; the public entry points never return `Err` and
//! never panic on strategy or guard misbehavior.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::join_all;
use serde_json::Value;

use membrane_core::{Membrane, RawEnvelope, SealedProjection};
use membrane_types::{DomainKey, IntentToken, UnregisteredDomain};

use crate::error::{PipelineError, Stage};
use crate::guard::{Guard, panic_message, run_guards};
use crate::retry::RetryPolicy;
use crate::strategy::{ResolvedIntent, Strategy};

#[derive(Debug)]
pub enum PipelineResult {
    Success {
        sealed: SealedProjection,
        token: IntentToken,
        elapsed: Duration,
    },
    Failure {
        reason: String,
        stage: Stage,
        /// Absent when execution stopped before an intent existed.
        token: Option<IntentToken>,
        retry_after: Option<Duration>,
        error: PipelineError,
    },
}

impl PipelineResult {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    #[must_use]
    pub fn sealed(&self) -> Option<&SealedProjection> {
        match self {
            Self::Success { sealed, .. } => Some(sealed),
            Self::Failure { .. } => None,
        }
    }

    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { stage, .. } => Some(*stage),
        }
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { retry_after, .. } => *retry_after,
        }
    }

    fn failure(stage: Stage, token: Option<IntentToken>, error: PipelineError) -> Self {
        Self::Failure {
            reason: error.to_string(),
            stage,
            token,
            retry_after: error.retry_after(),
            error,
        }
    }
}

struct Resolved {
    intent: ResolvedIntent,
}

struct Cleared {
    intent: ResolvedIntent,
}

struct Fetched {
    intent: ResolvedIntent,
    raw: RawEnvelope,
}

struct Sealed {
    token: IntentToken,
    sealed: SealedProjection,
}

fn panicked(stage: Stage, token: Option<IntentToken>, payload: &(dyn Any + Send)) -> PipelineResult {
    let message = panic_message(payload);
    tracing::warn!(%stage, %message, "Strategy panicked");
    PipelineResult::failure(stage, token, PipelineError::Panicked { stage, message })
}

/// One execution against one strategy.
struct Run<'p> {
    membrane: &'p Membrane,
    strategy: &'p dyn Strategy,
}

impl Run<'_> {
    fn resolve(&self, params: &Value) -> Result<Resolved, PipelineResult> {
        match catch_unwind(AssertUnwindSafe(|| self.strategy.resolve(params))) {
            Ok(Ok(intent)) => Ok(Resolved { intent }),
            Ok(Err(error)) => Err(PipelineResult::failure(Stage::Resolve, None, error.into())),
            Err(payload) => Err(panicked(Stage::Resolve, None, payload.as_ref())),
        }
    }

    async fn gate(&self, resolved: Resolved, guards: &[Arc<dyn Guard>]) -> Result<Cleared, PipelineResult> {
        let Resolved { intent } = resolved;
        match run_guards(guards).await {
            Ok(_) => Ok(Cleared { intent }),
            Err(failure) => Err(PipelineResult::failure(
                Stage::Gate,
                Some(intent.token),
                failure.into(),
            )),
        }
    }

    async fn fetch(&self, cleared: Cleared) -> Result<Fetched, PipelineResult> {
        let Cleared { intent } = cleared;
        let fetched = match catch_unwind(AssertUnwindSafe(|| self.strategy.fetch(&intent))) {
            Ok(fetch) => AssertUnwindSafe(fetch).catch_unwind().await,
            Err(payload) => Err(payload),
        };
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(payload) => {
                return Err(panicked(Stage::Fetch, Some(intent.token), payload.as_ref()));
            }
        };
        match fetched {
            Ok(raw) => Ok(Fetched { intent, raw }),
            Err(failure) => {
                tracing::warn!(
                    domain = %intent.key,
                    endpoint = %intent.endpoint,
                    error = %failure,
                    "Fetch failed"
                );
                Err(PipelineResult::failure(
                    Stage::Fetch,
                    Some(intent.token),
                    failure.into(),
                ))
            }
        }
    }

    fn seal(&self, fetched: Fetched) -> Result<Sealed, PipelineResult> {
        let Fetched { intent, raw } = fetched;
        let token = intent.token;
        let adapted = match catch_unwind(AssertUnwindSafe(|| self.strategy.adapt(&raw))) {
            Ok(adapted) => adapted,
            Err(payload) => return Err(panicked(Stage::Seal, Some(token), payload.as_ref())),
        };
        let sealed = adapted
            .map_err(membrane_core::MembraneError::from)
            .and_then(|projection| self.membrane.seal_direct(intent.key, projection));
        match sealed {
            Ok(sealed) => Ok(Sealed { token, sealed }),
            Err(error) => Err(PipelineResult::failure(Stage::Seal, Some(token), error.into())),
        }
    }
}

/// Strategy registry plus the membrane that seals every fetched envelope.
pub struct Pipeline {
    membrane: Membrane,
    strategies: HashMap<DomainKey, Arc<dyn Strategy>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(membrane: Membrane) -> Self {
        Self {
            membrane,
            strategies: HashMap::new(),
        }
    }

    #[must_use]
    pub fn membrane(&self) -> &Membrane {
        &self.membrane
    }

    /// Install a strategy for its key. An existing registration is replaced
    /// (last write wins) with a warning.
    pub fn register_strategy(&mut self, strategy: Arc<dyn Strategy>) {
        let key = strategy.key();
        if self.strategies.insert(key, strategy).is_some() {
            tracing::warn!(domain = %key, "Strategy re-registered; replacing previous registration");
        }
    }

    pub fn register_strategies<I>(&mut self, strategies: I)
    where
        I: IntoIterator<Item = Arc<dyn Strategy>>,
    {
        for strategy in strategies {
            self.register_strategy(strategy);
        }
    }

    /// Startup check: every domain key has a strategy.
    pub fn assert_complete(&self) -> Result<(), UnregisteredDomain> {
        let missing = DomainKey::missing_from(self.strategies.keys().copied());
        if missing.is_empty() {
            Ok(())
        } else {
            Err(UnregisteredDomain::missing(&missing))
        }
    }

    #[must_use]
    pub fn registered(&self) -> Vec<DomainKey> {
        let mut keys: Vec<DomainKey> = self.strategies.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Run one execution. Never fails; inspect the returned result.
    pub async fn execute(
        &self,
        key: DomainKey,
        params: &Value,
        guards: &[Arc<dyn Guard>],
    ) -> PipelineResult {
        let started = Instant::now();
        let Some(strategy) = self.strategies.get(&key) else {
            return PipelineResult::failure(
                Stage::Resolve,
                None,
                UnregisteredDomain::named(key.as_str()).into(),
            );
        };
        let run = Run {
            membrane: &self.membrane,
            strategy: strategy.as_ref(),
        };
        match Self::stages(&run, params, guards).await {
            Ok(Sealed { token, sealed }) => PipelineResult::Success {
                sealed,
                token,
                elapsed: started.elapsed(),
            },
            Err(failure) => failure,
        }
    }

    async fn stages(
        run: &Run<'_>,
        params: &Value,
        guards: &[Arc<dyn Guard>],
    ) -> Result<Sealed, PipelineResult> {
        let resolved = run.resolve(params)?;
        let cleared = run.gate(resolved, guards).await?;
        let fetched = run.fetch(cleared).await?;
        run.seal(fetched)
    }

    /// [`Self::execute`] addressed by wire name; unknown names fail at `resolve`.
    pub async fn execute_named(
        &self,
        name: &str,
        params: &Value,
        guards: &[Arc<dyn Guard>],
    ) -> PipelineResult {
        match name.parse::<DomainKey>() {
            Ok(key) => self.execute(key, params, guards).await,
            Err(error) => PipelineResult::failure(Stage::Resolve, None, error.into()),
        }
    }

    /// Repeat [`Self::execute`] until success, a non-retryable failure, or
    /// `policy.max_retries` retries have been spent.
    pub async fn execute_with_retry(
        &self,
        key: DomainKey,
        params: &Value,
        guards: &[Arc<dyn Guard>],
        policy: &RetryPolicy,
    ) -> PipelineResult {
        let mut attempt = 0;
        loop {
            let result = self.execute(key, params, guards).await;
            let Some(retry_after) = result.retry_after() else {
                return result;
            };
            if attempt >= policy.max_retries {
                tracing::debug!(domain = %key, attempts = attempt + 1, "Retries exhausted");
                return result;
            }
            let delay = policy.delay_for(attempt, retry_after);
            tracing::debug!(
                domain = %key,
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                "Retrying pipeline after transient failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run every entry concurrently. Results follow input order regardless of
    /// completion order.
    pub async fn execute_batch(
        &self,
        entries: &[(DomainKey, Value)],
        guards: &[Arc<dyn Guard>],
    ) -> Vec<PipelineResult> {
        join_all(
            entries
                .iter()
                .map(|(key, params)| self.execute(*key, params, guards)),
        )
        .await
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Membrane::standard())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("membrane", &self.membrane)
            .field("strategies", &self.registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchFailure;
    use crate::guard::{GateVerdict, guard_fn};
    use crate::strategy::{StrategyConfig, create_strategy, fetch_fn};
    use membrane_types::{BloodPressure, Mmhg};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bp_body() -> Value {
        json!({"s": 120, "d": 80, "p": 65, "t": 1_700_000_000_000_i64})
    }

    fn static_strategy(key: DomainKey, body: Value) -> Arc<dyn Strategy> {
        create_strategy(StrategyConfig::new(
            key,
            format!("/v1/{key}"),
            fetch_fn(move |_intent| {
                let body = body.clone();
                async move { Ok(RawEnvelope::ok(body)) }
            }),
        ))
    }

    fn counting_strategy(key: DomainKey, calls: Arc<AtomicUsize>, failure: FetchFailure) -> Arc<dyn Strategy> {
        create_strategy(StrategyConfig::new(
            key,
            "/v1/flaky",
            fetch_fn(move |_intent| {
                calls.fetch_add(1, Ordering::SeqCst);
                let failure = failure.clone();
                async move { Err(failure) }
            }),
        ))
    }

    #[tokio::test]
    async fn test_execute_success() {
        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(static_strategy(DomainKey::BloodPressure, bp_body()));

        let result = pipeline
            .execute(DomainKey::BloodPressure, &Value::Null, &[])
            .await;
        let sealed = result.sealed().unwrap();
        let bp = sealed.unseal().unwrap().as_domain::<BloodPressure>().cloned().unwrap();
        assert_eq!(bp.systolic, Mmhg::new(120.0));
    }

    #[tokio::test]
    async fn test_unknown_name_reports_unregistered_at_resolve() {
        let pipeline = Pipeline::default();
        let result = pipeline.execute_named("unknown_key", &json!({}), &[]).await;
        let PipelineResult::Failure { stage, error, token, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(stage, Stage::Resolve);
        assert!(token.is_none());
        assert!(matches!(error, PipelineError::Unregistered(_)));
    }

    #[tokio::test]
    async fn test_known_key_without_strategy_is_unregistered() {
        let pipeline = Pipeline::default();
        let result = pipeline.execute(DomainKey::Sleep, &json!({}), &[]).await;
        assert_eq!(result.stage(), Some(Stage::Resolve));
        let PipelineResult::Failure { reason, .. } = result else {
            panic!("expected failure");
        };
        assert!(reason.contains("sleep"));
    }

    #[tokio::test]
    async fn test_gate_failure_carries_guard_reason() {
        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(static_strategy(DomainKey::BloodPressure, bp_body()));
        let guards = vec![guard_fn("consent", 1, || async {
            Ok(GateVerdict::reject("consent missing"))
        })];
        let result = pipeline
            .execute(DomainKey::BloodPressure, &Value::Null, &guards)
            .await;
        let PipelineResult::Failure { stage, reason, token, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(stage, Stage::Gate);
        assert!(reason.contains("consent missing"));
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn test_malformed_body_fails_at_seal() {
        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(static_strategy(DomainKey::BloodPressure, json!({"s": 120})));
        let result = pipeline
            .execute(DomainKey::BloodPressure, &Value::Null, &[])
            .await;
        assert_eq!(result.stage(), Some(Stage::Seal));
        assert_eq!(result.retry_after(), None);
    }

    #[tokio::test]
    async fn test_panicking_fetch_becomes_fetch_failure() {
        fn explode() -> Result<RawEnvelope, FetchFailure> {
            panic!("upstream client blew up")
        }

        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(create_strategy(StrategyConfig::new(
            DomainKey::HeartRate,
            "/v1/hr",
            fetch_fn(|_intent| async { explode() }),
        )));
        let result = pipeline.execute(DomainKey::HeartRate, &Value::Null, &[]).await;
        let PipelineResult::Failure { stage, error, token, retry_after, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(stage, Stage::Fetch);
        assert!(token.is_some());
        assert_eq!(retry_after, None);
        let PipelineError::Panicked { message, .. } = error else {
            panic!("expected panic failure, got {error:?}");
        };
        assert_eq!(message, "upstream client blew up");

        // The pipeline stays usable afterwards.
        pipeline.register_strategy(static_strategy(DomainKey::HeartRate, json!({"r": 50, "a": 60, "m": 90, "t": 1})));
        assert!(pipeline.execute(DomainKey::HeartRate, &Value::Null, &[]).await.is_success());
    }

    #[tokio::test]
    async fn test_panicking_resolve_and_adapter_are_contained() {
        struct Exploding;

        impl Strategy for Exploding {
            fn key(&self) -> DomainKey {
                DomainKey::Sleep
            }

            fn resolve(&self, _params: &Value) -> Result<ResolvedIntent, crate::error::ResolveError> {
                panic!("resolve exploded")
            }

            fn fetch<'a>(&'a self, _intent: &'a ResolvedIntent) -> crate::strategy::FetchFut<'a> {
                Box::pin(async { Ok(RawEnvelope::ok(Value::Null)) })
            }
        }

        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(Arc::new(Exploding));
        let result = pipeline.execute(DomainKey::Sleep, &Value::Null, &[]).await;
        assert_eq!(result.stage(), Some(Stage::Resolve));
        assert!(matches!(
            result,
            PipelineResult::Failure { error: PipelineError::Panicked { stage: Stage::Resolve, .. }, token: None, .. }
        ));

        let mut config = StrategyConfig::new(
            DomainKey::Weight,
            "/v1/weight",
            fetch_fn(|_intent| async { Ok(RawEnvelope::ok(json!({}))) }),
        );
        config.adapt_body = Some(Arc::new(
            |_body: &Value| -> Result<membrane_types::Projection, membrane_core::AdaptError> {
                panic!("adapter exploded")
            },
        ));
        pipeline.register_strategy(create_strategy(config));
        let result = pipeline.execute(DomainKey::Weight, &Value::Null, &[]).await;
        assert_eq!(result.stage(), Some(Stage::Seal));
    }

    #[tokio::test]
    async fn test_oversized_retry_hint_does_not_panic() {
        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(create_strategy(StrategyConfig::new(
            DomainKey::Glucose,
            "/v1/glucose",
            fetch_fn(|_intent| async {
                Ok(RawEnvelope::new(429, Value::Null).with_header("retry-after-ms", "1e30"))
            }),
        )));
        let result = pipeline.execute(DomainKey::Glucose, &Value::Null, &[]).await;
        assert_eq!(result.stage(), Some(Stage::Fetch));
        // Unusable hint: still transient, falls back to backoff.
        assert_eq!(result.retry_after(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_reregistration_last_write_wins() {
        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(static_strategy(DomainKey::Weight, json!({"kg": 70, "t": 1})));
        pipeline.register_strategy(static_strategy(DomainKey::Weight, json!({"kg": 71, "t": 1})));
        let result = pipeline.execute(DomainKey::Weight, &Value::Null, &[]).await;
        let mass = result
            .sealed()
            .unwrap()
            .apply_morphism(|p| p.as_domain::<membrane_types::Weight>().map(|w| w.mass.value()))
            .unwrap();
        assert_eq!(mass, Some(71.0));
    }

    #[tokio::test]
    async fn test_assert_complete_lists_missing_keys() {
        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(static_strategy(DomainKey::BloodPressure, bp_body()));
        let err = pipeline.assert_complete().unwrap_err();
        assert!(!err.names().contains(&"bp".to_string()));
        assert!(err.names().contains(&"hr".to_string()));

        pipeline.register_strategies(
            DomainKey::ALL
                .into_iter()
                .map(|key| static_strategy(key, json!({}))),
        );
        assert!(pipeline.assert_complete().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_non_retryable_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(counting_strategy(
            DomainKey::Glucose,
            Arc::clone(&calls),
            FetchFailure::fatal("bad request"),
        ));
        let result = pipeline
            .execute_with_retry(DomainKey::Glucose, &Value::Null, &[], &RetryPolicy::new(3, Duration::from_millis(10)))
            .await;
        assert_eq!(result.stage(), Some(Stage::Fetch));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget_on_transient_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(counting_strategy(
            DomainKey::Glucose,
            Arc::clone(&calls),
            FetchFailure::transient("unavailable", Duration::ZERO),
        ));
        let started = tokio::time::Instant::now();
        let result = pipeline
            .execute_with_retry(DomainKey::Glucose, &Value::Null, &[], &RetryPolicy::new(3, Duration::from_millis(100)))
            .await;
        assert!(!result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400 ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(create_strategy(StrategyConfig::new(
            DomainKey::BloodPressure,
            "/v1/bp",
            fetch_fn(move |_intent| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Ok(RawEnvelope::new(429, Value::Null).with_header("retry-after-ms", "50"))
                    } else {
                        Ok(RawEnvelope::ok(bp_body()))
                    }
                }
            }),
        )));
        let result = pipeline
            .execute_with_retry(DomainKey::BloodPressure, &Value::Null, &[], &RetryPolicy::default())
            .await;
        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_preserves_input_order() {
        fn delayed(key: DomainKey, delay_ms: u64, body: Value) -> Arc<dyn Strategy> {
            create_strategy(StrategyConfig::new(
                key,
                "/v1/delayed",
                fetch_fn(move |_intent| {
                    let body = body.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        Ok(RawEnvelope::ok(body))
                    }
                }),
            ))
        }

        let mut pipeline = Pipeline::default();
        pipeline.register_strategy(delayed(DomainKey::BloodPressure, 300, bp_body()));
        pipeline.register_strategy(delayed(DomainKey::Weight, 200, json!({"kg": 70, "t": 1})));
        pipeline.register_strategy(delayed(DomainKey::Glucose, 10, json!({"level": 90, "t": 1})));

        let results = pipeline
            .execute_batch(
                &[
                    (DomainKey::BloodPressure, Value::Null),
                    (DomainKey::Weight, Value::Null),
                    (DomainKey::Glucose, Value::Null),
                ],
                &[],
            )
            .await;
        let keys: Vec<DomainKey> = results
            .iter()
            .map(|r| r.sealed().unwrap().unseal().unwrap().key())
            .collect();
        assert_eq!(
            keys,
            vec![DomainKey::BloodPressure, DomainKey::Weight, DomainKey::Glucose]
        );
    }
}
