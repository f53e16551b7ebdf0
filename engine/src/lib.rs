//! Execution pipeline for Membrane.
//!
//! A caller asks for one domain's data; the pipeline resolves an intent through
//! the domain's [`Strategy`], runs the caller's [`Guard`]s, fetches a raw
//! envelope and hands it to the membrane for adapt+seal. The [`query`] module
//! bridges the resulting sealed envelopes into a request/cache layer.

mod error;
mod guard;
mod pipeline;
pub mod query;
mod retry;
mod strategy;

pub use error::{FetchFailure, GateFailure, PipelineError, ResolveError, Stage};
pub use guard::{GateVerdict, Guard, GuardError, GuardFut, guard_fn};
pub use pipeline::{Pipeline, PipelineResult};
pub use query::{QueryBridge, QueryCache, QueryError, QueryKey, QueryState, SealedQuery};
pub use retry::{RetryPolicy, is_retryable_status, parse_retry_after};
pub use strategy::{
    FetchFn, FetchFut, ResolvedIntent, Strategy, StrategyConfig, create_strategy, fetch_fn,
};
