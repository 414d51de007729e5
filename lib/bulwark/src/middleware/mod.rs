//! Tower middleware layers forming the resilience pipeline.
//!
//! This module provides composable layers applied via Tower's `Layer`
//! trait. Layers are applied in reverse order - the last layer added is the
//! first to process requests. [`crate::ClientBuilder`] wires them in the
//! canonical order:
//!
//! 1. [`InterceptLayer`] - user-supplied interceptors, outermost
//! 2. [`CacheLayer`] - serves snapshots before anything else runs
//! 3. [`DedupLayer`] - coalesces identical in-flight requests
//! 4. [`RetryLayer`] - re-dispatches with backoff
//! 5. [`CircuitBreakerLayer`] - per-origin failure accounting, so every
//!    attempt the retry layer makes is counted
//! 6. [`TimeoutLayer`] - bounds the whole exchange, innermost
//!
//! Each layer also works standalone around any service that speaks
//! `Request<Bytes> -> Result<Response<Bytes>, Error>`.

mod cache;
mod circuit_breaker;
mod dedup;
mod intercept;
mod retry;
mod timeout;

pub use cache::{CacheConfig, CacheLayer, Cached};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer, CircuitState,
};
pub use dedup::{Dedup, DedupConfig, DedupLayer};
pub use intercept::{Intercept, InterceptFn, InterceptLayer, Next};
pub use retry::{Backoff, Retry, RetryCause, RetryConfig, RetryLayer};
pub use timeout::{Timeout, TimeoutLayer};

// Re-export tower types for convenience
pub use tower::{Layer, ServiceBuilder};
