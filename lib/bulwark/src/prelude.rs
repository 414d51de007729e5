//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used types and functions for
//! easy glob importing:
//!
//! ```ignore
//! use bulwark::prelude::*;
//! ```

pub use crate::{
    Backoff, CacheConfig, CircuitBreakerConfig, CircuitState, Client, ClientConfig, DedupConfig,
    Error, Method, Next, Origin, PoolConfig, Request, RequestBuilder, Response, Result,
    RetryConfig, StatusCode, TimeoutPhase, Transport, from_json, header, to_json,
};
pub use serde::{Deserialize, Serialize};
