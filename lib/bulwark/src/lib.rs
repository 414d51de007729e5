//! Resilience and transport-control pipeline for HTTP clients.
//!
//! Wraps any [`Transport`] in a composable chain of Tower layers: request
//! interceptors, a TTL response cache, in-flight request coalescing, retry
//! with backoff, per-origin circuit breaking, and total-exchange timeouts,
//! with per-origin connection pools bounding concurrent dispatch.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bulwark::prelude::*;
//! use bulwark::MemoryStorage;
//!
//! let client = Client::builder(transport)
//!     .with_cache(Arc::new(MemoryStorage::new()), CacheConfig::default())
//!     .with_dedup(DedupConfig::default())
//!     .with_retry(RetryConfig::default())
//!     .with_circuit_breaker(CircuitBreakerConfig::default())
//!     .build();
//!
//! let request = Request::builder(Method::Get, "https://api.example.com/users".parse()?)
//!     .header("Accept", "application/json")
//!     .build();
//! let users: Vec<User> = client.execute(request).await?.json()?;
//! ```

mod client;
mod config;
mod hooks;
pub mod middleware;
mod pool;
pub mod prelude;
mod storage;

// Re-export client types
pub use client::{BoxedService, Client, ClientBuilder, ServiceFuture};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use hooks::{AfterResponseHook, BeforeRequestHook, Hooks, OnErrorHook};
pub use pool::{PoolConfig, PoolHandle, PoolManager, PoolMode, PoolStats};
pub use storage::{CacheRecord, CacheStorage, FileStorage, MemoryStorage, spawn_sweeper};

// Re-export the middleware configs at the crate root
pub use middleware::{
    Backoff, CacheConfig, CircuitBreakerConfig, CircuitState, DedupConfig, Next, RetryCause,
    RetryConfig,
};

// Re-export tower for middleware composition
pub use tower;

// Re-export core types
pub use bulwark_core::{
    Error, Method, Origin, Overrides, Request, RequestBuilder, Response, Result, TimeoutPhase,
    Transport, from_json, to_json,
};

// Re-export http types for status codes and headers
pub use bulwark_core::{StatusCode, header};
