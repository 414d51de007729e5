//! Connection pool management.
//!
//! The pipeline never owns sockets, but it decides how many logical
//! connections a transport may hold per origin and how many requests
//! those connections carry. [`PoolManager`] hands out lazily-created
//! [`PoolHandle`]s, either one global handle or one per origin, each
//! carrying a semaphore sized to its request capacity. Handles live for
//! the lifetime of the client; there is no automatic teardown.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use bulwark_core::{Error, Origin, Result};

/// Key for the shared handle used in global mode and for origin-less URLs.
const GLOBAL_KEY: &str = "*";

/// Pooling granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    /// One pool shared by every origin.
    Global,
    /// An independent pool per origin, each with its own ceiling.
    #[default]
    PerOrigin,
}

/// Connection pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pooling granularity.
    pub mode: PoolMode,
    /// Desired maximum parallel requests through one pool.
    pub max_concurrent: usize,
    /// Requests pipelined per connection on a non-multiplexed transport.
    pub pipelining: usize,
    /// Upper bound on connections for a non-multiplexed transport.
    pub hard_cap: usize,
    /// Streams per connection for a multiplexed transport (e.g. HTTP/2).
    /// `None` means the transport is not multiplexed.
    pub streams_per_connection: Option<NonZeroUsize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::PerOrigin,
            max_concurrent: 64,
            pipelining: 1,
            hard_cap: 128,
            streams_per_connection: None,
        }
    }
}

impl PoolConfig {
    /// Connection ceiling derived from the configured concurrency.
    ///
    /// Non-multiplexed: `min(ceil(max / pipelining), hard_cap)`.
    /// Multiplexed: `max(1, ceil(max / streams_per_connection))`.
    #[must_use]
    pub fn connection_ceiling(&self) -> usize {
        if let Some(streams) = self.streams_per_connection {
            self.max_concurrent.div_ceil(streams.get()).max(1)
        } else {
            let pipelining = self.pipelining.max(1);
            self.max_concurrent
                .div_ceil(pipelining)
                .min(self.hard_cap)
                .max(1)
        }
    }

    /// Parallel requests one pool admits: the connection ceiling times the
    /// requests each connection carries, never more than `max_concurrent`.
    /// When the hard cap binds the ceiling, it throttles requests too.
    #[must_use]
    pub fn request_capacity(&self) -> usize {
        let per_connection = self
            .streams_per_connection
            .map_or(self.pipelining.max(1), NonZeroUsize::get);
        (self.connection_ceiling() * per_connection)
            .min(self.max_concurrent)
            .max(1)
    }
}

/// A per-origin (or global) connection allocation.
///
/// The semaphore holds one permit per in-flight request; the dispatch path
/// acquires a permit for each request and holds it across the exchange.
/// Capacity is derived from the connection ceiling and how many requests
/// each connection carries, so pipelined and multiplexed transports admit
/// the full configured concurrency.
#[derive(Debug)]
pub struct PoolHandle {
    key: String,
    connections: usize,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl PoolHandle {
    fn new(key: String, connections: usize, capacity: usize) -> Self {
        Self {
            key,
            connections,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Origin key this handle belongs to (`*` for the global pool).
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Connection ceiling for this pool.
    #[must_use]
    pub const fn connections(&self) -> usize {
        self.connections
    }

    /// Parallel requests this pool admits.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of request slots currently available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Admit one request, waiting if the pool is at capacity.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::connection("connection pool closed"))
    }
}

/// Snapshot of pool manager state for observability.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total pools currently allocated.
    pub pools: usize,
    /// Keys of the allocated pools.
    pub origins: Vec<String>,
}

/// Lazily allocates and retains connection pools.
#[derive(Debug)]
pub struct PoolManager {
    config: PoolConfig,
    pools: Mutex<HashMap<String, Arc<PoolHandle>>>,
}

impl PoolManager {
    /// Create a manager with the given sizing configuration.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Pool handle for the origin of `url`.
    ///
    /// In [`PoolMode::Global`] every URL maps to the same handle. URLs
    /// without a derivable origin share the global handle as well.
    #[must_use]
    pub fn pool_for_origin(&self, url: &Url) -> Arc<PoolHandle> {
        let key = match self.config.mode {
            PoolMode::Global => GLOBAL_KEY.to_string(),
            PoolMode::PerOrigin => Origin::of(url)
                .map_or_else(|| GLOBAL_KEY.to_string(), |origin| origin.to_string()),
        };

        let mut pools = self
            .pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(pools.entry(key.clone()).or_insert_with(|| {
            let ceiling = self.config.connection_ceiling();
            let capacity = self.config.request_capacity();
            tracing::debug!(
                origin = %key,
                connections = ceiling,
                capacity,
                "allocating connection pool"
            );
            Arc::new(PoolHandle::new(key, ceiling, capacity))
        }))
    }

    /// Snapshot of allocated pools.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let pools = self
            .pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        PoolStats {
            pools: pools.len(),
            origins: pools.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("valid url")
    }

    #[test]
    fn ceiling_non_multiplexed() {
        let config = PoolConfig {
            max_concurrent: 64,
            pipelining: 4,
            hard_cap: 128,
            ..PoolConfig::default()
        };
        assert_eq!(config.connection_ceiling(), 16);
    }

    #[test]
    fn ceiling_respects_hard_cap() {
        let config = PoolConfig {
            max_concurrent: 1000,
            pipelining: 1,
            hard_cap: 50,
            ..PoolConfig::default()
        };
        assert_eq!(config.connection_ceiling(), 50);
    }

    #[test]
    fn ceiling_multiplexed() {
        let config = PoolConfig {
            max_concurrent: 64,
            streams_per_connection: NonZeroUsize::new(100),
            ..PoolConfig::default()
        };
        // 64 concurrent streams fit on a single multiplexed connection.
        assert_eq!(config.connection_ceiling(), 1);

        let config = PoolConfig {
            max_concurrent: 250,
            streams_per_connection: NonZeroUsize::new(100),
            ..PoolConfig::default()
        };
        assert_eq!(config.connection_ceiling(), 3);
    }

    #[test]
    fn request_capacity_accounts_for_requests_per_connection() {
        let config = PoolConfig {
            max_concurrent: 64,
            pipelining: 4,
            hard_cap: 128,
            ..PoolConfig::default()
        };
        // 16 connections, each pipelining 4 requests.
        assert_eq!(config.connection_ceiling(), 16);
        assert_eq!(config.request_capacity(), 64);

        let config = PoolConfig {
            max_concurrent: 64,
            streams_per_connection: NonZeroUsize::new(100),
            ..PoolConfig::default()
        };
        assert_eq!(config.request_capacity(), 64);

        let config = PoolConfig {
            max_concurrent: 1000,
            pipelining: 1,
            hard_cap: 50,
            ..PoolConfig::default()
        };
        // The hard cap throttles requests too.
        assert_eq!(config.request_capacity(), 50);
    }

    #[test]
    fn ceiling_never_zero() {
        let config = PoolConfig {
            max_concurrent: 0,
            pipelining: 8,
            ..PoolConfig::default()
        };
        assert_eq!(config.connection_ceiling(), 1);
    }

    #[test]
    fn per_origin_pools_are_distinct_and_reused() {
        let manager = PoolManager::new(PoolConfig::default());

        let a1 = manager.pool_for_origin(&url("https://a.example.com/x"));
        let a2 = manager.pool_for_origin(&url("https://a.example.com/y"));
        let b = manager.pool_for_origin(&url("https://b.example.com/"));

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        let stats = manager.stats();
        assert_eq!(stats.pools, 2);
        assert!(stats.origins.contains(&"https://a.example.com:443".to_string()));
        assert!(stats.origins.contains(&"https://b.example.com:443".to_string()));
    }

    #[test]
    fn global_mode_shares_one_pool() {
        let manager = PoolManager::new(PoolConfig {
            mode: PoolMode::Global,
            ..PoolConfig::default()
        });

        let a = manager.pool_for_origin(&url("https://a.example.com/"));
        let b = manager.pool_for_origin(&url("https://b.example.com/"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.stats().pools, 1);
    }

    #[tokio::test]
    async fn acquire_bounds_requests() {
        let manager = PoolManager::new(PoolConfig {
            max_concurrent: 2,
            pipelining: 1,
            ..PoolConfig::default()
        });
        let pool = manager.pool_for_origin(&url("https://a.example.com/"));
        assert_eq!(pool.connections(), 2);
        assert_eq!(pool.capacity(), 2);

        let p1 = pool.acquire().await.expect("permit");
        let _p2 = pool.acquire().await.expect("permit");
        assert_eq!(pool.available(), 0);

        drop(p1);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn pipelined_pool_admits_requests_beyond_connections() {
        let manager = PoolManager::new(PoolConfig {
            max_concurrent: 4,
            pipelining: 2,
            ..PoolConfig::default()
        });
        let pool = manager.pool_for_origin(&url("https://a.example.com/"));
        assert_eq!(pool.connections(), 2);
        assert_eq!(pool.capacity(), 4);

        let _p1 = pool.acquire().await.expect("permit");
        let _p2 = pool.acquire().await.expect("permit");
        let _p3 = pool.acquire().await.expect("permit");
        let _p4 = pool.acquire().await.expect("permit");
        assert_eq!(pool.available(), 0);
    }
}
