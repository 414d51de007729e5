//! Pipeline client assembly.
//!
//! [`Client`] wraps a [`Transport`] in the resilience chain. The builder
//! wires configured layers in a fixed order (interceptors outermost, then
//! cache, dedup, retry, circuit breaker, timeout) so that retries pass
//! through failure accounting and cache hits skip everything below them.
//! The innermost service acquires a connection-pool permit before handing
//! the request to the transport.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tower::Layer;
use tower::util::BoxCloneService;
use tower_service::Service;

use crate::config::{ClientConfig, ClientConfigBuilder};
use crate::hooks::Hooks;
use crate::middleware::{
    CacheConfig, CacheLayer, CircuitBreakerConfig, CircuitBreakerLayer, DedupConfig, DedupLayer,
    InterceptLayer, Next, RetryConfig, RetryLayer, TimeoutLayer,
};
use crate::pool::{PoolManager, PoolStats};
use crate::storage::CacheStorage;
use bulwark_core::{Error, Request, Response, Result, Transport};

// ============================================================================
// Type-Erased Service for Middleware Composition
// ============================================================================

/// Type-erased service for middleware composition.
///
/// This type allows storing and composing arbitrary Tower layers without
/// exposing complex generic types to users.
pub type BoxedService = BoxCloneService<Request<Bytes>, Response<Bytes>, Error>;

/// Future type for Tower Service implementation.
pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response<Bytes>>> + Send + 'static>>;

/// Thread-safe wrapper for `BoxedService`.
///
/// This wrapper uses a Mutex to make the service Sync, which is required
/// by the [`Transport`] trait.
#[derive(Clone)]
struct SyncService {
    inner: Arc<Mutex<BoxedService>>,
}

impl SyncService {
    fn new(service: BoxedService) -> Self {
        Self {
            inner: Arc::new(Mutex::new(service)),
        }
    }

    fn call(&self, request: Request<Bytes>) -> ServiceFuture {
        // Lock, clone the service, and release the lock immediately
        let mut service = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        Box::pin(async move { service.call(request).await })
    }
}

// ============================================================================
// Transport Adapter (internal, innermost service)
// ============================================================================

/// Adapts a [`Transport`] into a Tower service, gated by the connection
/// pool: a permit for the request's origin is held across the dispatch.
struct TransportService<T> {
    transport: Arc<T>,
    pools: Arc<PoolManager>,
}

impl<T> Clone for TransportService<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            pools: Arc::clone(&self.pools),
        }
    }
}

impl<T> Service<Request<Bytes>> for TransportService<T>
where
    T: Transport + 'static,
{
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = ServiceFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let transport = Arc::clone(&self.transport);
        let pools = Arc::clone(&self.pools);

        Box::pin(async move {
            let pool = pools.pool_for_origin(request.url());
            let _permit = pool.acquire().await?;
            transport.dispatch(request).await
        })
    }
}

// ============================================================================
// Public Client
// ============================================================================

/// Resilience pipeline client around a [`Transport`].
///
/// # Example
///
/// ```ignore
/// use bulwark::{Client, RetryConfig, CircuitBreakerConfig};
///
/// let client = Client::builder(transport)
///     .with_retry(RetryConfig::default())
///     .with_circuit_breaker(CircuitBreakerConfig::default())
///     .build();
///
/// let response = client.execute(request).await?;
/// ```
#[derive(Clone)]
pub struct Client {
    service: SyncService,
    config: ClientConfig,
    hooks: Arc<Hooks>,
    pools: Arc<PoolManager>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client builder around a transport.
    #[must_use]
    pub fn builder<T: Transport + 'static>(transport: T) -> ClientBuilder<T> {
        ClientBuilder::new(transport)
    }

    /// Dispatch a request through the pipeline.
    ///
    /// Hooks observe the request before the chain runs and the outcome
    /// after it resolves, whether served by the transport or a layer.
    ///
    /// # Errors
    ///
    /// Returns whatever error the pipeline produced: transport failures,
    /// timeouts, open-circuit rejections, or cancellation.
    pub async fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        self.hooks.notify_before(&request);
        let result = self.service.call(request).await;
        match &result {
            Ok(response) => self.hooks.notify_after(response),
            Err(error) => self.hooks.notify_error(error),
        }
        result
    }

    /// Get the client configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Snapshot of the connection pools allocated so far.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pools.stats()
    }
}

/// A client is itself a transport, so pipelines can nest.
impl Transport for Client {
    async fn dispatch(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        self.execute(request).await
    }
}

impl Service<Request<Bytes>> for Client {
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = ServiceFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        // SyncService is always ready (the underlying service is polled when called)
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.execute(request).await })
    }
}

// ============================================================================
// Builder
// ============================================================================

type LayerFn = Arc<dyn Fn(BoxedService) -> BoxedService + Send + Sync>;

/// Builder for [`Client`].
///
/// Resilience layers configured through the `with_*` helpers are wired in
/// a fixed order regardless of call order; `layer()` and `intercept()`
/// additions wrap the whole chain, first added outermost.
pub struct ClientBuilder<T> {
    transport: T,
    config: ClientConfigBuilder,
    retry: Option<RetryConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    dedup: Option<DedupConfig>,
    cache: Option<(Arc<dyn CacheStorage>, CacheConfig)>,
    layers: Vec<LayerFn>,
    hooks: Hooks,
}

impl<T: std::fmt::Debug> std::fmt::Debug for ClientBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .field("layers_count", &self.layers.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> ClientBuilder<T> {
    fn new(transport: T) -> Self {
        Self {
            transport,
            config: ClientConfigBuilder::default(),
            retry: None,
            circuit_breaker: None,
            dedup: None,
            cache: None,
            layers: Vec::new(),
            hooks: Hooks::default(),
        }
    }

    // ========================================================================
    // Core Configuration
    // ========================================================================

    /// Set the default total request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.timeout(timeout);
        self
    }

    /// Set the connection-establishment timeout (advisory to the transport).
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.connect_timeout(timeout);
        self
    }

    /// Set the time-to-first-byte timeout (advisory to the transport).
    #[must_use]
    pub fn first_byte_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.first_byte_timeout(timeout);
        self
    }

    /// Set the connection pool configuration.
    #[must_use]
    pub fn pool(mut self, pool: crate::pool::PoolConfig) -> Self {
        self.config = self.config.pool(pool);
        self
    }

    // ========================================================================
    // Resilience Layers
    // ========================================================================

    /// Enable retry with backoff.
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Enable per-origin circuit breaking.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Enable coalescing of identical in-flight requests.
    #[must_use]
    pub fn with_dedup(mut self, config: DedupConfig) -> Self {
        self.dedup = Some(config);
        self
    }

    /// Enable response caching over a storage backend.
    #[must_use]
    pub fn with_cache(mut self, storage: Arc<dyn CacheStorage>, config: CacheConfig) -> Self {
        self.cache = Some((storage, config));
        self
    }

    // ========================================================================
    // Generic Middleware API
    // ========================================================================

    /// Add a Tower layer around the whole chain.
    ///
    /// Layers are applied in order: first added = outermost (processes
    /// requests first).
    #[must_use]
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<BoxedService> + Send + Sync + 'static,
        L::Service: Service<Request<Bytes>, Response = Response<Bytes>, Error = Error>
            + Clone
            + Send
            + 'static,
        <L::Service as Service<Request<Bytes>>>::Future: Send,
    {
        self.layers.push(Arc::new(move |service| {
            BoxCloneService::new(layer.layer(service))
        }));
        self
    }

    /// Add an async interceptor around the whole chain.
    ///
    /// Interceptors may rewrite the request, observe or replace the
    /// response, or short-circuit without calling [`Next`].
    #[must_use]
    pub fn intercept<F, Fut>(self, intercept: F) -> Self
    where
        F: Fn(Request<Bytes>, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Bytes>>> + Send + 'static,
    {
        self.layer(InterceptLayer::new(intercept))
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Register a hook observing every outgoing request.
    #[must_use]
    pub fn before_request(mut self, hook: impl Fn(&Request<Bytes>) + Send + Sync + 'static) -> Self {
        self.hooks.before_request(hook);
        self
    }

    /// Register a hook observing every response delivered to the caller.
    #[must_use]
    pub fn after_response(
        mut self,
        hook: impl Fn(&Response<Bytes>) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.after_response(hook);
        self
    }

    /// Register a hook observing every error delivered to the caller.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.hooks.on_error(hook);
        self
    }

    // ========================================================================
    // Build
    // ========================================================================

    /// Build the client, wiring configured layers in the canonical order.
    #[must_use]
    pub fn build(self) -> Client {
        let config = self.config.build();
        let pools = Arc::new(PoolManager::new(config.pool.clone()));

        let base = TransportService {
            transport: Arc::new(self.transport),
            pools: Arc::clone(&pools),
        };
        let mut service: BoxedService = BoxCloneService::new(base);

        // Innermost first: each retry attempt gets its own full budget.
        service = BoxCloneService::new(TimeoutLayer::new(config.timeout).layer(service));
        if let Some(cb) = self.circuit_breaker {
            service = BoxCloneService::new(CircuitBreakerLayer::new(cb).layer(service));
        }
        if let Some(retry) = self.retry {
            service = BoxCloneService::new(RetryLayer::new(retry).layer(service));
        }
        if let Some(dedup) = self.dedup {
            service = BoxCloneService::new(DedupLayer::new(dedup).layer(service));
        }
        if let Some((storage, cache)) = self.cache {
            service = BoxCloneService::new(CacheLayer::new(storage, cache).layer(service));
        }

        // User layers and interceptors wrap the chain, first added outermost.
        for layer_fn in self.layers.into_iter().rev() {
            service = layer_fn(service);
        }

        Client {
            service: SyncService::new(service),
            config,
            hooks: Arc::new(self.hooks),
            pools,
        }
    }
}
