//! Response caching middleware.
//!
//! Serves eligible requests from a [`CacheStorage`] backend and stores
//! successful responses with a TTL. A hit short-circuits the rest of the
//! chain. Storage failures are downgraded to misses so a broken backend
//! degrades performance, never correctness.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tower::{Layer, Service};

use crate::storage::{CacheRecord, CacheStorage};
use bulwark_core::{Method, Request, Response, Result};

/// Configuration for the cache layer.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Default time-to-live for stored responses.
    pub ttl: Duration,
    /// Methods eligible for caching.
    pub methods: HashSet<Method>,
    /// Request headers folded into the cache key, so responses that vary
    /// by these headers are stored separately.
    pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            methods: [Method::Get, Method::Head].into_iter().collect(),
            vary_headers: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Set the default TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace the set of cacheable methods.
    #[must_use]
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Fold the given request headers into the cache key.
    #[must_use]
    pub fn with_vary_headers(
        mut self,
        headers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.vary_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    fn key_for(&self, request: &Request<Bytes>) -> String {
        let mut key = format!("{}:{}", request.method(), request.url());
        for name in &self.vary_headers {
            let value = request.header(name).unwrap_or_default();
            key.push_str(&format!("|{name}={value}"));
        }
        key
    }
}

/// Layer that caches successful responses.
#[derive(Clone)]
pub struct CacheLayer {
    storage: Arc<dyn CacheStorage>,
    config: CacheConfig,
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CacheLayer {
    /// Create a cache layer over a storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn CacheStorage>, config: CacheConfig) -> Self {
        Self { storage, config }
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = Cached<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Cached {
            inner,
            storage: Arc::clone(&self.storage),
            config: self.config.clone(),
        }
    }
}

/// Service that caches successful responses.
#[derive(Clone)]
pub struct Cached<S> {
    inner: S,
    storage: Arc<dyn CacheStorage>,
    config: CacheConfig,
}

impl<S: std::fmt::Debug> std::fmt::Debug for Cached<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cached")
            .field("inner", &self.inner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> Service<Request<Bytes>> for Cached<S>
where
    S: Service<Request<Bytes>, Response = Response<Bytes>, Error = bulwark_core::Error>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<Bytes>;
    type Error = bulwark_core::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let eligible =
            self.config.methods.contains(&request.method()) && !request.overrides().no_cache;
        if !eligible {
            let mut inner = self.inner.clone();
            return Box::pin(async move { inner.call(request).await });
        }

        let key = self.config.key_for(&request);
        let ttl = request.overrides().cache_ttl.unwrap_or(self.config.ttl);
        let storage = Arc::clone(&self.storage);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match storage.get(&key).await {
                Ok(Some(record)) => {
                    tracing::debug!(key, "cache hit");
                    return Ok(record.to_response());
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(key, %error, "cache read failed, treating as miss");
                }
            }

            let response = inner.call(request).await?;
            if response.is_success() {
                let record = CacheRecord::snapshot(&key, &response, ttl);
                if let Err(error) = storage.set(record).await {
                    tracing::warn!(key, %error, "cache write failed");
                }
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tower::ServiceExt;

    use super::*;
    use crate::storage::MemoryStorage;
    use bulwark_core::Error;

    #[derive(Clone)]
    struct MockService {
        status: u16,
        call_count: Arc<AtomicU32>,
    }

    impl MockService {
        fn new(status: u16) -> Self {
            Self {
                status,
                call_count: Arc::new(AtomicU32::new(0)),
            }
        }

        fn call_count(&self) -> u32 {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    impl Service<Request<Bytes>> for MockService {
        type Response = Response<Bytes>;
        type Error = Error;
        type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _request: Request<Bytes>) -> Self::Future {
            let call = self.call_count.fetch_add(1, Ordering::SeqCst);
            let status = self.status;
            Box::pin(async move {
                Ok(Response::new(
                    status,
                    HashMap::new(),
                    Bytes::from(format!("call-{call}")),
                ))
            })
        }
    }

    fn layer(config: CacheConfig) -> CacheLayer {
        CacheLayer::new(Arc::new(MemoryStorage::new()), config)
    }

    fn request_to(url: &str) -> Request<Bytes> {
        let url = url::Url::parse(url).expect("valid url");
        Request::builder(Method::Get, url).build()
    }

    #[tokio::test]
    async fn hit_short_circuits_inner_service() {
        let mock = MockService::new(200);
        let mut service = layer(CacheConfig::default()).layer(mock.clone());

        let first = service
            .ready()
            .await
            .expect("ready")
            .call(request_to("https://example.com/users"))
            .await
            .expect("response");
        let second = service
            .ready()
            .await
            .expect("ready")
            .call(request_to("https://example.com/users"))
            .await
            .expect("response");

        assert_eq!(mock.call_count(), 1);
        assert_eq!(first.body(), second.body());
    }

    #[tokio::test]
    async fn expired_entry_refetches() {
        let mock = MockService::new(200);
        let config = CacheConfig::default().with_ttl(Duration::from_millis(30));
        let mut service = layer(config).layer(mock.clone());

        let _ = service
            .ready()
            .await
            .expect("ready")
            .call(request_to("https://example.com/users"))
            .await
            .expect("response");

        tokio::time::sleep(Duration::from_millis(50)).await;

        let refetched = service
            .ready()
            .await
            .expect("ready")
            .call(request_to("https://example.com/users"))
            .await
            .expect("response");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(refetched.text().expect("utf8"), "call-1");
    }

    #[tokio::test]
    async fn post_requests_bypass_cache() {
        let mock = MockService::new(200);
        let mut service = layer(CacheConfig::default()).layer(mock.clone());

        let url = url::Url::parse("https://example.com/users").expect("valid url");
        for _ in 0..2 {
            let request = Request::builder(Method::Post, url.clone()).build();
            let _ = service
                .ready()
                .await
                .expect("ready")
                .call(request)
                .await
                .expect("response");
        }
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn no_cache_override_bypasses_cache() {
        let mock = MockService::new(200);
        let mut service = layer(CacheConfig::default()).layer(mock.clone());

        let url = url::Url::parse("https://example.com/users").expect("valid url");
        for _ in 0..2 {
            let request = Request::builder(Method::Get, url.clone()).no_cache().build();
            let _ = service
                .ready()
                .await
                .expect("ready")
                .call(request)
                .await
                .expect("response");
        }
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn failures_are_not_stored() {
        let mock = MockService::new(502);
        let mut service = layer(CacheConfig::default()).layer(mock.clone());

        for _ in 0..2 {
            let response = service
                .ready()
                .await
                .expect("ready")
                .call(request_to("https://example.com/users"))
                .await
                .expect("response");
            assert_eq!(response.status(), 502);
        }
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn per_request_ttl_override() {
        let mock = MockService::new(200);
        let config = CacheConfig::default().with_ttl(Duration::from_secs(3600));
        let mut service = layer(config).layer(mock.clone());

        let url = url::Url::parse("https://example.com/users").expect("valid url");
        let request = Request::builder(Method::Get, url)
            .cache_ttl(Duration::from_millis(30))
            .build();
        let _ = service
            .ready()
            .await
            .expect("ready")
            .call(request)
            .await
            .expect("response");

        tokio::time::sleep(Duration::from_millis(50)).await;

        let _ = service
            .ready()
            .await
            .expect("ready")
            .call(request_to("https://example.com/users"))
            .await
            .expect("response");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn vary_headers_split_the_key() {
        let mock = MockService::new(200);
        let config = CacheConfig::default().with_vary_headers(["Accept-Language"]);
        let mut service = layer(config).layer(mock.clone());

        let url = url::Url::parse("https://example.com/users").expect("valid url");
        for lang in ["en", "fr", "en"] {
            let request = Request::builder(Method::Get, url.clone())
                .header("Accept-Language", lang)
                .build();
            let _ = service
                .ready()
                .await
                .expect("ready")
                .call(request)
                .await
                .expect("response");
        }

        // "en" was served from cache the second time.
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn storage_failure_degrades_to_miss() {
        struct BrokenStorage;

        #[async_trait]
        impl CacheStorage for BrokenStorage {
            async fn get(&self, _key: &str) -> Result<Option<CacheRecord>> {
                Err(Error::cache("disk on fire"))
            }
            async fn set(&self, _record: CacheRecord) -> Result<()> {
                Err(Error::cache("disk on fire"))
            }
            async fn delete(&self, _key: &str) -> Result<()> {
                Err(Error::cache("disk on fire"))
            }
            async fn clear(&self, _prefix: Option<&str>) -> Result<()> {
                Err(Error::cache("disk on fire"))
            }
            async fn purge_expired(&self) -> Result<usize> {
                Err(Error::cache("disk on fire"))
            }
        }

        let mock = MockService::new(200);
        let cache = CacheLayer::new(Arc::new(BrokenStorage), CacheConfig::default());
        let mut service = cache.layer(mock.clone());

        let response = service
            .ready()
            .await
            .expect("ready")
            .call(request_to("https://example.com/users"))
            .await
            .expect("response");
        assert_eq!(response.status(), 200);
        assert_eq!(mock.call_count(), 1);
    }
}
