//! Request deduplication middleware.
//!
//! Coalesces identical concurrent requests into one in-flight dispatch.
//! The first caller for a key initiates the dispatch; callers arriving
//! while it is in flight join it and receive a clone of the same outcome,
//! success or failure. The pending entry is removed before the outcome
//! resolves, so any caller arriving afterwards starts a fresh dispatch.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::Shared;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};

use bulwark_core::{Error, Method, Request, Response, Result};

type KeyFn = Arc<dyn Fn(&Request<Bytes>) -> String + Send + Sync>;
type PendingFuture = Shared<Pin<Box<dyn Future<Output = Result<Response<Bytes>>> + Send>>>;
type PendingMap = Arc<Mutex<HashMap<String, PendingFuture>>>;

/// Configuration for the deduplication layer.
#[derive(Clone)]
pub struct DedupConfig {
    /// Methods eligible for coalescing.
    pub methods: HashSet<Method>,
    key_fn: KeyFn,
}

impl std::fmt::Debug for DedupConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupConfig")
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            methods: [Method::Get, Method::Head].into_iter().collect(),
            key_fn: Arc::new(|request| format!("{}:{}", request.method(), request.url())),
        }
    }
}

impl DedupConfig {
    /// Replace the set of methods eligible for coalescing.
    #[must_use]
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Replace the coalescing key function.
    ///
    /// The default key is `"{METHOD}:{url}"`. A custom key can fold in
    /// headers or a tenant identifier.
    #[must_use]
    pub fn with_key_fn(
        mut self,
        f: impl Fn(&Request<Bytes>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_fn = Arc::new(f);
        self
    }
}

/// Layer that coalesces identical in-flight requests.
#[derive(Clone, Default)]
pub struct DedupLayer {
    config: DedupConfig,
    pending: PendingMap,
}

impl std::fmt::Debug for DedupLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupLayer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DedupLayer {
    /// Create a deduplication layer from a configuration.
    #[must_use]
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            pending: Arc::default(),
        }
    }
}

impl<S> Layer<S> for DedupLayer {
    type Service = Dedup<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Dedup {
            inner,
            config: self.config.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

/// Service that coalesces identical in-flight requests.
#[derive(Clone)]
pub struct Dedup<S> {
    inner: S,
    config: DedupConfig,
    pending: PendingMap,
}

impl<S: std::fmt::Debug> std::fmt::Debug for Dedup<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dedup")
            .field("inner", &self.inner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> Dedup<S> {
    /// Number of coalescing keys currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl<S> Service<Request<Bytes>> for Dedup<S>
where
    S: Service<Request<Bytes>, Response = Response<Bytes>, Error = Error> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        if !self.config.methods.contains(&request.method()) {
            let mut inner = self.inner.clone();
            return Box::pin(async move { inner.call(request).await });
        }

        let key = (self.config.key_fn)(&request);
        let token = request.cancellation().clone();

        // Lookup and insertion happen under one lock so concurrent callers
        // cannot both become initiators for the same key.
        let shared = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if let Some(existing) = pending.get(&key) {
                tracing::debug!(key, "joining in-flight request");
                existing.clone()
            } else {
                let mut inner = self.inner.clone();
                let pending_map = Arc::clone(&self.pending);
                let entry_key = key.clone();
                // The flight serves every joiner, so it must not die with
                // the initiator: it runs under its own token. Each caller's
                // token only guards its wait below.
                let request = request.with_cancellation(CancellationToken::new());

                let flight: Pin<Box<dyn Future<Output = Result<Response<Bytes>>> + Send>> =
                    Box::pin(async move {
                        let result = inner.call(request).await;
                        // Remove before the outcome is visible, so a caller
                        // reacting to it (e.g. a retry) starts a fresh flight.
                        pending_map
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .remove(&entry_key);
                        result
                    });
                let shared = flight.shared();
                pending.insert(key.clone(), shared.clone());
                shared
            }
        };

        // Cancellation abandons only this caller's wait; the coalesced
        // flight keeps running for everyone else.
        Box::pin(async move {
            tokio::select! {
                () = token.cancelled() => Err(Error::Cancelled),
                result = shared => result,
            }
        })
    }
}
