//! User-supplied interceptors.
//!
//! An interceptor is an async function that receives the request and a
//! [`Next`] handle to the rest of the chain. It may rewrite the request,
//! observe or rewrite the response, short-circuit without calling [`Next`],
//! or turn a response into an error.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};

use bulwark_core::{Error, Request, Response, Result};

/// Handle to the remainder of the middleware chain.
///
/// Consumed by [`Next::run`]; an interceptor that never calls it
/// short-circuits the chain.
pub struct Next {
    inner: BoxCloneService<Request<Bytes>, Response<Bytes>, Error>,
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

impl Next {
    /// Forward the request to the rest of the chain.
    pub async fn run(mut self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        self.inner.ready().await?.call(request).await
    }
}

/// Boxed interceptor function.
pub type InterceptFn = Arc<
    dyn Fn(Request<Bytes>, Next) -> Pin<Box<dyn Future<Output = Result<Response<Bytes>>> + Send>>
        + Send
        + Sync,
>;

/// Layer that wraps the chain with one interceptor.
#[derive(Clone)]
pub struct InterceptLayer {
    intercept: InterceptFn,
}

impl std::fmt::Debug for InterceptLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptLayer").finish_non_exhaustive()
    }
}

impl InterceptLayer {
    /// Create a layer from an async interceptor function.
    pub fn new<F, Fut>(intercept: F) -> Self
    where
        F: Fn(Request<Bytes>, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Bytes>>> + Send + 'static,
    {
        Self {
            intercept: Arc::new(move |request, next| Box::pin(intercept(request, next))),
        }
    }
}

impl<S> Layer<S> for InterceptLayer {
    type Service = Intercept<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Intercept {
            inner,
            intercept: Arc::clone(&self.intercept),
        }
    }
}

/// Service that runs one interceptor around the inner chain.
#[derive(Clone)]
pub struct Intercept<S> {
    inner: S,
    intercept: InterceptFn,
}

impl<S: std::fmt::Debug> std::fmt::Debug for Intercept<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Intercept")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S> Service<Request<Bytes>> for Intercept<S>
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
        let next = Next {
            inner: BoxCloneService::new(self.inner.clone()),
        };
        (self.intercept)(request, next)
    }
}
