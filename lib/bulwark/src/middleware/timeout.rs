//! Total-exchange timeout middleware.
//!
//! Bounds the whole request/response exchange and races it against the
//! request's cancellation token. Sits innermost in the chain so each retry
//! attempt gets its own full budget. Connect and first-byte limits are
//! advisory to the transport; this layer enforces only the total phase.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tower::{Layer, Service};

use bulwark_core::{Error, Request, Response, Result, TimeoutPhase};

/// Layer that bounds the total duration of each request.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    default_timeout: Duration,
}

impl TimeoutLayer {
    /// Create a timeout layer with the given default limit.
    ///
    /// A per-request timeout override replaces the default.
    #[must_use]
    pub const fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            default_timeout: self.default_timeout,
        }
    }
}

/// Service that bounds the total duration of each request.
#[derive(Debug, Clone)]
pub struct Timeout<S> {
    inner: S,
    default_timeout: Duration,
}

impl<S> Service<Request<Bytes>> for Timeout<S>
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
        let limit = request.overrides().timeout.unwrap_or(self.default_timeout);
        let token = request.cancellation().clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            tokio::select! {
                () = token.cancelled() => Err(Error::Cancelled),
                outcome = tokio::time::timeout(limit, inner.call(request)) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(TimeoutPhase::Total, limit)),
                },
            }
        })
    }
}
