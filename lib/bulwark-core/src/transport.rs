//! Transport seam.
//!
//! The pipeline never opens sockets itself. It drives an abstract
//! [`Transport`] supplied by the surrounding library: anything that can turn
//! a [`Request`] into a [`Response`]. Implementations must honor the
//! request's cancellation token and return response headers verbatim
//! (including `Retry-After` and `Alt-Svc`), since upstream policies read
//! them.

use std::future::Future;

use bytes::Bytes;

use crate::{Request, Response, Result};

/// Capability to dispatch a single HTTP exchange.
///
/// Implementations should be async-first and cheap to share (`Arc` them or
/// make them `Clone`). Connection pooling guidance is available to them
/// through the pipeline's pool manager.
pub trait Transport: Send + Sync {
    /// Dispatch a request and return the response.
    ///
    /// # Errors
    ///
    /// Returns an error for network failures, timeouts, or an invalid
    /// request. Non-2xx responses are not errors at this seam; policy layers
    /// decide what to do with them.
    fn dispatch(
        &self,
        request: Request<Bytes>,
    ) -> impl Future<Output = Result<Response<Bytes>>> + Send;
}
