//! HTTP request building.
//!
//! Use [`Request::builder`] to construct requests with headers, query
//! parameters, bodies, per-request policy overrides, and a cancellation
//! token. Requests are immutable by convention: once dispatched, pipeline
//! stages produce new `Request` values instead of mutating a shared one.
//!
//! # Example
//!
//! ```
//! use bulwark_core::{Request, Method};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let request = Request::<Bytes>::builder(Method::Get, "https://api.example.com".parse().unwrap())
//!     .header("Accept", "application/json")
//!     .query("page", "1")
//!     .timeout(Duration::from_secs(5))
//!     .build();
//! ```

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::Method;

/// Per-request policy overrides.
///
/// Every field is optional; `None` means "use the pipeline's configured
/// default". Layers read these without mutating them.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Total timeout for this request.
    pub timeout: Option<Duration>,
    /// Cache TTL for a response stored on behalf of this request.
    pub cache_ttl: Option<Duration>,
    /// Bypass the response cache entirely.
    pub no_cache: bool,
    /// Maximum retry attempts for this request.
    pub max_attempts: Option<u32>,
}

/// An HTTP request with method, URL, headers, optional body, policy
/// overrides, and a cancellation token.
///
/// Cloning a request clones the token handle, not the token: all clones
/// observe the same cancellation signal.
#[derive(Debug, Clone)]
pub struct Request<B = Bytes> {
    method: Method,
    url: url::Url,
    headers: HashMap<String, String>,
    body: Option<B>,
    overrides: Overrides,
    cancellation: CancellationToken,
}

impl<B> Request<B> {
    /// Creates a new [`RequestBuilder`].
    #[must_use]
    pub fn builder(method: Method, url: url::Url) -> RequestBuilder<B> {
        RequestBuilder::new(method, url)
    }

    /// HTTP method.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Request URL.
    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// Request headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Mutable access to headers.
    #[must_use]
    pub fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.headers
    }

    /// Single header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Request body.
    #[must_use]
    pub const fn body(&self) -> Option<&B> {
        self.body.as_ref()
    }

    /// Per-request policy overrides.
    #[must_use]
    pub const fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    /// Cancellation token attached to this request.
    ///
    /// Transports and timed waits inside the pipeline must race against it.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Replace the cancellation token, detaching this request from the
    /// previous token's signal.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Consume into (method, url, headers, body).
    #[must_use]
    pub fn into_parts(self) -> (Method, url::Url, HashMap<String, String>, Option<B>) {
        (self.method, self.url, self.headers, self.body)
    }
}

/// Builder for constructing [`Request`] instances.
#[derive(Debug, Clone)]
pub struct RequestBuilder<B = Bytes> {
    method: Method,
    url: url::Url,
    headers: HashMap<String, String>,
    body: Option<B>,
    overrides: Overrides,
    cancellation: Option<CancellationToken>,
}

impl<B> RequestBuilder<B> {
    /// Creates a new builder.
    #[must_use]
    pub fn new(method: Method, url: url::Url) -> Self {
        Self {
            method,
            url,
            headers: HashMap::new(),
            body: None,
            overrides: Overrides::default(),
            cancellation: None,
        }
    }

    /// Sets a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets multiple headers.
    #[must_use]
    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Appends a query parameter to the URL.
    #[must_use]
    pub fn query(mut self, name: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: B) -> Self {
        self.body = Some(body);
        self
    }

    /// Overrides the total timeout for this request.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.overrides.timeout = Some(timeout);
        self
    }

    /// Overrides the cache TTL for a response stored on behalf of this request.
    #[must_use]
    pub const fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.overrides.cache_ttl = Some(ttl);
        self
    }

    /// Bypasses the response cache for this request.
    #[must_use]
    pub const fn no_cache(mut self) -> Self {
        self.overrides.no_cache = true;
        self
    }

    /// Overrides the maximum retry attempts for this request.
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.overrides.max_attempts = Some(attempts);
        self
    }

    /// Attaches a cancellation token.
    ///
    /// Without one, the request gets a fresh token that never fires unless
    /// the caller keeps a clone and cancels it.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Builds the [`Request`].
    #[must_use]
    pub fn build(self) -> Request<B> {
        Request {
            method: self.method,
            url: self.url,
            headers: self.headers,
            body: self.body,
            overrides: self.overrides,
            cancellation: self.cancellation.unwrap_or_default(),
        }
    }
}

impl RequestBuilder<Bytes> {
    /// Set a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn json<T: serde::Serialize>(self, value: &T) -> crate::Result<Self> {
        let body = crate::to_json(value)?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }
}
