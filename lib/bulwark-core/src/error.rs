//! Error types for bulwark.
//!
//! The pipeline distinguishes failure classes so that policies can
//! pattern-match on them: retry recovers [`Error::Connection`],
//! [`Error::Timeout`] and retryable HTTP statuses; the circuit breaker
//! synthesizes [`Error::CircuitOpen`] without ever reaching the transport.
//!
//! All variants are `Clone` so a single in-flight failure can be fanned out
//! to every caller coalesced onto the same request.

use std::time::Duration;

use derive_more::{Display, Error, From};

/// Timeout phase that expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TimeoutPhase {
    /// Establishing the connection.
    #[display("connect")]
    Connect,
    /// Waiting for the first response byte.
    #[display("first-byte")]
    FirstByte,
    /// The whole request/response exchange.
    #[display("total")]
    Total,
}

/// Main error type for bulwark operations.
#[derive(Debug, Clone, Display, Error, From)]
pub enum Error {
    /// HTTP-level errors (non-2xx status codes).
    #[display("HTTP error {status}: {message}")]
    #[from(skip)]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
        /// Response body, if available.
        #[error(not(source))]
        body: Option<bytes::Bytes>,
    },

    /// Network/connection errors.
    #[display("connection error: {message}")]
    #[from(skip)]
    Connection {
        /// Transport-specific error code (e.g. `ECONNREFUSED`), if known.
        code: Option<String>,
        /// Error message.
        message: String,
    },

    /// A phase-scoped timeout expired.
    #[display("{phase} timeout after {limit:?}")]
    #[from(skip)]
    Timeout {
        /// Which timeout phase expired.
        phase: TimeoutPhase,
        /// The configured limit for that phase.
        limit: Duration,
    },

    /// The circuit breaker for this origin is open; the transport was never
    /// invoked. Synthesized locally and never recorded as a new failure.
    #[display("circuit breaker open for {origin}")]
    #[from(skip)]
    CircuitOpen {
        /// Origin (scheme+host+port) whose circuit is open.
        origin: String,
    },

    /// The request's cancellation token fired.
    #[display("request cancelled")]
    #[from(skip)]
    Cancelled,

    /// Invalid request configuration.
    #[display("invalid request: {_0}")]
    #[from(skip)]
    InvalidRequest(#[error(not(source))] String),

    /// JSON serialization error.
    #[display("JSON serialization error: {_0}")]
    #[from(skip)]
    JsonSerialization(#[error(not(source))] String),

    /// JSON deserialization error with path context.
    #[display("JSON deserialization error at '{path}': {message}")]
    #[from(skip)]
    JsonDeserialization {
        /// JSON path to the error (e.g., "user.address.city").
        path: String,
        /// Error message.
        message: String,
    },

    /// Cache storage backend failure. Never surfaced as a request failure:
    /// the cache layer downgrades it to a miss.
    #[display("cache storage error: {_0}")]
    #[from(skip)]
    Cache(#[error(not(source))] String),

    /// URL parsing error.
    #[display("invalid URL: {_0}")]
    #[from]
    InvalidUrl(url::ParseError),
}

/// Result type alias using [`crate::Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an HTTP error from status code and message.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            body: None,
        }
    }

    /// Create an HTTP error with body.
    #[must_use]
    pub fn http_with_body(status: u16, message: impl Into<String>, body: bytes::Bytes) -> Self {
        Self::Http {
            status,
            message: message.into(),
            body: Some(body),
        }
    }

    /// Create a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            code: None,
            message: message.into(),
        }
    }

    /// Create a connection error with a transport-specific error code.
    #[must_use]
    pub fn connection_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Create a timeout error for the given phase.
    #[must_use]
    pub const fn timeout(phase: TimeoutPhase, limit: Duration) -> Self {
        Self::Timeout { phase, limit }
    }

    /// Create a circuit-open error for an origin.
    #[must_use]
    pub fn circuit_open(origin: impl Into<String>) -> Self {
        Self::CircuitOpen {
            origin: origin.into(),
        }
    }

    /// Create an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a cache storage error.
    #[must_use]
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache(message.into())
    }

    /// Create a JSON deserialization error with path context.
    #[must_use]
    pub fn json_deserialization(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JsonDeserialization {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if this is a timeout error (any phase).
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Returns `true` if the circuit breaker rejected this request.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns `true` if the request was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the HTTP status code if this is an HTTP error.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|s| (400..500).contains(&s))
    }

    /// Returns `true` if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|s| (500..600).contains(&s))
    }

    /// Returns the response body if this is an HTTP error with a body.
    #[must_use]
    pub fn body(&self) -> Option<&bytes::Bytes> {
        match self {
            Self::Http { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}
