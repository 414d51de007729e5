//! Core types and seams for the bulwark resilient HTTP client pipeline.
//!
//! This crate provides the foundational types used by bulwark:
//! - [`Method`] - HTTP method enum
//! - [`Request`] and [`RequestBuilder`] - HTTP request types with
//!   per-request overrides and cancellation
//! - [`Response`] - buffered HTTP response with replayable clones
//! - [`Error`] and [`Result`] - the pipeline's failure taxonomy
//! - [`Origin`] - scheme+host+port identity for per-origin state
//! - [`Transport`] - the abstract dispatch capability the pipeline drives
//! - [`StatusCode`] and [`header`] - re-exported from the `http` crate

mod body;
mod error;
mod method;
mod origin;
pub mod prelude;
mod request;
mod response;
mod transport;

pub use body::{from_json, to_json};
pub use error::{Error, Result, TimeoutPhase};
pub use method::Method;
pub use origin::Origin;
pub use request::{Overrides, Request, RequestBuilder};
pub use response::Response;
pub use transport::Transport;

// Re-export http crate types for status codes and headers
pub use http::{StatusCode, header};
