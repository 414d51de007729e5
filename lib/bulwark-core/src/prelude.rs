//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used types and functions
//! for easy glob importing:
//!
//! ```ignore
//! use bulwark_core::prelude::*;
//! ```

pub use crate::{
    Error, Method, Origin, Overrides, Request, RequestBuilder, Response, Result, TimeoutPhase,
    Transport, from_json, to_json,
};
