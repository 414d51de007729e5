//! Broadcast hooks.
//!
//! Unlike middleware layers, hooks do not participate in request
//! transformation and cannot short-circuit or swallow anything: they take
//! shared references and run for every request, even when a layer serves
//! the response from cache or rejects it with an open circuit. Stateful
//! observers (metrics, logging collaborators) attach here.

use std::sync::Arc;

use bytes::Bytes;

use bulwark_core::{Error, Request, Response};

/// Hook invoked before the chain sees a request.
pub type BeforeRequestHook = Arc<dyn Fn(&Request<Bytes>) + Send + Sync>;
/// Hook invoked with every response that reaches the caller.
pub type AfterResponseHook = Arc<dyn Fn(&Response<Bytes>) + Send + Sync>;
/// Hook invoked with every error that reaches the caller.
pub type OnErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Ordered hook registry shared by one client.
#[derive(Clone, Default)]
pub struct Hooks {
    before: Vec<BeforeRequestHook>,
    after: Vec<AfterResponseHook>,
    error: Vec<OnErrorHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .field("error", &self.error.len())
            .finish()
    }
}

impl Hooks {
    /// Register a hook that observes every outgoing request.
    pub fn before_request(&mut self, hook: impl Fn(&Request<Bytes>) + Send + Sync + 'static) {
        self.before.push(Arc::new(hook));
    }

    /// Register a hook that observes every response.
    pub fn after_response(&mut self, hook: impl Fn(&Response<Bytes>) + Send + Sync + 'static) {
        self.after.push(Arc::new(hook));
    }

    /// Register a hook that observes every error.
    pub fn on_error(&mut self, hook: impl Fn(&Error) + Send + Sync + 'static) {
        self.error.push(Arc::new(hook));
    }

    pub(crate) fn notify_before(&self, request: &Request<Bytes>) {
        for hook in &self.before {
            hook(request);
        }
    }

    pub(crate) fn notify_after(&self, response: &Response<Bytes>) {
        for hook in &self.after {
            hook(response);
        }
    }

    pub(crate) fn notify_error(&self, error: &Error) {
        for hook in &self.error {
            hook(error);
        }
    }
}
