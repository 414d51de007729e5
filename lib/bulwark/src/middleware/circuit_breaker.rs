//! Per-origin circuit breaker middleware.
//!
//! Tracks consecutive failures independently for every origin
//! (scheme + host + port) and rejects requests to an origin whose circuit
//! is open, so one failing host cannot degrade traffic to healthy ones.
//!
//! State machine per origin:
//! - Closed: requests flow; a success resets the consecutive failure count.
//! - Open: requests are rejected with [`Error::CircuitOpen`] until the reset
//!   timeout elapses.
//! - Half-open: exactly one probe request is admitted; its success closes
//!   the circuit, its failure re-opens it for a fresh timeout.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tower::{Layer, Service};

use bulwark_core::{Error, Origin, Request, Response, Result};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,
    /// Circuit is open, requests are rejected immediately.
    Open,
    /// Circuit is half-open, a single probe request is in flight.
    HalfOpen,
}

type TripFn = Arc<dyn Fn(&Result<Response<Bytes>>) -> bool + Send + Sync>;
type StateChangeFn = Arc<dyn Fn(&str, CircuitState) + Send + Sync>;

/// Configuration for the circuit breaker.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures on one origin before its circuit opens.
    pub failure_threshold: u32,
    /// Duration an open circuit rejects requests before admitting a probe.
    pub reset_timeout: Duration,
    should_trip: TripFn,
    on_state_change: Option<StateChangeFn>,
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            // 5xx responses and errors count as failures; open-circuit
            // rejections and caller cancellations do not.
            should_trip: Arc::new(|result| match result {
                Ok(response) => response.is_server_error(),
                Err(error) => !error.is_circuit_open() && !error.is_cancelled(),
            }),
            on_state_change: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration with the given threshold and reset timeout.
    #[must_use]
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            ..Self::default()
        }
    }

    /// Set the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the reset timeout.
    #[must_use]
    pub const fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Replace the predicate deciding which outcomes count as failures.
    #[must_use]
    pub fn with_should_trip(
        mut self,
        f: impl Fn(&Result<Response<Bytes>>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_trip = Arc::new(f);
        self
    }

    /// Observe every state transition: origin key and the state entered.
    #[must_use]
    pub fn with_on_state_change(
        mut self,
        f: impl Fn(&str, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    fn notify(&self, origin: &str, state: CircuitState) {
        tracing::debug!(origin, ?state, "circuit state changed");
        if let Some(observer) = &self.on_state_change {
            observer(origin, state);
        }
    }
}

/// Failure accounting for one origin.
#[derive(Debug)]
struct OriginCircuit {
    /// 0 = Closed, 1 = Open, 2 = `HalfOpen`.
    state: AtomicU32,
    /// Consecutive failure count while closed.
    failure_count: AtomicU32,
    /// Timestamp when the circuit last opened (millis since epoch).
    opened_at: AtomicU64,
}

impl OriginCircuit {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            failure_count: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
        }
    }

    fn get_state(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn current_time_millis() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Whether this caller may proceed. At most one caller wins the
    /// open-to-half-open transition and becomes the probe; everyone else
    /// is rejected until the probe resolves.
    fn try_admit(&self, config: &CircuitBreakerConfig, origin: &str) -> bool {
        self.try_admit_at(config, origin, Self::current_time_millis())
    }

    /// An open circuit rejects while `now - opened_at <= reset_timeout`;
    /// the first caller past that boundary becomes the probe.
    fn try_admit_at(&self, config: &CircuitBreakerConfig, origin: &str, now_ms: u64) -> bool {
        match self.get_state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = self.opened_at.load(Ordering::SeqCst);
                let elapsed = Duration::from_millis(now_ms.saturating_sub(opened_at));
                if elapsed > config.reset_timeout
                    && self
                        .state
                        .compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    config.notify(origin, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            // The probe admitted by the CAS above is already in flight.
            CircuitState::HalfOpen => false,
        }
    }

    fn record_success(&self, config: &CircuitBreakerConfig, origin: &str) {
        match self.get_state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                self.state.store(0, Ordering::SeqCst);
                self.failure_count.store(0, Ordering::SeqCst);
                config.notify(origin, CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, config: &CircuitBreakerConfig, origin: &str) {
        match self.get_state() {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= config.failure_threshold {
                    self.state.store(1, Ordering::SeqCst);
                    self.opened_at
                        .store(Self::current_time_millis(), Ordering::SeqCst);
                    config.notify(origin, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Failed probe re-opens for a fresh timeout.
                self.state.store(1, Ordering::SeqCst);
                self.opened_at
                    .store(Self::current_time_millis(), Ordering::SeqCst);
                config.notify(origin, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }
}

/// Lazily-populated map of per-origin circuits.
#[derive(Debug, Default)]
struct CircuitRegistry {
    circuits: Mutex<HashMap<Origin, Arc<OriginCircuit>>>,
}

impl CircuitRegistry {
    fn circuit_for(&self, origin: &Origin) -> Arc<OriginCircuit> {
        let mut circuits = self
            .circuits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            circuits
                .entry(origin.clone())
                .or_insert_with(|| Arc::new(OriginCircuit::new())),
        )
    }

    fn state_of(&self, origin: &Origin) -> CircuitState {
        let circuits = self
            .circuits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        circuits
            .get(origin)
            .map_or(CircuitState::Closed, |circuit| circuit.get_state())
    }
}

/// Layer that applies per-origin circuit breaking to requests.
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    config: CircuitBreakerConfig,
    registry: Arc<CircuitRegistry>,
}

impl Default for CircuitBreakerLayer {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerLayer {
    /// Create a circuit breaker layer with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(CircuitRegistry::default()),
        }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreaker<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreaker {
            inner,
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

/// Service that applies per-origin circuit breaking to requests.
#[derive(Debug, Clone)]
pub struct CircuitBreaker<S> {
    inner: S,
    config: CircuitBreakerConfig,
    registry: Arc<CircuitRegistry>,
}

impl<S> CircuitBreaker<S> {
    /// Current circuit state for the origin of `url`.
    ///
    /// Origins without recorded traffic report [`CircuitState::Closed`].
    #[must_use]
    pub fn circuit_state(&self, url: &url::Url) -> CircuitState {
        Origin::of(url).map_or(CircuitState::Closed, |origin| {
            self.registry.state_of(&origin)
        })
    }
}

impl<S> Service<Request<Bytes>> for CircuitBreaker<S>
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
        // URLs without a derivable origin bypass accounting entirely.
        let Some(origin) = Origin::of(request.url()) else {
            let mut inner = self.inner.clone();
            return Box::pin(async move { inner.call(request).await });
        };

        let circuit = self.registry.circuit_for(&origin);
        let config = self.config.clone();
        let origin_key = origin.to_string();

        if !circuit.try_admit(&config, &origin_key) {
            return Box::pin(async move { Err(Error::circuit_open(origin_key)) });
        }

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let result = inner.call(request).await;

            if (config.should_trip)(&result) {
                circuit.record_failure(&config, &origin_key);
            } else if result.is_ok() {
                circuit.record_success(&config, &origin_key);
            }

            result
        })
    }
}
