//! Retry middleware with configurable backoff.
//!
//! Re-dispatches failed requests up to a configurable attempt ceiling,
//! sleeping between attempts according to a [`Backoff`] strategy. A
//! `Retry-After` response header takes precedence over the computed delay.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tower::{Layer, Service, ServiceExt};

use bulwark_core::{Error, Request, Response, Result};

/// Delay growth strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    #[default]
    Exponential,
    /// Random delay in `[base, previous * 3]`, decorrelating retry storms.
    Decorrelated,
}

impl Backoff {
    /// Delay before the attempt following `attempt` completed attempts,
    /// capped at `max` before jitter.
    #[allow(clippy::cast_possible_truncation)]
    fn delay(self, attempt: u32, base: Duration, max: Duration, previous: Duration) -> Duration {
        let raw = match self {
            Self::Linear => base.saturating_mul(attempt),
            Self::Exponential => base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
            Self::Decorrelated => {
                let low = base.as_millis().min(u128::from(u64::MAX)) as u64;
                let high = previous
                    .saturating_mul(3)
                    .as_millis()
                    .min(u128::from(u64::MAX)) as u64;
                Duration::from_millis(if high > low {
                    fastrand::u64(low..=high)
                } else {
                    low
                })
            }
        };
        raw.min(max)
    }
}

/// Applies up to ±25% random jitter, flooring at zero.
fn with_jitter(delay: Duration) -> Duration {
    let factor = 0.75 + fastrand::f64() * 0.5;
    delay.mul_f64(factor)
}

/// What triggered a retry.
#[derive(Debug, Clone)]
pub enum RetryCause {
    /// The attempt failed with an error.
    Error(Error),
    /// The attempt completed with a retryable status code.
    Status(u16),
}

type ShouldRetryFn = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
type OnRetryFn = Arc<dyn Fn(u32, &RetryCause, Duration) + Send + Sync>;

/// Configuration for the retry layer.
///
/// By default, retries:
/// - Connection and timeout errors
/// - 408, 429, 500, 502, 503, 504 responses
///
/// Open-circuit rejections and cancellations are never retried.
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempt ceiling, including the first attempt.
    pub max_attempts: u32,
    /// Base delay fed into the backoff strategy.
    pub delay: Duration,
    /// Upper bound on computed delays. `Retry-After` is honored verbatim
    /// and is not subject to this cap.
    pub max_delay: Duration,
    /// Delay growth strategy.
    pub backoff: Backoff,
    /// Apply ±25% random jitter to computed delays.
    pub jitter: bool,
    /// Status codes that trigger a retry.
    pub retryable_statuses: HashSet<u16>,
    should_retry: ShouldRetryFn,
    on_retry: Option<OnRetryFn>,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("max_delay", &self.max_delay)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retryable_statuses", &self.retryable_statuses)
            .finish_non_exhaustive()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::default(),
            jitter: false,
            retryable_statuses: [408, 429, 500, 502, 503, 504].into_iter().collect(),
            should_retry: Arc::new(|error| error.is_connection() || error.is_timeout()),
            on_retry: None,
        }
    }
}

impl RetryConfig {
    /// Create a configuration with the given attempt ceiling.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set the base delay.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the backoff strategy.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the set of retryable status codes.
    #[must_use]
    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    /// Replace the error predicate deciding which errors are retried.
    ///
    /// Cancellations are never retried, regardless of the predicate.
    #[must_use]
    pub fn with_should_retry(mut self, f: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Arc::new(f);
        self
    }

    /// Observe each scheduled retry: attempt number (1-based, the attempt
    /// that just failed), cause, and the delay about to be slept.
    #[must_use]
    pub fn with_on_retry(
        mut self,
        f: impl Fn(u32, &RetryCause, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }
}

/// Parse a `Retry-After` header value: either delay-seconds or an HTTP-date.
///
/// Past dates and unparseable values yield `None`.
fn parse_retry_after(headers: &std::collections::HashMap<String, String>) -> Option<Duration> {
    let value = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .map(|(_, value)| value.trim())?;

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(value).ok()?;
    date.duration_since(SystemTime::now()).ok()
}

/// Layer that retries failed requests with backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryLayer {
    config: RetryConfig,
}

impl RetryLayer {
    /// Create a retry layer from a configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Service that retries failed requests with backoff.
#[derive(Debug, Clone)]
pub struct Retry<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> Service<Request<Bytes>> for Retry<S>
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
        let config = self.config.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let max_attempts = request
                .overrides()
                .max_attempts
                .unwrap_or(config.max_attempts)
                .max(1);
            let token = request.cancellation().clone();
            let mut previous_delay = config.delay;
            let mut attempt = 1u32;

            loop {
                let result = inner.ready().await?.call(request.clone()).await;

                let cause = match &result {
                    Ok(response) if config.retryable_statuses.contains(&response.status()) => {
                        Some((
                            RetryCause::Status(response.status()),
                            parse_retry_after(response.headers()),
                        ))
                    }
                    Ok(_) => None,
                    Err(error) if error.is_cancelled() => None,
                    Err(error) if (config.should_retry)(error) => {
                        Some((RetryCause::Error(error.clone()), None))
                    }
                    Err(_) => None,
                };

                let Some((cause, retry_after)) = cause else {
                    return result;
                };
                if attempt >= max_attempts {
                    tracing::debug!(attempt, max_attempts, "retry budget exhausted");
                    return result;
                }

                // Server-directed delays win over the computed backoff and
                // skip jitter and the cap.
                let delay = retry_after.unwrap_or_else(|| {
                    let computed =
                        config
                            .backoff
                            .delay(attempt, config.delay, config.max_delay, previous_delay);
                    previous_delay = computed;
                    if config.jitter {
                        with_jitter(computed)
                    } else {
                        computed
                    }
                });

                tracing::debug!(attempt, ?delay, "retrying request");
                if let Some(on_retry) = &config.on_retry {
                    on_retry(attempt, &cause, delay);
                }

                tokio::select! {
                    () = token.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tower::ServiceExt;

    use super::*;
    use bulwark_core::Method;

    /// Mock that fails `failures` times, then answers with `status`.
    #[derive(Clone)]
    struct MockService {
        status: u16,
        failures: u32,
        headers: HashMap<String, String>,
        call_count: Arc<AtomicU32>,
    }

    impl MockService {
        fn succeeding(status: u16) -> Self {
            Self {
                status,
                failures: 0,
                headers: HashMap::new(),
                call_count: Arc::new(AtomicU32::new(0)),
            }
        }

        fn failing_times(failures: u32) -> Self {
            Self {
                status: 200,
                failures,
                headers: HashMap::new(),
                call_count: Arc::new(AtomicU32::new(0)),
            }
        }

        fn with_header(mut self, name: &str, value: &str) -> Self {
            self.headers.insert(name.to_string(), value.to_string());
            self
        }

        fn call_count(&self) -> u32 {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    impl Service<Request<Bytes>> for MockService {
        type Response = Response<Bytes>;
        type Error = Error;
        type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _request: Request<Bytes>) -> Self::Future {
            let call = self.call_count.fetch_add(1, Ordering::SeqCst);
            let should_fail = call < self.failures;
            let status = self.status;
            let headers = self.headers.clone();

            Box::pin(async move {
                if should_fail {
                    Err(Error::connection("connection refused"))
                } else {
                    Ok(Response::new(status, headers, Bytes::new()))
                }
            })
        }
    }

    fn create_request() -> Request<Bytes> {
        let url = url::Url::parse("https://example.com/test").expect("valid url");
        Request::builder(Method::Get, url).build()
    }

    fn no_jitter_linear() -> RetryConfig {
        RetryConfig::default()
            .with_backoff(Backoff::Linear)
            .with_jitter(false)
    }

    #[test]
    fn config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert_eq!(config.backoff, Backoff::Exponential);
        assert!(!config.jitter);
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(config.retryable_statuses.contains(&status));
        }
        assert!(!config.retryable_statuses.contains(&404));
    }

    #[test]
    fn linear_backoff_sequence() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        assert_eq!(
            Backoff::Linear.delay(1, base, max, base),
            Duration::from_millis(100)
        );
        assert_eq!(
            Backoff::Linear.delay(2, base, max, base),
            Duration::from_millis(200)
        );
        assert_eq!(
            Backoff::Linear.delay(3, base, max, base),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn exponential_backoff_sequence() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        assert_eq!(
            Backoff::Exponential.delay(1, base, max, base),
            Duration::from_millis(100)
        );
        assert_eq!(
            Backoff::Exponential.delay(2, base, max, base),
            Duration::from_millis(200)
        );
        assert_eq!(
            Backoff::Exponential.delay(4, base, max, base),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn backoff_capped_at_max_delay() {
        let base = Duration::from_millis(50);
        let max = Duration::from_millis(100);
        for attempt in 1..=1000 {
            let exp = Backoff::Exponential.delay(attempt, base, max, base);
            assert!(exp <= max, "attempt {attempt} exceeded cap: {exp:?}");

            let deco = Backoff::Decorrelated.delay(attempt, base, max, max);
            assert!(deco <= max, "attempt {attempt} exceeded cap: {deco:?}");
            assert!(deco >= Duration::ZERO);
        }
    }

    #[test]
    fn decorrelated_stays_within_band() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        let previous = Duration::from_millis(200);
        for _ in 0..1000 {
            let delay = Backoff::Decorrelated.delay(2, base, max, previous);
            assert!(delay >= base);
            assert!(delay <= previous * 3);
        }
    }

    #[test]
    fn jitter_stays_within_quarter_band() {
        let delay = Duration::from_millis(100);
        for _ in 0..1000 {
            let jittered = with_jitter(delay);
            assert!(jittered >= Duration::from_millis(75));
            assert!(jittered <= Duration::from_millis(125));
        }
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "2".to_string());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));
    }

    #[test]
    fn retry_after_http_date() {
        let future = SystemTime::now() + Duration::from_secs(30);
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), httpdate::fmt_http_date(future));

        let parsed = parse_retry_after(&headers).expect("future date");
        assert!(parsed <= Duration::from_secs(30));
        assert!(parsed > Duration::from_secs(25));
    }

    #[test]
    fn retry_after_past_date_ignored() {
        let past = SystemTime::now() - Duration::from_secs(30);
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), httpdate::fmt_http_date(past));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn retry_after_garbage_ignored() {
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "soonish".to_string());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn success_is_not_retried() {
        let mock = MockService::succeeding(200);
        let mut service = RetryLayer::new(no_jitter_linear()).layer(mock.clone());

        let response = service
            .ready()
            .await
            .expect("ready")
            .call(create_request())
            .await
            .expect("response");
        assert_eq!(response.status(), 200);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_errors_retried_until_budget_exhausted() {
        let mock = MockService::failing_times(u32::MAX);
        let mut service = RetryLayer::new(no_jitter_linear()).layer(mock.clone());

        let result = service
            .ready()
            .await
            .expect("ready")
            .call(create_request())
            .await;
        assert!(result.is_err());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let mock = MockService::failing_times(2);
        let mut service = RetryLayer::new(no_jitter_linear()).layer(mock.clone());

        let response = service
            .ready()
            .await
            .expect("ready")
            .call(create_request())
            .await
            .expect("response");
        assert_eq!(response.status(), 200);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn linear_delays_are_base_times_attempt() {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&delays);
        let config = no_jitter_linear().with_on_retry(move |_, _, delay| {
            observed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(delay);
        });

        let mock = MockService::failing_times(u32::MAX);
        let mut service = RetryLayer::new(config).layer(mock);
        let _ = service
            .ready()
            .await
            .expect("ready")
            .call(create_request())
            .await;

        let delays = delays
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(
            delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_status_is_retried() {
        let mock = MockService::succeeding(503);
        let mut service = RetryLayer::new(no_jitter_linear()).layer(mock.clone());

        let response = service
            .ready()
            .await
            .expect("ready")
            .call(create_request())
            .await
            .expect("response");
        // Budget exhausted, the last response comes back as-is.
        assert_eq!(response.status(), 503);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn client_error_status_not_retried() {
        let mock = MockService::succeeding(400);
        let mut service = RetryLayer::new(no_jitter_linear()).layer(mock.clone());

        let response = service
            .ready()
            .await
            .expect("ready")
            .call(create_request())
            .await
            .expect("response");
        assert_eq!(response.status(), 400);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_header_wins_over_backoff() {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&delays);
        let config = no_jitter_linear()
            .with_on_retry(move |_, _, delay| {
                observed
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(delay);
            });

        let mock = MockService::succeeding(429).with_header("Retry-After", "2");
        let mut service = RetryLayer::new(config).layer(mock);
        let _ = service
            .ready()
            .await
            .expect("ready")
            .call(create_request())
            .await;

        let delays = delays
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn circuit_open_errors_not_retried() {
        #[derive(Clone)]
        struct OpenCircuitMock {
            call_count: Arc<AtomicU32>,
        }

        impl Service<Request<Bytes>> for OpenCircuitMock {
            type Response = Response<Bytes>;
            type Error = Error;
            type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, _request: Request<Bytes>) -> Self::Future {
                self.call_count.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(Error::circuit_open("https://example.com:443")) })
            }
        }

        let mock = OpenCircuitMock {
            call_count: Arc::new(AtomicU32::new(0)),
        };
        let calls = Arc::clone(&mock.call_count);
        let mut service = RetryLayer::new(no_jitter_linear()).layer(mock);

        let result = service
            .ready()
            .await
            .expect("ready")
            .call(create_request())
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn per_request_max_attempts_override() {
        let mock = MockService::failing_times(u32::MAX);
        let mut service = RetryLayer::new(no_jitter_linear()).layer(mock.clone());

        let url = url::Url::parse("https://example.com/test").expect("valid url");
        let request = Request::builder(Method::Get, url).max_attempts(1).build();
        let result = service.ready().await.expect("ready").call(request).await;

        assert!(result.is_err());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_backoff_wait() {
        let mock = MockService::failing_times(u32::MAX);
        let mut service = RetryLayer::new(no_jitter_linear()).layer(mock.clone());

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let url = url::Url::parse("https://example.com/test").expect("valid url");
        let request = Request::builder(Method::Get, url)
            .cancellation(token)
            .build();

        let result = service.ready().await.expect("ready").call(request).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(mock.call_count(), 1);
    }
}
