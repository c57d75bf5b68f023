use std::fmt;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use http::{Method, StatusCode};

use crate::descriptor::RequestDescriptor;
use crate::error::RequestError;

pub const DEFAULT_RETRY: u32 = 3;
pub const DEFAULT_NO_RESPONSE_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_DELAY_MULTIPLIER: f64 = 2.0;

/// Custom retry predicate. Replaces the default method/status eligibility
/// rules; the attempt ceiling and user aborts are still enforced.
pub trait ShouldRetry: Send + Sync {
    fn should_retry<'a>(&'a self, error: &'a RequestError) -> BoxFuture<'a, bool>;
}

impl<F> ShouldRetry for F
where
    F: Fn(&RequestError) -> bool + Send + Sync,
{
    fn should_retry<'a>(&'a self, error: &'a RequestError) -> BoxFuture<'a, bool> {
        let decision = self(error);
        Box::pin(async move { decision })
    }
}

/// Hook awaited after the attempt counter is bumped and before the backoff
/// sleep. `next` is the descriptor the next attempt will be sent with.
pub trait OnRetryAttempt: Send + Sync {
    fn on_retry_attempt<'a>(
        &'a self,
        error: &'a RequestError,
        next: &'a mut RequestDescriptor,
    ) -> BoxFuture<'a, ()>;
}

impl<F> OnRetryAttempt for F
where
    F: Fn(&RequestError, &mut RequestDescriptor) + Send + Sync,
{
    fn on_retry_attempt<'a>(
        &'a self,
        error: &'a RequestError,
        next: &'a mut RequestDescriptor,
    ) -> BoxFuture<'a, ()> {
        self(error, next);
        Box::pin(async {})
    }
}

/// Replaces the default sleep between attempts.
pub trait RetryBackoff: Send + Sync {
    fn backoff<'a>(&'a self, error: &'a RequestError, delay: Duration) -> BoxFuture<'a, ()>;
}

impl<F, Fut> RetryBackoff for F
where
    F: Fn(&RequestError, Duration) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn backoff<'a>(&'a self, error: &'a RequestError, delay: Duration) -> BoxFuture<'a, ()> {
        Box::pin(self(error, delay))
    }
}

/// Retry policy and the retry state of one logical call.
///
/// Unset fields fall back to the defaults when read, which lets instance
/// defaults and call-site overrides merge field by field.
#[derive(Clone, Default)]
pub struct RetryConfig {
    retry: Option<u32>,
    no_response_retries: Option<u32>,
    http_methods_to_retry: Option<Vec<Method>>,
    status_codes_to_retry: Option<Vec<RangeInclusive<u16>>>,
    retry_delay: Option<Duration>,
    retry_delay_multiplier: Option<f64>,
    max_retry_delay: Option<Duration>,
    total_timeout: Option<Duration>,
    should_retry: Option<Arc<dyn ShouldRetry>>,
    on_retry_attempt: Option<Arc<dyn OnRetryAttempt>>,
    retry_backoff: Option<Arc<dyn RetryBackoff>>,
    current_retry_attempt: u32,
    time_of_first_request: Option<Instant>,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RetryConfig")
            .field("retry", &self.retry_limit())
            .field("current_retry_attempt", &self.current_retry_attempt)
            .field("no_response_retries", &self.no_response_retry_limit())
            .field("http_methods_to_retry", &self.methods_to_retry())
            .field("status_codes_to_retry", &self.status_ranges_to_retry())
            .field("retry_delay", &self.base_delay())
            .field("retry_delay_multiplier", &self.delay_multiplier())
            .field("max_retry_delay", &self.max_retry_delay)
            .field("total_timeout", &self.total_timeout)
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry_attempt", &self.on_retry_attempt.is_some())
            .field("retry_backoff", &self.retry_backoff.is_some())
            .finish()
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of retries, not counting the first attempt.
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn no_response_retries(mut self, retries: u32) -> Self {
        self.no_response_retries = Some(retries);
        self
    }

    pub fn http_methods_to_retry(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.http_methods_to_retry = Some(methods.into_iter().collect());
        self
    }

    pub fn status_codes_to_retry(
        mut self,
        ranges: impl IntoIterator<Item = RangeInclusive<u16>>,
    ) -> Self {
        self.status_codes_to_retry = Some(ranges.into_iter().collect());
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn retry_delay_multiplier(mut self, multiplier: f64) -> Self {
        self.retry_delay_multiplier = Some(multiplier.max(0.0));
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = Some(delay);
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    pub fn should_retry(mut self, predicate: impl ShouldRetry + 'static) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn on_retry_attempt(mut self, hook: impl OnRetryAttempt + 'static) -> Self {
        self.on_retry_attempt = Some(Arc::new(hook));
        self
    }

    pub fn retry_backoff(mut self, backoff: impl RetryBackoff + 'static) -> Self {
        self.retry_backoff = Some(Arc::new(backoff));
        self
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry.unwrap_or(DEFAULT_RETRY)
    }

    pub fn no_response_retry_limit(&self) -> u32 {
        self.no_response_retries
            .unwrap_or(DEFAULT_NO_RESPONSE_RETRIES)
    }

    pub fn methods_to_retry(&self) -> Vec<Method> {
        self.http_methods_to_retry
            .clone()
            .unwrap_or_else(default_methods_to_retry)
    }

    pub fn status_ranges_to_retry(&self) -> Vec<RangeInclusive<u16>> {
        self.status_codes_to_retry
            .clone()
            .unwrap_or_else(default_status_ranges_to_retry)
    }

    pub fn base_delay(&self) -> Duration {
        self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY)
    }

    pub fn delay_multiplier(&self) -> f64 {
        self.retry_delay_multiplier
            .unwrap_or(DEFAULT_RETRY_DELAY_MULTIPLIER)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_retry_delay.unwrap_or(Duration::MAX)
    }

    pub fn total_timeout_budget(&self) -> Duration {
        self.total_timeout.unwrap_or(Duration::MAX)
    }

    /// Retries performed so far; the first request is attempt 0.
    pub fn current_retry_attempt(&self) -> u32 {
        self.current_retry_attempt
    }

    pub fn time_of_first_request(&self) -> Option<Instant> {
        self.time_of_first_request
    }

    pub(crate) fn set_current_retry_attempt(&mut self, attempt: u32) {
        self.current_retry_attempt = attempt;
    }

    pub(crate) fn mark_first_request(&mut self, now: Instant) {
        self.time_of_first_request.get_or_insert(now);
    }

    pub(crate) fn on_retry_attempt_hook(&self) -> Option<Arc<dyn OnRetryAttempt>> {
        self.on_retry_attempt.clone()
    }

    pub(crate) fn retry_backoff_hook(&self) -> Option<Arc<dyn RetryBackoff>> {
        self.retry_backoff.clone()
    }

    /// Field-wise merge; values set on `overrides` win. Lists replace wholesale.
    pub fn merge(&self, overrides: &RetryConfig) -> RetryConfig {
        RetryConfig {
            retry: overrides.retry.or(self.retry),
            no_response_retries: overrides.no_response_retries.or(self.no_response_retries),
            http_methods_to_retry: overrides
                .http_methods_to_retry
                .clone()
                .or_else(|| self.http_methods_to_retry.clone()),
            status_codes_to_retry: overrides
                .status_codes_to_retry
                .clone()
                .or_else(|| self.status_codes_to_retry.clone()),
            retry_delay: overrides.retry_delay.or(self.retry_delay),
            retry_delay_multiplier: overrides
                .retry_delay_multiplier
                .or(self.retry_delay_multiplier),
            max_retry_delay: overrides.max_retry_delay.or(self.max_retry_delay),
            total_timeout: overrides.total_timeout.or(self.total_timeout),
            should_retry: overrides
                .should_retry
                .clone()
                .or_else(|| self.should_retry.clone()),
            on_retry_attempt: overrides
                .on_retry_attempt
                .clone()
                .or_else(|| self.on_retry_attempt.clone()),
            retry_backoff: overrides
                .retry_backoff
                .clone()
                .or_else(|| self.retry_backoff.clone()),
            current_retry_attempt: overrides
                .current_retry_attempt
                .max(self.current_retry_attempt),
            time_of_first_request: overrides
                .time_of_first_request
                .or(self.time_of_first_request),
        }
    }

    /// Fills every unset policy field with its default so snapshots report the
    /// values actually in effect.
    pub(crate) fn materialized(mut self) -> Self {
        self.retry = Some(self.retry_limit());
        self.no_response_retries = Some(self.no_response_retry_limit());
        self.http_methods_to_retry = Some(self.methods_to_retry());
        self.status_codes_to_retry = Some(self.status_ranges_to_retry());
        self.retry_delay = Some(self.base_delay());
        self.retry_delay_multiplier = Some(self.delay_multiplier());
        self
    }

    pub fn is_retryable_method(&self, method: &Method) -> bool {
        match &self.http_methods_to_retry {
            Some(methods) => methods.contains(method),
            None => default_methods_to_retry().contains(method),
        }
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        let status = status.as_u16();
        match &self.status_codes_to_retry {
            Some(ranges) => ranges.iter().any(|range| range.contains(&status)),
            None => default_status_ranges_to_retry()
                .iter()
                .any(|range| range.contains(&status)),
        }
    }

    /// Delay before the next retry, computed from the current attempt counter
    /// (before it is incremented) and the time already spent.
    ///
    /// The first retry waits `retry_delay`; later ones wait
    /// `(multiplier^attempt - 1) / 2` seconds. The result is capped by
    /// `max_retry_delay` and by what is left of `total_timeout`.
    pub fn next_retry_delay(&self, elapsed: Duration) -> Duration {
        let attempt = self.current_retry_attempt;
        let first_retry_delay = if attempt == 0 {
            self.base_delay()
        } else {
            Duration::ZERO
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let growth_secs = (self.delay_multiplier().powi(exponent) - 1.0) / 2.0;
        let growth = Duration::try_from_secs_f64(growth_secs.max(0.0)).unwrap_or(Duration::MAX);

        let remaining = self.total_timeout_budget().saturating_sub(elapsed);
        first_retry_delay
            .saturating_add(growth)
            .min(remaining)
            .min(self.max_delay())
    }
}

/// Default eligibility for a failed attempt, given its retry config.
pub(crate) async fn should_retry_request(config: &RetryConfig, error: &RequestError) -> bool {
    if error.config().signal().is_user_aborted() {
        return false;
    }
    let current = config.current_retry_attempt();
    let limit = config.retry_limit();
    if limit == 0 || current >= limit {
        return false;
    }
    if let Some(predicate) = &config.should_retry {
        return predicate.should_retry(error).await;
    }

    if error.response().is_none() && current >= config.no_response_retry_limit() {
        return false;
    }
    if !config.is_retryable_method(error.config().method()) {
        return false;
    }
    if let Some(status) = error.status()
        && !config.is_retryable_status(status)
    {
        return false;
    }
    true
}

fn default_methods_to_retry() -> Vec<Method> {
    vec![
        Method::GET,
        Method::HEAD,
        Method::PUT,
        Method::OPTIONS,
        Method::DELETE,
    ]
}

fn default_status_ranges_to_retry() -> Vec<RangeInclusive<u16>> {
    vec![100..=199, 408..=408, 429..=429, 500..=599]
}
