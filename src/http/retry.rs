//! Retry classification and jittered exponential backoff.
//!
//! A request is retried when the response is a server error, a 429, or a 403
//! whose structured error reason is a rate limit. Delays grow as
//! `random(0, 1) * 2^attempt` units, with attempt 1 being the first retry.

use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::HttpResponse;
use crate::error::TransportError;

/// Default number of additional attempts after the original request.
pub const DEFAULT_RETRY_COUNT: u32 = 1;

/// Default backoff unit.
const DEFAULT_UNIT: Duration = Duration::from_secs(1);

/// Default upper bound on time spent inside a single retried call.
const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(300);

/// 403 reasons that indicate throttling rather than a permission problem.
const RATE_LIMIT_REASONS: [&str; 2] = ["userRateLimitExceeded", "rateLimitExceeded"];

/// Abstraction over waiting, so backoff can be observed in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    reason: String,
}

/// Whether `response` should be retried.
///
/// A 403 is only retried when its body parses as a structured error whose
/// first reason is a rate limit; unparsable bodies are not retried.
pub fn should_retry(response: &HttpResponse) -> bool {
    match response.status {
        500.. => true,
        429 => true,
        403 => match response.json::<ErrorEnvelope>() {
            Ok(envelope) => envelope
                .error
                .errors
                .first()
                .map(|item| RATE_LIMIT_REASONS.contains(&item.reason.as_str()))
                .unwrap_or(false),
            Err(_) => false,
        },
        _ => false,
    }
}

/// Retry policy for a single HTTP call.
#[derive(Clone)]
pub struct RetryPolicy {
    retry_count: u32,
    unit: Duration,
    max_elapsed: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_count", &self.retry_count)
            .field("unit", &self.unit)
            .field("max_elapsed", &self.max_elapsed)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_COUNT)
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `retry_count` attempts after the original.
    pub fn new(retry_count: u32) -> Self {
        Self {
            retry_count,
            unit: DEFAULT_UNIT,
            max_elapsed: DEFAULT_MAX_ELAPSED,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Sets the backoff unit.
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// Sets the upper bound on total time spent retrying one call.
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Replaces the sleeper used between attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// See [`should_retry`].
    pub fn should_retry(&self, response: &HttpResponse) -> bool {
        should_retry(response)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        use rand::RngExt;

        let jitter: f64 = rand::rng().random_range(0.0..1.0);
        self.unit.mul_f64(jitter * 2f64.powi(attempt as i32))
    }

    /// Runs `request`, retrying retryable outcomes up to `retry_count` times.
    ///
    /// The last outcome is returned whether or not it succeeded; callers
    /// decide what a still-failing response means. Transport failures are
    /// retried like retryable statuses.
    pub async fn execute<F, Fut>(&self, mut request: F) -> Result<HttpResponse, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<HttpResponse, TransportError>>,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let outcome = request().await;
            let retryable = match &outcome {
                Ok(response) => should_retry(response),
                Err(_) => true,
            };
            if !retryable || attempt >= self.retry_count {
                return outcome;
            }

            attempt += 1;
            let delay = self.backoff_delay(attempt);
            if started.elapsed() + delay > self.max_elapsed {
                tracing::warn!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Retry budget exhausted, returning last outcome"
                );
                return outcome;
            }

            match &outcome {
                Ok(response) => tracing::warn!(
                    attempt,
                    max_retries = self.retry_count,
                    status = response.status,
                    delay_ms = delay.as_millis() as u64,
                    "Retryable response, backing off"
                ),
                Err(err) => tracing::warn!(
                    attempt,
                    max_retries = self.retry_count,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Transport error, backing off"
                ),
            }
            self.sleeper.sleep(delay).await;
        }
    }
}
