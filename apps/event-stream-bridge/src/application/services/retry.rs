//! Retry Policy
//!
//! Exponential backoff with jitter for outbound delivery. Used for batch
//! sends, transport retries and execution results.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 3,
        }
    }
}

/// Stateful backoff sequence.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use event_stream_bridge::application::services::retry::{BackoffPolicy, RetryConfig};
///
/// let mut policy = BackoffPolicy::new(RetryConfig {
///     initial_delay: Duration::from_millis(100),
///     jitter_factor: 0.0,
///     max_attempts: 3,
///     ..RetryConfig::default()
/// });
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(200)));
/// assert_eq!(policy.next_delay(), None);
/// ```
#[derive(Debug)]
pub struct BackoffPolicy {
    config: RetryConfig,
    current_delay: Duration,
    retries: u32,
}

impl BackoffPolicy {
    /// Start a new sequence.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            config,
            retries: 0,
        }
    }

    /// Delay before the next retry, or `None` once every attempt is used.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        // The first attempt is not a retry.
        if self.retries + 1 >= self.config.max_attempts {
            return None;
        }
        self.retries += 1;

        let delay = self.apply_jitter(self.current_delay);
        let next = self.current_delay.mul_f64(self.config.multiplier.max(1.0));
        self.current_delay = next.min(self.config.max_delay);

        Some(delay.min(self.config.max_delay))
    }

    /// Retries handed out so far.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = adjusted as u64;
        Duration::from_millis(millis)
    }
}

/// Run `op` until it succeeds or the attempts are exhausted.
///
/// Returns the last error on exhaustion. `label` only feeds the logs.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(config: RetryConfig, label: &str, op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_when(config, label, op, |_| true).await
}

/// Like [`retry_with_backoff`], but an error for which `retryable` is
/// `false` ends the loop at once.
///
/// # Errors
///
/// Returns the first non-retryable error, or the error of the final
/// attempt.
pub async fn retry_with_backoff_when<T, E, F, Fut, R>(
    config: RetryConfig,
    label: &str,
    mut op: F,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut policy = BackoffPolicy::new(config);
    let mut attempt = 1;

    loop {
        let e = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) => e,
        };
        let Some(delay) = policy.next_delay() else {
            return Err(e);
        };
        tracing::debug!(
            label,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %e,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
