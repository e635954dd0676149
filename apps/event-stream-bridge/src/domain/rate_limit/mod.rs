//! Token Bucket Rate Limiter
//!
//! Admission control for the broadcaster. Tokens refill continuously and
//! lazily on each access; there is no background timer.
//!
//! ```text
//! tokens = min(max_tokens, tokens + elapsed_secs * refill_rate)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Upper bound on a single sleep inside [`TokenBucket::acquire_wait`].
const MAX_WAIT_SLICE: Duration = Duration::from_secs(1);

/// Rate limiter construction error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    /// Capacity must be a positive finite number.
    #[error("token bucket max_tokens must be positive, got {0}")]
    InvalidCapacity(f64),
    /// Refill rate must be a positive finite number.
    #[error("token bucket refill_rate must be positive, got {0}")]
    InvalidRefillRate(f64),
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, max_tokens: f64, refill_rate: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(max_tokens);
        self.last_refill = now;
    }
}

/// Token bucket with continuous lazy refill.
///
/// # Example
///
/// ```rust
/// use event_stream_bridge::domain::rate_limit::TokenBucket;
///
/// let bucket = TokenBucket::new(5.0, 5.0).unwrap();
/// for _ in 0..5 {
///     assert!(bucket.acquire(1.0));
/// }
/// assert!(!bucket.acquire(1.0));
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    max_tokens: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
    acquired: AtomicU64,
    rejected: AtomicU64,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if either parameter is non-positive or not finite.
    pub fn new(max_tokens: f64, refill_rate: f64) -> Result<Self, RateLimitError> {
        if !max_tokens.is_finite() || max_tokens <= 0.0 {
            return Err(RateLimitError::InvalidCapacity(max_tokens));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(RateLimitError::InvalidRefillRate(refill_rate));
        }

        Ok(Self {
            max_tokens,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
            acquired: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Try to take `n` tokens without waiting.
    pub fn acquire(&self, n: f64) -> bool {
        let granted = self.try_take(n).is_ok();
        if granted {
            self.acquired.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        granted
    }

    /// Take `n` tokens, sleeping for exactly the computed refill time
    /// until they are available or `timeout` expires.
    pub async fn acquire_wait(&self, n: f64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let wait = match self.try_take(n) {
                Ok(()) => {
                    self.acquired.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(None) => break,
                Err(Some(wait)) => wait,
            };

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let remaining = deadline - now;
            let sleep_for = wait.min(MAX_WAIT_SLICE).min(remaining);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }

        self.rejected.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Tokens currently available (after refill).
    #[must_use]
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(self.max_tokens, self.refill_rate);
        state.tokens
    }

    /// Bucket capacity.
    #[must_use]
    pub const fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    /// Snapshot of bucket statistics.
    #[must_use]
    pub fn stats(&self) -> TokenBucketStats {
        TokenBucketStats {
            max_tokens: self.max_tokens,
            refill_rate: self.refill_rate,
            available_tokens: self.available(),
            acquired: self.acquired.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Check-and-decrement under the lock.
    ///
    /// On failure returns the wait until enough tokens exist, or `None`
    /// when the request can never be satisfied.
    fn try_take(&self, n: f64) -> Result<(), Option<Duration>> {
        if !n.is_finite() || n < 0.0 || n > self.max_tokens {
            return Err(None);
        }

        let mut state = self.state.lock();
        state.refill(self.max_tokens, self.refill_rate);

        if state.tokens >= n {
            state.tokens -= n;
            return Ok(());
        }

        let deficit = (n - state.tokens).max(0.0);
        let wait = Duration::try_from_secs_f64(deficit / self.refill_rate)
            .unwrap_or(MAX_WAIT_SLICE);
        Err(Some(wait))
    }
}

/// Token bucket statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TokenBucketStats {
    /// Bucket capacity.
    pub max_tokens: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Tokens available right now.
    pub available_tokens: f64,
    /// Successful acquisitions.
    pub acquired: u64,
    /// Rejected or timed-out acquisitions.
    pub rejected: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn rejects_non_positive_parameters() {
        assert_eq!(
            TokenBucket::new(0.0, 1.0).unwrap_err(),
            RateLimitError::InvalidCapacity(0.0)
        );
        assert_eq!(
            TokenBucket::new(5.0, -1.0).unwrap_err(),
            RateLimitError::InvalidRefillRate(-1.0)
        );
        assert!(TokenBucket::new(f64::NAN, 1.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill() {
        let bucket = TokenBucket::new(5.0, 5.0).unwrap();

        for _ in 0..5 {
            assert!(bucket.acquire(1.0));
        }
        assert!(!bucket.acquire(1.0));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(bucket.acquire(1.0));

        let stats = bucket.stats();
        assert_eq!(stats.acquired, 6);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(3.0, 100.0).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!((bucket.available() - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_wait_sleeps_for_deficit() {
        let bucket = TokenBucket::new(2.0, 10.0).unwrap();
        assert!(bucket.acquire(2.0));

        let started = Instant::now();
        assert!(bucket.acquire_wait(1.0, Duration::from_secs(1)).await);
        let waited = started.elapsed();

        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_wait_times_out() {
        let bucket = TokenBucket::new(1.0, 1.0).unwrap();
        assert!(bucket.acquire(1.0));

        assert!(!bucket.acquire_wait(1.0, Duration::from_millis(50)).await);
        assert_eq!(bucket.stats().rejected, 1);
    }

    #[tokio::test]
    async fn request_above_capacity_fails_fast() {
        let bucket = TokenBucket::new(2.0, 1.0).unwrap();
        assert!(!bucket.acquire(3.0));
        assert!(!bucket.acquire_wait(3.0, Duration::from_secs(5)).await);
        assert!((bucket.available() - 2.0).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn tokens_stay_within_bounds(
            capacity in 1.0f64..100.0,
            requests in proptest::collection::vec(0.0f64..150.0, 1..50),
        ) {
            let bucket = TokenBucket::new(capacity, 1.0).unwrap();
            for n in requests {
                let before = bucket.available();
                let granted = bucket.acquire(n);
                let after = bucket.available();
                prop_assert!(after >= 0.0);
                prop_assert!(after <= capacity);
                if !granted {
                    prop_assert!(after + 1e-6 >= before);
                }
            }
        }
    }
}
