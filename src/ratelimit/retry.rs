//! Retry policy for failed task attempts.
//!
//! A [`RetryPolicy`] is consulted after every failed attempt of a logical task.
//! It decides whether another attempt is made and how long to wait before the
//! attempt is resubmitted. The wait is in addition to whatever spacing and
//! admission wait the new attempt incurs on its own.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use pacer::ratelimit::{ExponentialBackoff, RetryPolicy};
//!
//! let policy = RetryPolicy::max_attempts(4).with_delay(
//!     ExponentialBackoff {
//!         first: Duration::from_millis(100),
//!         max: Duration::from_secs(5),
//!         factor: 2.0,
//!         jitter: false,
//!     }
//!     .into_delay_fn(),
//! );
//!
//! let err = std::io::Error::other("503");
//! assert!(policy.should_retry(1, &err));
//! assert!(!policy.should_retry(4, &err));
//! assert_eq!(policy.retry_delay(2, &err), Duration::from_millis(200));
//! ```

use rand::Rng;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// The error view handed to retry callbacks.
///
/// Callers that need their concrete transport error use `downcast_ref`.
pub type TaskError = dyn Error + Send + Sync + 'static;

/// Decides whether attempt `n` (1-based) that failed with the given error is retried.
pub type RetryPredicate = Arc<dyn Fn(u32, &TaskError) -> bool + Send + Sync>;

/// Computes the wait before the attempt after attempt `n` (1-based).
pub type RetryDelayFn = Arc<dyn Fn(u32, &TaskError) -> Duration + Send + Sync>;

/// Retry decision and backoff for failed attempts.
///
/// The default policy never retries.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    predicate: Option<RetryPredicate>,
    delay: Option<RetryDelayFn>,
}

impl RetryPolicy {
    /// A policy that surfaces the first failure immediately.
    pub fn never() -> Self {
        Self::default()
    }

    /// Retry whenever `predicate` returns `true`, without waiting in between.
    pub fn new<P>(predicate: P) -> Self
    where
        P: Fn(u32, &TaskError) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Some(Arc::new(predicate)),
            delay: None,
        }
    }

    /// Retry any error until `attempts` attempts have been made.
    pub fn max_attempts(attempts: u32) -> Self {
        Self::new(move |attempt, _| attempt < attempts)
    }

    /// Wait `delay(attempt, error)` before each retry.
    pub fn with_delay<D>(mut self, delay: D) -> Self
    where
        D: Fn(u32, &TaskError) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(delay));
        self
    }

    /// Whether a further attempt should follow the failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32, error: &TaskError) -> bool {
        self.predicate
            .as_ref()
            .map(|predicate| predicate(attempt, error))
            .unwrap_or(false)
    }

    /// Wait before resubmitting after the failed attempt `attempt`.
    ///
    /// Only meaningful once [`RetryPolicy::should_retry`] returned `true`.
    pub fn retry_delay(&self, attempt: u32, error: &TaskError) -> Duration {
        self.delay
            .as_ref()
            .map(|delay| delay(attempt, error))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether this policy can ever retry.
    pub fn is_enabled(&self) -> bool {
        self.predicate.is_some()
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .field("delay", &self.delay.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Exponential retry delay: `first * factor^(attempt - 1)`, capped at `max`.
///
/// With `jitter`, the wait is drawn uniformly from zero up to that value.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    /// Wait after the first failed attempt
    pub first: Duration,
    /// Cap on any single wait
    pub max: Duration,
    /// Growth factor per attempt
    pub factor: f64,
    /// Draw the wait uniformly from `[0, computed]`
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: false,
        }
    }
}

impl ExponentialBackoff {
    /// The wait after the failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exponent);

        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };

        if self.jitter && !base.is_zero() {
            let nanos = base.as_nanos().min(u64::MAX as u128) as u64;
            Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
        } else {
            base
        }
    }

    /// Adapt this backoff to [`RetryPolicy::with_delay`].
    pub fn into_delay_fn(self) -> impl Fn(u32, &TaskError) -> Duration + Send + Sync + 'static {
        move |attempt: u32, _: &TaskError| self.delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn error(message: &str) -> io::Error {
        io::Error::other(message.to_string())
    }

    #[test]
    fn test_default_never_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_enabled());
        for attempt in 1..5 {
            assert!(!policy.should_retry(attempt, &error("boom")));
        }
        assert_eq!(policy.retry_delay(1, &error("boom")), Duration::ZERO);
    }

    #[test]
    fn test_predicate_sees_attempt_and_error() {
        let policy = RetryPolicy::new(|attempt, err| attempt < 3 && err.to_string() == "retryable");

        assert!(policy.should_retry(1, &error("retryable")));
        assert!(policy.should_retry(2, &error("retryable")));
        assert!(!policy.should_retry(3, &error("retryable")));
        assert!(!policy.should_retry(1, &error("fatal")));
    }

    #[test]
    fn test_predicate_can_downcast() {
        #[derive(Debug, thiserror::Error)]
        #[error("status {0}")]
        struct Status(u16);

        let policy = RetryPolicy::new(|_, err| {
            err.downcast_ref::<Status>()
                .map(|status| status.0 == 429 || status.0 >= 500)
                .unwrap_or(false)
        });

        assert!(policy.should_retry(1, &Status(429)));
        assert!(policy.should_retry(1, &Status(503)));
        assert!(!policy.should_retry(1, &Status(404)));
        assert!(!policy.should_retry(1, &error("429")));
    }

    #[test]
    fn test_max_attempts() {
        let policy = RetryPolicy::max_attempts(3);
        assert!(policy.should_retry(1, &error("x")));
        assert!(policy.should_retry(2, &error("x")));
        assert!(!policy.should_retry(3, &error("x")));
    }

    #[test]
    fn test_with_delay() {
        let policy = RetryPolicy::max_attempts(5)
            .with_delay(|attempt, _| Duration::from_millis(50 * attempt as u64));
        assert_eq!(policy.retry_delay(1, &error("x")), Duration::from_millis(50));
        assert_eq!(policy.retry_delay(3, &error("x")), Duration::from_millis(150));
    }

    #[test]
    fn test_exponential_backoff_growth_and_cap() {
        let backoff = ExponentialBackoff {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_backoff_jitter_stays_in_range() {
        let backoff = ExponentialBackoff {
            jitter: true,
            ..Default::default()
        };
        for attempt in 1..10 {
            let unjittered = ExponentialBackoff {
                jitter: false,
                ..backoff
            }
            .delay(attempt);
            assert!(backoff.delay(attempt) <= unjittered);
        }
    }
}
