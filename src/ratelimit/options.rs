//! Limiter options and their normalization.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PacerError, Result};

/// Spacing applied between task starts when `delay_ms` is not configured.
pub const DEFAULT_DELAY_MS: u64 = 0;

/// A ceiling that is either a positive count or absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Limit {
    /// At most this many (always at least 1)
    Bounded(usize),
    /// No ceiling
    Unbounded,
}

impl Limit {
    /// Normalize a raw count: anything absent, non-finite or below 1 is unbounded.
    pub fn from_raw(raw: Option<f64>) -> Self {
        match positive_count(raw) {
            Some(n) => Limit::Bounded(n),
            None => Limit::Unbounded,
        }
    }

    /// The bound, if any.
    pub fn get(&self) -> Option<usize> {
        match self {
            Limit::Bounded(n) => Some(*n),
            Limit::Unbounded => None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Limit::Unbounded)
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::Bounded(n) => write!(f, "{}", n),
            Limit::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Which admission engine backs a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Ticket queue with an in-flight count and a sliding start log; can pause.
    Native,
    /// Fair `tokio` semaphores; cannot pause.
    Semaphore,
}

/// Limiter options as supplied by the caller or a configuration file.
///
/// Every field is optional. Use [`RateLimiterOptions::resolve`] to obtain the
/// options a limiter actually applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterOptions {
    /// Ceiling on simultaneously running tasks
    pub max_concurrent_calls: Option<f64>,

    /// Minimum spacing between scheduled task starts, in milliseconds
    pub delay_ms: Option<i64>,

    /// Ceiling on task starts within `interval_length_ms`
    pub max_calls_per_interval: Option<f64>,

    /// Length of the rolling interval, in milliseconds
    pub interval_length_ms: Option<i64>,

    /// Create the limiter with admissions paused
    pub start_paused: Option<bool>,

    /// Hold all admissions while a task serves its spacing delay
    pub pause_during_delay: Option<bool>,

    /// Back the limiter with the semaphore engine instead of the native one
    pub use_alternate_engine: Option<bool>,
}

/// Options after normalization, as applied by a [`RateLimiter`](super::RateLimiter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterOptions {
    pub max_concurrent_calls: Limit,
    pub delay: Duration,
    pub max_calls_per_interval: Limit,
    pub interval_length: Duration,
    pub start_paused: bool,
    pub pause_during_delay: bool,
    pub engine: EngineKind,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: Limit::Unbounded,
            delay: Duration::from_millis(DEFAULT_DELAY_MS),
            max_calls_per_interval: Limit::Unbounded,
            interval_length: Duration::ZERO,
            start_paused: false,
            pause_during_delay: false,
            engine: EngineKind::Native,
        }
    }
}

impl LimiterOptions {
    /// The interval ceiling as `(max starts, window length)`, if configured.
    pub fn interval_window(&self) -> Option<(usize, Duration)> {
        match self.max_calls_per_interval {
            Limit::Bounded(n) if !self.interval_length.is_zero() => Some((n, self.interval_length)),
            _ => None,
        }
    }
}

impl RateLimiterOptions {
    /// Create options with every field unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply defaults and coercions, and check the construction invariants.
    ///
    /// Fails with [`PacerError::UnpairedIntervalLimit`] when exactly one of
    /// `max_calls_per_interval` / `interval_length_ms` is a usable positive
    /// value, and with [`PacerError::PauseUnsupported`] when the semaphore
    /// engine is combined with either pause option.
    pub fn resolve(&self) -> Result<LimiterOptions> {
        let calls = positive_count(self.max_calls_per_interval);
        let interval = self.interval_length_ms.filter(|ms| *ms > 0);

        if calls.is_some() != interval.is_some() {
            return Err(PacerError::UnpairedIntervalLimit);
        }

        let start_paused = self.start_paused.unwrap_or(false);
        let pause_during_delay = self.pause_during_delay.unwrap_or(false);
        let engine = if self.use_alternate_engine.unwrap_or(false) {
            EngineKind::Semaphore
        } else {
            EngineKind::Native
        };

        if engine == EngineKind::Semaphore && (start_paused || pause_during_delay) {
            return Err(PacerError::PauseUnsupported);
        }

        Ok(LimiterOptions {
            max_concurrent_calls: Limit::from_raw(self.max_concurrent_calls),
            delay: Duration::from_millis(
                self.delay_ms.map(|ms| ms.max(0) as u64).unwrap_or(DEFAULT_DELAY_MS),
            ),
            max_calls_per_interval: calls.map(Limit::Bounded).unwrap_or(Limit::Unbounded),
            interval_length: Duration::from_millis(interval.unwrap_or(0) as u64),
            start_paused,
            pause_during_delay,
            engine,
        })
    }

    /// Fill every unset field from `base`.
    pub fn merged_over(&self, base: &RateLimiterOptions) -> RateLimiterOptions {
        RateLimiterOptions {
            max_concurrent_calls: self.max_concurrent_calls.or(base.max_concurrent_calls),
            delay_ms: self.delay_ms.or(base.delay_ms),
            max_calls_per_interval: self.max_calls_per_interval.or(base.max_calls_per_interval),
            interval_length_ms: self.interval_length_ms.or(base.interval_length_ms),
            start_paused: self.start_paused.or(base.start_paused),
            pause_during_delay: self.pause_during_delay.or(base.pause_during_delay),
            use_alternate_engine: self.use_alternate_engine.or(base.use_alternate_engine),
        }
    }
}

/// Floor a raw count; `None` unless the result is a finite value of at least 1.
fn positive_count(raw: Option<f64>) -> Option<usize> {
    raw.filter(|v| v.is_finite())
        .map(f64::floor)
        .filter(|v| *v >= 1.0)
        .map(|v| v as usize)
}
