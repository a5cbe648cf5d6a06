//! Pacer - Admission Control and Throttling Scheduler
//!
//! This crate paces calls against rate-limited external services. A
//! [`RateLimiter`] bounds the number of simultaneously running tasks, the
//! number of task starts within a rolling interval, and the spacing between
//! consecutive starts, and re-submits failed tasks according to a
//! [`RetryPolicy`].

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{PacerError, Result};
pub use ratelimit::{
    Counters, EngineKind, EngineStats, Limit, LimiterOptions, RateLimiter, RateLimiterOptions,
    RetryPolicy,
};
