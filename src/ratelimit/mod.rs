//! Rate limiting logic and admission state.

mod backend;
mod counter;
mod limiter;
mod native;
mod options;
mod retry;
mod semaphore;
mod throttle;

pub use backend::{build_engine, AdmissionEngine, AdmissionPermit, EngineStats};
pub use counter::{CounterSet, Counters};
pub use limiter::RateLimiter;
pub use native::NativeEngine;
pub use options::{EngineKind, Limit, LimiterOptions, RateLimiterOptions, DEFAULT_DELAY_MS};
pub use retry::{ExponentialBackoff, RetryDelayFn, RetryPolicy, RetryPredicate, TaskError};
pub use semaphore::SemaphoreEngine;
pub use throttle::DelayThrottle;
