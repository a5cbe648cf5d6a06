//! Rate limiter facade.

use futures::future::BoxFuture;
use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::backend::{build_engine, AdmissionEngine, EngineStats};
use super::counter::{CounterSet, Counters};
use super::options::{LimiterOptions, RateLimiterOptions};
use super::retry::RetryPolicy;
use super::throttle::DelayThrottle;
use crate::error::Result;

/// Paces tasks against a rate-limited service.
///
/// Every attempt of a submitted task waits for its spacing slot, then for
/// admission by the engine, then runs. A failed attempt is resubmitted while
/// the [`RetryPolicy`] allows it; the final outcome is returned to the caller
/// unchanged.
///
/// This struct is cheap to clone; clones share the same limits and counters.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    options: LimiterOptions,
    throttle: DelayThrottle,
    retry: RetryPolicy,
    engine: Arc<dyn AdmissionEngine>,
    counters: CounterSet,
    next_task_id: AtomicU64,
}

impl RateLimiter {
    /// Create a rate limiter that never retries.
    pub fn new(options: RateLimiterOptions) -> Result<Self> {
        Self::with_retry(options, RetryPolicy::never())
    }

    /// Create a rate limiter with a retry policy.
    ///
    /// Fails without producing a limiter when the options violate the interval
    /// pairing rule or combine the semaphore engine with pausing.
    pub fn with_retry(options: RateLimiterOptions, retry: RetryPolicy) -> Result<Self> {
        let options = options.resolve()?;
        let engine = build_engine(&options);

        debug!(
            delay_ms = options.delay.as_millis() as u64,
            start_paused = options.start_paused,
            pause_during_delay = options.pause_during_delay,
            retry = retry.is_enabled(),
            "Rate limiter initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                throttle: DelayThrottle::new(options.delay),
                options,
                retry,
                engine,
                counters: CounterSet::new(),
                next_task_id: AtomicU64::new(0),
            }),
        })
    }

    /// The options as applied, after defaults and coercions.
    pub fn options(&self) -> &LimiterOptions {
        &self.inner.options
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// A snapshot of the execution counters.
    pub fn counters(&self) -> Counters {
        self.inner.counters.snapshot()
    }

    /// Tasks currently running and waiting for admission.
    pub fn stats(&self) -> EngineStats {
        self.inner.engine.stats()
    }

    /// Stop admitting tasks. Fails on the semaphore engine.
    pub fn pause(&self) -> Result<()> {
        self.inner.engine.pause()
    }

    /// Resume admitting tasks. Fails on the semaphore engine.
    pub fn resume(&self) -> Result<()> {
        self.inner.engine.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.engine.is_paused()
    }

    /// Run `task` through spacing, admission and retries, returning its final outcome.
    ///
    /// `task` is called once per attempt. Counters are updated before the
    /// outcome is returned.
    pub async fn add<F, Fut, T, E>(&self, mut task: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Error + Send + Sync + 'static,
    {
        let inner = &*self.inner;
        let task_id = inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let mut attempt: u32 = 1;

        loop {
            inner.counters.record_submitted();
            self.wait_for_slot(task_id, attempt).await;

            let outcome = inner.engine.admit(&mut task).await;

            let error = match outcome {
                Ok(value) => {
                    inner.counters.record_done(false);
                    trace!(task_id, attempt, "Task succeeded");
                    return Ok(value);
                }
                Err(error) => {
                    inner.counters.record_done(true);
                    error
                }
            };

            if !inner.retry.should_retry(attempt, &error) {
                if attempt > 1 {
                    warn!(task_id, attempts = attempt, error = %error, "Task failed after retries");
                } else {
                    debug!(task_id, error = %error, "Task failed");
                }
                return Err(error);
            }

            inner.counters.record_retry();
            let backoff = inner.retry.retry_delay(attempt, &error);
            debug!(
                task_id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retrying task"
            );
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// [`RateLimiter::add`] for each task, in input order.
    ///
    /// The returned futures correspond one-to-one to `tasks`. Driving them
    /// together (for example with `futures::future::join_all`) reserves their
    /// spacing slots in index order.
    pub fn add_all<'a, I, F, Fut, T, E>(
        &'a self,
        tasks: I,
    ) -> Vec<impl Future<Output = std::result::Result<T, E>> + 'a>
    where
        I: IntoIterator<Item = F>,
        F: FnMut() -> Fut + 'a,
        Fut: Future<Output = std::result::Result<T, E>> + 'a,
        T: 'a,
        E: Error + Send + Sync + 'static,
    {
        tasks.into_iter().map(|task| self.add(task)).collect()
    }

    /// Wrap `f` so every call goes through [`RateLimiter::add`].
    ///
    /// Functions of several arguments take them as a tuple. The argument is
    /// cloned for every attempt.
    pub fn wrap<A, F, Fut, T, E>(
        &self,
        f: F,
    ) -> impl Fn(A) -> BoxFuture<'static, std::result::Result<T, E>> + Clone + Send + Sync
    where
        A: Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
    {
        let limiter = self.clone();
        let f = Arc::new(f);

        move |args: A| -> BoxFuture<'static, std::result::Result<T, E>> {
            let limiter = limiter.clone();
            let f = f.clone();
            Box::pin(async move { limiter.add(move || (*f)(args.clone())).await })
        }
    }

    /// [`RateLimiter::wrap`] for each function, in input order.
    pub fn wrap_all<I, A, F, Fut, T, E>(
        &self,
        fs: I,
    ) -> Vec<impl Fn(A) -> BoxFuture<'static, std::result::Result<T, E>> + Clone + Send + Sync>
    where
        I: IntoIterator<Item = F>,
        A: Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
    {
        fs.into_iter().map(|f| self.wrap(f)).collect()
    }

    /// Wait for this attempt's spacing slot, holding admissions meanwhile if configured.
    ///
    /// The hold is a single flag shared by all waiting attempts. When several
    /// spacing waits overlap, the first one to end clears it, so admissions
    /// resume while later waits are still sleeping.
    async fn wait_for_slot(&self, task_id: u64, attempt: u32) {
        let inner = &*self.inner;
        let wait = inner.throttle.reserve();
        trace!(task_id, attempt, wait_ms = wait.as_millis() as u64, "Waiting for start slot");

        if wait.is_zero() {
            return;
        }

        let _hold = inner
            .options
            .pause_during_delay
            .then(|| DelayHold::raise(&*inner.engine));
        tokio::time::sleep(wait).await;
    }
}

/// Holds admissions for the lifetime of a spacing wait, including a cancelled one.
struct DelayHold<'a>(&'a dyn AdmissionEngine);

impl<'a> DelayHold<'a> {
    fn raise(engine: &'a dyn AdmissionEngine) -> Self {
        engine.hold_for_delay(true);
        Self(engine)
    }
}

impl Drop for DelayHold<'_> {
    fn drop(&mut self) {
        self.0.hold_for_delay(false);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("options", &self.inner.options)
            .field("counters", &self.counters())
            .field("stats", &self.stats())
            .finish()
    }
}
