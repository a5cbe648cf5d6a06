//! Admission engine trait for abstracting the native and semaphore implementations.

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::native::NativeEngine;
use super::options::{EngineKind, LimiterOptions};
use super::semaphore::SemaphoreEngine;
use crate::error::Result;

/// Live occupancy of an admission engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Tasks admitted and still running
    pub in_flight: usize,
    /// Tasks waiting for admission
    pub queued: usize,
}

/// Proof of admission. The concurrency slot is released when it is dropped.
#[must_use = "dropping the permit releases the admission slot immediately"]
pub struct AdmissionPermit {
    _slot: Box<dyn Send + Sync>,
}

impl AdmissionPermit {
    pub(crate) fn new<S: Send + Sync + 'static>(slot: S) -> Self {
        Self {
            _slot: Box::new(slot),
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish_non_exhaustive()
    }
}

/// Trait for admission engine implementations.
///
/// This trait abstracts over [`NativeEngine`] and [`SemaphoreEngine`] so the
/// limiter works with either. Admission is first-in-first-out among waiting
/// callers.
#[async_trait]
pub trait AdmissionEngine: Send + Sync {
    /// Wait until every ceiling permits one more start, then claim it.
    async fn acquire(&self) -> AdmissionPermit;

    /// Stop admitting new tasks. Running tasks are unaffected.
    fn pause(&self) -> Result<()>;

    /// Resume admitting queued tasks in order.
    fn resume(&self) -> Result<()>;

    fn is_paused(&self) -> bool;

    /// Hold or release all admissions while a task serves its spacing delay.
    ///
    /// Engines that cannot pause ignore this; such configurations are rejected
    /// when options are resolved.
    fn hold_for_delay(&self, _held: bool) {}

    fn stats(&self) -> EngineStats;

    fn kind(&self) -> EngineKind;
}

impl dyn AdmissionEngine {
    /// Run `task` once it is admitted, releasing its slot when it finishes.
    pub async fn admit<F, Fut>(&self, task: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _permit = self.acquire().await;
        task().await
    }
}

/// Build the engine selected by `options`.
pub fn build_engine(options: &LimiterOptions) -> Arc<dyn AdmissionEngine> {
    debug!(
        engine = ?options.engine,
        max_concurrent_calls = %options.max_concurrent_calls,
        max_calls_per_interval = %options.max_calls_per_interval,
        interval_ms = options.interval_length.as_millis() as u64,
        "Creating admission engine"
    );

    match options.engine {
        EngineKind::Native => Arc::new(NativeEngine::new(
            options.max_concurrent_calls.get(),
            options.interval_window(),
            options.start_paused,
        )),
        EngineKind::Semaphore => Arc::new(SemaphoreEngine::new(
            options.max_concurrent_calls.get(),
            options.interval_window(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::options::RateLimiterOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn engine(raw: RateLimiterOptions) -> Arc<dyn AdmissionEngine> {
        build_engine(&raw.resolve().unwrap())
    }

    fn both(raw: RateLimiterOptions) -> [Arc<dyn AdmissionEngine>; 2] {
        [
            engine(RateLimiterOptions {
                use_alternate_engine: Some(false),
                ..raw.clone()
            }),
            engine(RateLimiterOptions {
                use_alternate_engine: Some(true),
                ..raw
            }),
        ]
    }

    #[test]
    fn test_build_engine_kind() {
        let [native, semaphore] = both(RateLimiterOptions::default());
        assert_eq!(native.kind(), EngineKind::Native);
        assert_eq!(semaphore.kind(), EngineKind::Semaphore);
    }

    #[tokio::test]
    async fn test_admit_returns_task_output() {
        for engine in both(RateLimiterOptions::default()) {
            let value = engine.admit(|| async { 42 }).await;
            assert_eq!(value, 42);
            assert_eq!(engine.stats(), EngineStats::default());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let raw = RateLimiterOptions {
            max_concurrent_calls: Some(2.0),
            ..Default::default()
        };

        for engine in both(raw) {
            let running = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let start = Instant::now();

            let tasks = (0..5).map(|_| {
                let engine = engine.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    engine
                        .admit(move || async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            });
            futures::future::join_all(tasks).await;

            assert_eq!(peak.load(Ordering::SeqCst), 2, "engine {:?}", engine.kind());
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(300));
            assert!(elapsed < Duration::from_millis(400));
            assert_eq!(engine.stats(), EngineStats::default());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_ceiling() {
        let raw = RateLimiterOptions {
            max_calls_per_interval: Some(2.0),
            interval_length_ms: Some(1000),
            ..Default::default()
        };

        for engine in both(raw) {
            let origin = Instant::now();
            let tasks = (0..5).map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.admit(move || async move { origin.elapsed() }).await })
            });

            let mut starts: Vec<_> = futures::future::join_all(tasks)
                .await
                .into_iter()
                .map(|started| started.unwrap().as_millis())
                .collect();
            starts.sort();

            assert_eq!(starts, vec![0, 0, 1000, 1000, 2000], "engine {:?}", engine.kind());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_admission_order() {
        let raw = RateLimiterOptions {
            max_concurrent_calls: Some(1.0),
            ..Default::default()
        };

        for engine in both(raw) {
            let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let mut handles = Vec::new();

            for id in 0..5 {
                let engine = engine.clone();
                let order = order.clone();
                handles.push(tokio::spawn(async move {
                    engine
                        .admit(move || async move {
                            order.lock().push(id);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        })
                        .await
                }));
                // Let each task enqueue before the next is spawned
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            futures::future::join_all(handles).await;

            assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4], "engine {:?}", engine.kind());
        }
    }

    #[tokio::test]
    async fn test_semaphore_engine_cannot_pause() {
        let [native, semaphore] = both(RateLimiterOptions::default());

        assert!(native.pause().is_ok());
        assert!(native.is_paused());
        assert!(native.resume().is_ok());
        assert!(!native.is_paused());

        assert!(semaphore.pause().is_err());
        assert!(semaphore.resume().is_err());
        assert!(!semaphore.is_paused());
    }
}
