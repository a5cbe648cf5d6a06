//! Admission engine backed by `tokio` semaphores.
//!
//! Concurrency is bounded by a fair semaphore with one permit per slot. The
//! interval ceiling is a second fair semaphore holding `max_calls_per_interval`
//! tokens; every admission consumes a token, which is handed back one interval
//! after that start. Both semaphores queue waiters first-in-first-out.
//!
//! The engine has no pause primitive.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{error, trace};

use super::backend::{AdmissionEngine, AdmissionPermit, EngineStats};
use super::options::EngineKind;
use crate::error::{PacerError, Result};

#[derive(Debug, Default)]
struct Gauges {
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

/// Tokens for the interval ceiling.
#[derive(Debug)]
struct Reservoir {
    tokens: Arc<Semaphore>,
    interval: Duration,
}

impl Reservoir {
    fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            tokens: Arc::new(Semaphore::new(capacity)),
            interval,
        }
    }

    /// Take a token and schedule its return one interval from now.
    async fn take(&self) {
        match self.tokens.acquire().await {
            Ok(token) => token.forget(),
            // The semaphore is never closed
            Err(e) => error!(error = %e, "Interval token semaphore closed"),
        }

        // Measured from the start, not from when the return task is first polled
        let returns_at = Instant::now() + self.interval;
        let tokens: Weak<Semaphore> = Arc::downgrade(&self.tokens);
        tokio::spawn(async move {
            tokio::time::sleep_until(returns_at).await;
            if let Some(tokens) = tokens.upgrade() {
                tokens.add_permits(1);
                trace!("Returned interval token");
            }
        });
    }
}

/// Counts a caller as queued until it is admitted or gives up.
struct Waiting<'a>(&'a Gauges);

impl<'a> Waiting<'a> {
    fn enter(gauges: &'a Gauges) -> Self {
        gauges.queued.fetch_add(1, Ordering::SeqCst);
        Self(gauges)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held by an admitted task.
struct Slot {
    _permit: Option<OwnedSemaphorePermit>,
    gauges: Arc<Gauges>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.gauges.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Admission engine built on fair [`Semaphore`]s.
pub struct SemaphoreEngine {
    concurrency: Option<Arc<Semaphore>>,
    reservoir: Option<Reservoir>,
    gauges: Arc<Gauges>,
}

impl SemaphoreEngine {
    /// Create an engine.
    ///
    /// `window` is `(max starts, interval length)`; `None` disables the
    /// interval ceiling, as `max_concurrent = None` disables the concurrency one.
    pub fn new(max_concurrent: Option<usize>, window: Option<(usize, Duration)>) -> Self {
        Self {
            concurrency: max_concurrent
                .map(|max| Arc::new(Semaphore::new(max.min(Semaphore::MAX_PERMITS)))),
            reservoir: window.map(|(max_calls, interval)| {
                Reservoir::new(max_calls.min(Semaphore::MAX_PERMITS), interval)
            }),
            gauges: Arc::new(Gauges::default()),
        }
    }
}

#[async_trait]
impl AdmissionEngine for SemaphoreEngine {
    async fn acquire(&self) -> AdmissionPermit {
        let waiting = Waiting::enter(&self.gauges);

        // Concurrency first, so a consumed token always means an immediate start
        let permit = match &self.concurrency {
            Some(semaphore) => match semaphore.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    error!(error = %e, "Concurrency semaphore closed");
                    None
                }
            },
            None => None,
        };

        if let Some(reservoir) = &self.reservoir {
            reservoir.take().await;
        }

        drop(waiting);
        let in_flight = self.gauges.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(in_flight, "Admitted task");

        AdmissionPermit::new(Slot {
            _permit: permit,
            gauges: self.gauges.clone(),
        })
    }

    fn pause(&self) -> Result<()> {
        Err(PacerError::PauseUnsupported)
    }

    fn resume(&self) -> Result<()> {
        Err(PacerError::PauseUnsupported)
    }

    fn is_paused(&self) -> bool {
        false
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            in_flight: self.gauges.in_flight.load(Ordering::SeqCst),
            queued: self.gauges.queued.load(Ordering::SeqCst),
        }
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Semaphore
    }
}
