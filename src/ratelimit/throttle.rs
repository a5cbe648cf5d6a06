//! Minimum spacing between scheduled task starts.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Enforces a minimum spacing between the scheduled starts of successive tasks.
///
/// The throttle only hands out start offers; it does not serialize execution,
/// so released tasks may still run concurrently.
///
/// The next free slot is stored as a nanosecond offset from the construction
/// instant and advanced with a single compare-and-update, so concurrent callers
/// always observe strictly ordered slots.
#[derive(Debug)]
pub struct DelayThrottle {
    /// Minimum spacing between two scheduled starts
    delay: Duration,
    /// Reference point for `next_slot`
    origin: Instant,
    /// Nanoseconds after `origin` of the most recently reserved start
    next_slot: AtomicU64,
}

impl DelayThrottle {
    /// Create a throttle whose first slot is the current instant.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            origin: Instant::now(),
            next_slot: AtomicU64::new(0),
        }
    }

    /// Reserve the next start slot and return how long the caller must wait for it.
    ///
    /// A caller arriving after the previous slot plus the spacing has already
    /// passed waits nothing and becomes the new reference point.
    pub fn reserve(&self) -> Duration {
        let now = self.nanos_since_origin(Instant::now());
        let delay = duration_nanos(self.delay);

        let previous = self
            .next_slot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |slot| {
                Some(next_slot(slot, delay, now))
            })
            .unwrap_or_else(|slot| slot);

        let reserved = next_slot(previous, delay, now);
        let wait = Duration::from_nanos(reserved.saturating_sub(now));

        trace!(wait_ms = wait.as_millis() as u64, "Reserved start slot");
        wait
    }

    /// Reserve a slot, sleep until it arrives, then run `task`.
    pub async fn run_delayed<F, Fut>(&self, task: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        task().await
    }

    /// The configured spacing.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// The most recently reserved start slot.
    pub fn next_slot(&self) -> Instant {
        self.origin + Duration::from_nanos(self.next_slot.load(Ordering::Acquire))
    }

    fn nanos_since_origin(&self, instant: Instant) -> u64 {
        duration_nanos(instant.saturating_duration_since(self.origin))
    }
}

fn next_slot(previous: u64, delay: u64, now: u64) -> u64 {
    let candidate = previous.saturating_add(delay);
    if candidate <= now {
        now
    } else {
        candidate
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
