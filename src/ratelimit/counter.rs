//! Execution counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time copy of a limiter's execution counters.
///
/// All counters only ever grow for the lifetime of one limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Counters {
    /// Attempts submitted for admission; every retry is a new attempt
    pub total: u64,
    /// Attempts that reached an outcome, successful or not
    pub done: u64,
    /// Attempts whose outcome was an error
    pub failed: u64,
    /// Attempts made because an earlier attempt of the same task was retried
    pub retries: u64,
}

impl Counters {
    /// Attempts that succeeded.
    pub fn succeeded(&self) -> u64 {
        self.done.saturating_sub(self.failed)
    }

    /// Attempts submitted that have not reached an outcome yet.
    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.done)
    }
}

/// Live counters shared by every task of one limiter.
///
/// Updates are lock-free; readers may take a snapshot at any time.
#[derive(Debug, Default)]
pub struct CounterSet {
    total: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

impl CounterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    /// Record an attempt outcome.
    pub fn record_done(&self, failed: bool) {
        // `failed` is bumped first so a snapshot never shows more successes than happened
        if failed {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.done.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    /// Take a snapshot of the current values.
    pub fn snapshot(&self) -> Counters {
        Counters {
            total: self.total.load(Ordering::SeqCst),
            done: self.done.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
        }
    }
}
