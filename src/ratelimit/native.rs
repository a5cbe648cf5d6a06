//! Native admission engine.
//!
//! Waiters take a ticket and queue in arrival order. Only the ticket at the
//! head of the queue may be admitted, and only while the engine is not paused,
//! fewer than `max_concurrent` tasks are in flight, and fewer than the interval
//! ceiling's starts are logged within the trailing window.
//!
//! Each waiter has its own [`Notify`]. A state change that can unblock the
//! queue (a released slot, a resume, an admission or cancellation that exposes
//! a new head) wakes only the current head, which re-checks. When the interval
//! ceiling is the only blocker, the head also sleeps until the oldest logged
//! start leaves the window.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{AdmissionEngine, AdmissionPermit, EngineStats};
use super::options::EngineKind;
use crate::error::Result;

/// Whether the queue head may start now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open,
    /// Blocked until something else changes
    Closed,
    /// Blocked by the interval ceiling until the given instant
    Until(Instant),
}

#[derive(Debug, Default)]
struct State {
    /// Tasks admitted and not yet released
    in_flight: usize,
    /// Start instants within the trailing interval, oldest first
    starts: VecDeque<Instant>,
    /// Waiting callers, in arrival order
    queue: VecDeque<Waiter>,
    next_ticket: u64,
    /// Paused by the caller
    paused: bool,
    /// Held while a task serves its spacing delay
    delay_hold: bool,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    wake: Arc<Notify>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    max_concurrent: Option<usize>,
    window: Option<(usize, Duration)>,
}

impl Shared {
    fn gate(&self, state: &mut State, now: Instant) -> Gate {
        if state.paused || state.delay_hold {
            return Gate::Closed;
        }

        if let Some(max) = self.max_concurrent {
            if state.in_flight >= max {
                return Gate::Closed;
            }
        }

        if let Some((max_calls, length)) = self.window {
            while let Some(oldest) = state.starts.front() {
                if *oldest + length <= now {
                    state.starts.pop_front();
                } else {
                    break;
                }
            }
            if state.starts.len() >= max_calls {
                // `max_calls` is at least 1, so the log is non-empty here
                return match state.starts.front() {
                    Some(oldest) => Gate::Until(*oldest + length),
                    None => Gate::Closed,
                };
            }
        }

        Gate::Open
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        trace!(in_flight = state.in_flight, "Released admission slot");
        wake_head(&state);
    }
}

/// Admission engine with FIFO tickets, an in-flight count and a sliding start log.
///
/// Supports pausing: while paused, nothing is admitted, running tasks continue,
/// and queued tasks keep their order.
pub struct NativeEngine {
    shared: Arc<Shared>,
}

impl NativeEngine {
    /// Create an engine.
    ///
    /// `window` is `(max starts, interval length)`; `None` disables the
    /// interval ceiling, as `max_concurrent = None` disables the concurrency one.
    pub fn new(
        max_concurrent: Option<usize>,
        window: Option<(usize, Duration)>,
        start_paused: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    paused: start_paused,
                    ..State::default()
                }),
                max_concurrent,
                window,
            }),
        }
    }

    fn set_paused(&self, paused: bool) {
        let mut state = self.shared.state.lock();
        if state.paused == paused {
            return;
        }
        state.paused = paused;
        debug!(paused, queued = state.queue.len(), "Admission pause changed");
        if !paused {
            wake_head(&state);
        }
    }
}

/// Let the queue head re-check the gate.
///
/// `notify_one` stores a permit when the head is not parked yet, so the wakeup
/// is not lost.
fn wake_head(state: &State) {
    if let Some(head) = state.queue.front() {
        head.wake.notify_one();
    }
}

/// Removes an abandoned ticket from the queue.
struct Ticket<'a> {
    shared: &'a Shared,
    id: u64,
    admitted: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let mut state = self.shared.state.lock();
        state.queue.retain(|waiter| waiter.ticket != self.id);
        trace!(ticket = self.id, "Abandoned admission ticket");
        wake_head(&state);
    }
}

/// Returned to the engine when the admitted task finishes.
struct Slot {
    shared: Arc<Shared>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.shared.release();
    }
}

#[async_trait]
impl AdmissionEngine for NativeEngine {
    async fn acquire(&self) -> AdmissionPermit {
        let shared = &*self.shared;

        let wake = Arc::new(Notify::new());
        let mut ticket = {
            let mut state = shared.state.lock();
            let id = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(Waiter {
                ticket: id,
                wake: wake.clone(),
            });
            Ticket {
                shared,
                id,
                admitted: false,
            }
        };

        loop {
            let gate = {
                let mut state = shared.state.lock();
                if state.queue.front().map(|head| head.ticket) != Some(ticket.id) {
                    Gate::Closed
                } else {
                    let now = Instant::now();
                    let gate = shared.gate(&mut state, now);
                    if gate == Gate::Open {
                        state.queue.pop_front();
                        state.in_flight += 1;
                        if shared.window.is_some() {
                            state.starts.push_back(now);
                        }
                        trace!(
                            ticket = ticket.id,
                            in_flight = state.in_flight,
                            queued = state.queue.len(),
                            "Admitted task"
                        );
                        // The next ticket is now at the head
                        wake_head(&state);
                    }
                    gate
                }
            };

            match gate {
                Gate::Open => {
                    ticket.admitted = true;
                    return AdmissionPermit::new(Slot {
                        shared: self.shared.clone(),
                    });
                }
                Gate::Closed => wake.notified().await,
                Gate::Until(deadline) => {
                    tokio::select! {
                        _ = wake.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
            }
        }
    }

    fn pause(&self) -> Result<()> {
        self.set_paused(true);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.set_paused(false);
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    fn hold_for_delay(&self, held: bool) {
        let mut state = self.shared.state.lock();
        if state.delay_hold == held {
            return;
        }
        state.delay_hold = held;
        trace!(held, "Spacing delay hold changed");
        if !held {
            wake_head(&state);
        }
    }

    fn stats(&self) -> EngineStats {
        let state = self.shared.state.lock();
        EngineStats {
            in_flight: state.in_flight,
            queued: state.queue.len(),
        }
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }
}
