//! Authoritative phase tracker for a builder session.
//!
//! Transitions only move forward along [`Phase`] order; `Error` is always
//! accepted. A rejected transition is fatal: the machine moves to `Error`
//! and reports a [`StateError::Regression`].
//!
//! Every successful transition is pushed onto a bounded event ring that
//! the supervisor drains with [`StateMachine::next_event`]. Pushing never
//! blocks: when the ring is full the oldest event is dropped.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::errors::StateError;
use crate::phase::Phase;

/// Events retained before the oldest is dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 16;

#[derive(Debug)]
struct Inner {
    phase: Phase,
    events: VecDeque<Phase>,
    max_events: usize,
}

impl Inner {
    fn push_event(&mut self, phase: Phase) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(phase);
    }

    /// Apply `next`, or fall into `Error` if it would not move forward.
    fn transition(&mut self, next: Phase) -> Result<(), StateError> {
        let current = self.phase;
        if current.can_advance_to(next) {
            self.phase = next;
            self.push_event(next);
            info!(from = %current, to = %next, "phase transition");
            Ok(())
        } else {
            self.phase = Phase::Error;
            self.push_event(Phase::Error);
            warn!(from = %current, to = %next, "rejected phase regression");
            Err(StateError::Regression {
                from: current,
                to: next,
            })
        }
    }
}

#[derive(Debug)]
pub struct StateMachine {
    inner: Mutex<Inner>,
    events_ready: Notify,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// A fresh machine in `Claim`.
    pub fn new() -> Self {
        Self::starting_at(Phase::Claim)
    }

    /// A machine already sitting in `phase`. No event is emitted for it.
    pub fn starting_at(phase: Phase) -> Self {
        Self::with_capacity(phase, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(phase: Phase, max_events: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase,
                events: VecDeque::with_capacity(max_events),
                max_events: max_events.max(1),
            }),
            events_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current phase.
    pub fn get(&self) -> Phase {
        self.lock().phase
    }

    /// Move to `next`. On a non-forward transition the machine moves to
    /// `Error` instead and the regression is returned.
    pub fn set(&self, next: Phase) -> Result<(), StateError> {
        let result = self.lock().transition(next);
        self.events_ready.notify_one();
        result
    }

    /// Check that the machine is in `expected` without changing anything.
    pub fn guard(&self, expected: Phase) -> Result<(), StateError> {
        let current = self.get();
        if current == expected {
            Ok(())
        } else {
            Err(StateError::WrongPhase { expected, current })
        }
    }

    /// Atomic guard-then-set. Returns `WrongPhase` without side effects if
    /// the machine is not in `expected`, so concurrent callers racing for
    /// the same transition advance it at most once.
    pub fn advance(&self, expected: Phase, next: Phase) -> Result<(), StateError> {
        let result = {
            let mut inner = self.lock();
            if inner.phase != expected {
                return Err(StateError::WrongPhase {
                    expected,
                    current: inner.phase,
                });
            }
            inner.transition(next)
        };
        self.events_ready.notify_one();
        result
    }

    /// Pop the oldest pending transition event, if any.
    pub fn try_next_event(&self) -> Option<Phase> {
        self.lock().events.pop_front()
    }

    /// Wait for the next transition event. Intended for a single consumer.
    pub async fn next_event(&self) -> Phase {
        loop {
            let notified = self.events_ready.notified();
            if let Some(phase) = self.try_next_event() {
                return phase;
            }
            notified.await;
        }
    }
}
