//! Stop/pause flags, the session state machine, and the time budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::Interrupt;
use crate::evaluation::Checkpoint;

/// How often a paused worker re-checks its flags.
const PAUSE_POLL: Duration = Duration::from_millis(20);

/// ```text
/// Idle → Running → (Paused ↔ Running) → Terminated
///                  ↑ stop: Terminating, from any live state
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Terminating,
    Terminated,
}

/// Shared between a [`super::SessionHandle`] and its worker.
#[derive(Debug)]
pub struct SessionSignals {
    stop: AtomicBool,
    pause: AtomicBool,
    state: Mutex<SessionState>,
    started: Instant,
    budget: Duration,
    throttle: Duration,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionSignals {
    pub fn new(budget: Duration, throttle: Duration) -> Self {
        Self {
            stop: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            state: Mutex::new(SessionState::Idle),
            started: Instant::now(),
            budget,
            throttle,
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Elapsed share of the time budget, clamped to `0..=1`.
    pub fn budget_fraction(&self) -> f64 {
        if self.budget.is_zero() {
            return 1.0;
        }
        (self.elapsed().as_secs_f64() / self.budget.as_secs_f64()).clamp(0.0, 1.0)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_running(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Idle {
            *state = SessionState::Running;
        }
    }

    pub(crate) fn mark_terminated(&self) {
        *lock(&self.state) = SessionState::Terminated;
    }

    /// `Running → Paused`. Returns whether the transition happened.
    pub fn pause(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != SessionState::Running {
            return false;
        }
        self.pause.store(true, Ordering::SeqCst);
        *state = SessionState::Paused;
        true
    }

    /// `Paused → Running`. Returns whether the transition happened.
    pub fn resume(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != SessionState::Paused {
            return false;
        }
        self.pause.store(false, Ordering::SeqCst);
        *state = SessionState::Running;
        true
    }

    /// Ask the worker to stop at its next suspension point.
    pub fn stop(&self) {
        let mut state = lock(&self.state);
        self.stop.store(true, Ordering::SeqCst);
        if !matches!(*state, SessionState::Terminated) {
            *state = SessionState::Terminating;
        }
    }
}

impl Checkpoint for SessionSignals {
    /// Blocks while paused; then stop, the budget, and the throttle, in that
    /// order.
    fn check(&self) -> Result<(), Interrupt> {
        while self.pause.load(Ordering::SeqCst) && !self.is_stop_requested() {
            thread::sleep(PAUSE_POLL);
        }
        if self.is_stop_requested() {
            return Err(Interrupt::Stopped);
        }
        if self.elapsed() >= self.budget {
            return Err(Interrupt::TimeLimit);
        }
        if !self.throttle.is_zero() {
            thread::sleep(self.throttle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_transitions() {
        let signals = SessionSignals::new(Duration::from_secs(60), Duration::ZERO);
        assert!(!signals.pause(), "cannot pause before running");
        signals.mark_running();
        assert_eq!(signals.state(), SessionState::Running);
        assert!(signals.pause());
        assert!(!signals.pause());
        assert_eq!(signals.state(), SessionState::Paused);
        assert!(signals.resume());
        assert_eq!(signals.state(), SessionState::Running);
        signals.stop();
        assert_eq!(signals.state(), SessionState::Terminating);
        assert_eq!(signals.check(), Err(Interrupt::Stopped));
        signals.mark_terminated();
        signals.stop();
        assert_eq!(signals.state(), SessionState::Terminated);
    }

    #[test]
    fn test_budget_elapses() {
        let signals = SessionSignals::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(signals.check(), Err(Interrupt::TimeLimit));
        assert_eq!(signals.budget_fraction(), 1.0);
    }

    #[test]
    fn test_stop_releases_a_paused_checkpoint() {
        let signals = Arc::new(SessionSignals::new(Duration::from_secs(60), Duration::ZERO));
        signals.mark_running();
        signals.pause();

        let worker = {
            let signals = Arc::clone(&signals);
            thread::spawn(move || signals.check())
        };
        thread::sleep(Duration::from_millis(60));
        assert!(!worker.is_finished(), "checkpoint should block while paused");
        signals.stop();
        assert_eq!(worker.join().unwrap(), Err(Interrupt::Stopped));
    }
}
