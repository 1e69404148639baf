//! Replay an algorithm over historical days and score its rankings.
//!
//! ```text
//!   ParamMap ──rewrite──► scratch manifest ──load──► predictor ─┐
//!                                                              ├─► combined ranking ─► hits ─► EvaluationResult
//!   partners (unchanged, weighted) ────────────────────────────┘
//! ```
//!
//! The runner owns the per-candidate scratch file and removes it when the
//! evaluation ends, whether it succeeded or not. Every day and every
//! algorithm call is preceded by a [`Checkpoint`], which is how stop, pause,
//! throttle and the time budget reach into a long evaluation.

mod metrics;
mod runner;

use std::sync::Arc;

use crate::algorithm::Predictor;
use crate::error::Interrupt;

pub use metrics::{EvaluationResult, Evaluator, HitCounts};
pub use runner::{DayOutcome, PredictorRunner, RunOutcome, ScratchModule};

/// Suspension point hook.
pub trait Checkpoint {
    /// May block (pause, throttle); `Err` asks the caller to unwind.
    fn check(&self) -> Result<(), Interrupt>;
}

impl<F> Checkpoint for F
where
    F: Fn() -> Result<(), Interrupt>,
{
    fn check(&self) -> Result<(), Interrupt> {
        self()
    }
}

/// A checkpoint that never blocks or interrupts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unchecked;

impl Checkpoint for Unchecked {
    fn check(&self) -> Result<(), Interrupt> {
        Ok(())
    }
}

/// An algorithm evaluated alongside the target, never itself rewritten.
#[derive(Clone)]
pub struct Partner {
    pub id: String,
    pub predictor: Arc<dyn Predictor>,
    pub weight: f64,
}

impl Partner {
    pub fn new(id: impl Into<String>, predictor: Arc<dyn Predictor>) -> Self {
        Self {
            id: id.into(),
            predictor,
            weight: 1.0,
        }
    }
}

impl std::fmt::Debug for Partner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partner")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}
