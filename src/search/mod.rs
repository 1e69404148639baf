//! Parameter search over an objective.
//!
//! ## Search Strategies
//!
//! | Strategy       | When to use                                             |
//! |----------------|---------------------------------------------------------|
//! | HillClimb      | Refine around a known-good point, resumable             |
//! | Combinations   | Small parameter count, want exhaustive local coverage  |
//!
//! Both strategies are generic over the [`Objective`] (anything that turns a
//! [`ParamMap`] into a [`Scored`] report) and report through a
//! [`SearchObserver`]. An objective error of `Error::Interrupted` ends the
//! search with the best intact; any other error only discards that candidate.

mod combinations;
mod hill_climb;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Interrupt, Result};
use crate::types::{ParamKind, ParamMap, ParamValue, ScoreTuple};

pub use combinations::{
    combination_values, CombinationGrid, CombinationSearch, GenerationOptions,
};
pub use hill_climb::{auto_step, HillClimb, HillClimbOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    HillClimb,
    #[serde(rename = "generated_combinations")]
    Combinations,
}

impl SearchMode {
    /// Artifact filename prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            SearchMode::HillClimb => "opt",
            SearchMode::Combinations => "combo",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::HillClimb => "hill_climb",
            SearchMode::Combinations => "generated_combinations",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "hill_climb" | "auto" => Ok(SearchMode::HillClimb),
            "generated_combinations" | "combinations" | "combo" => Ok(SearchMode::Combinations),
            _ => Err(format!("unknown search mode {s:?}")),
        }
    }
}

/// Anything with a `score_tuple`.
pub trait Scored {
    fn score_tuple(&self) -> ScoreTuple;
}

impl Scored for ScoreTuple {
    fn score_tuple(&self) -> ScoreTuple {
        *self
    }
}

impl Scored for crate::evaluation::EvaluationResult {
    fn score_tuple(&self) -> ScoreTuple {
        self.score_tuple
    }
}

/// What the search maximizes.
pub trait Objective {
    type Report: Scored + Clone;

    fn evaluate(&mut self, params: &ParamMap) -> Result<Self::Report>;
}

impl<F, S> Objective for F
where
    F: FnMut(&ParamMap) -> Result<S>,
    S: Scored + Clone,
{
    type Report = S;

    fn evaluate(&mut self, params: &ParamMap) -> Result<S> {
        self(params)
    }
}

/// Current best point and the report that scored it.
#[derive(Debug, Clone, PartialEq)]
pub struct Best<S> {
    pub params: ParamMap,
    pub report: S,
}

impl<S: Scored> Best<S> {
    pub fn new(params: ParamMap, report: S) -> Self {
        Self { params, report }
    }

    pub fn score(&self) -> ScoreTuple {
        self.report.score_tuple()
    }
}

/// Progress of a running search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    Count { current: usize, total: usize },
    Fraction(f64),
}

/// Hooks the search calls back into. All have no-op defaults.
pub trait SearchObserver<S> {
    /// After every full evaluation. `total` is known for enumerations only.
    /// `Err` ends the search.
    fn after_evaluation(
        &mut self,
        _done: usize,
        _total: Option<usize>,
    ) -> std::result::Result<(), Interrupt> {
        Ok(())
    }

    /// A strictly better point was adopted.
    fn improved(&mut self, _best: &Best<S>) {}

    /// Informational message for the caller's log.
    fn note(&mut self, _text: &str) {}

    /// Something the caller should see as a warning.
    fn warn(&mut self, _text: &str) {}
}

/// An observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl<S> SearchObserver<S> for Silent {}

/// How a search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEnd {
    /// Every cycle (or every combination) ran.
    Completed,
    /// A full hill-climb cycle accepted no move.
    NoImprovement,
    Interrupted(Interrupt),
    /// Every combination failed to evaluate.
    NoResults,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome<S> {
    pub best: Option<Best<S>>,
    /// Number of improvements adopted during the search.
    pub improvements: usize,
    pub evaluations: usize,
    pub end: SearchEnd,
}

/// Evaluate one candidate and fold it into `best`.
///
/// `Ok(true)` when the candidate became the new best. An interrupt from the
/// objective or the observer comes back as `Err`.
fn try_candidate<O, W>(
    objective: &mut O,
    observer: &mut W,
    best: &mut Option<Best<O::Report>>,
    params: ParamMap,
) -> std::result::Result<bool, Interrupt>
where
    O: Objective,
    W: SearchObserver<O::Report>,
{
    let adopted = match objective.evaluate(&params) {
        Ok(report) => {
            let score = report.score_tuple();
            let better = score.is_finite()
                && best.as_ref().map_or(true, |b| score.beats(&b.score()));
            if better {
                let new_best = Best::new(params, report);
                observer.improved(&new_best);
                *best = Some(new_best);
            }
            better
        }
        Err(Error::Interrupted(interrupt)) => return Err(interrupt),
        Err(e) => {
            observer.warn(&format!("candidate {params} failed: {e}"));
            false
        }
    };
    Ok(adopted)
}

/// A step usable on a parameter of `kind`; `None` for a fractional step on
/// an integer.
fn coerce_step(kind: ParamKind, step: f64) -> Option<f64> {
    match kind {
        ParamKind::Integer => ParamValue::Float(step)
            .coerce(ParamKind::Integer)
            .map(ParamValue::as_f64),
        ParamKind::Real => step.is_finite().then_some(step),
    }
}
