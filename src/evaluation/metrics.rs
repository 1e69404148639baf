//! Evaluation metrics over a replay.
//!
//! ## Metrics Overview
//!
//! | Metric                  | What it measures                                  |
//! |-------------------------|---------------------------------------------------|
//! | hits@k                  | days where the top-k intersected the actual draw  |
//! | acc@k                   | hits@k / days_tested, in percent                  |
//! | avg_top10_repetition    | top-10 entries / distinct top-10 codes            |
//! | max_top10_repetition    | appearances of the most frequent top-10 code      |
//!
//! The repetition metrics punish predictors that return the same top-10 day
//! after day: a constant predictor over `n` days has an average of `n`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::runner::RunOutcome;
use super::{Checkpoint, Partner, PredictorRunner};
use crate::algorithm::AlgorithmDescriptor;
use crate::error::{Error, Result};
use crate::types::{Code, DateRange, ParamMap, ScoreTuple};

/// Number of codes reported in `most_common_top10`.
const MOST_COMMON: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitCounts {
    pub top1: usize,
    pub top3: usize,
    pub top5: usize,
    pub top10: usize,
}

/// Aggregated result of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub days_tested: usize,
    pub errors: usize,
    pub predict_failures: usize,
    pub hits: HitCounts,
    pub acc1: f64,
    pub acc3: f64,
    pub acc5: f64,
    pub acc10: f64,
    pub avg_top10_repetition: f64,
    pub max_top10_repetition: usize,
    /// Most frequent top-10 codes with their counts, most frequent first.
    pub most_common_top10: Vec<(Code, usize)>,
    pub score_tuple: ScoreTuple,
    #[serde(rename = "duration_seconds", with = "duration_secs")]
    pub duration: Duration,
}

impl EvaluationResult {
    /// Aggregate a replay. `None` when no day was tested.
    pub fn from_outcome(outcome: &RunOutcome, duration: Duration) -> Option<Self> {
        let days = outcome.days.len();
        if days == 0 {
            return None;
        }

        let mut hits = HitCounts::default();
        let mut counts: BTreeMap<Code, usize> = BTreeMap::new();
        for day in &outcome.days {
            hits.top1 += usize::from(day.hits[0]);
            hits.top3 += usize::from(day.hits[1]);
            hits.top5 += usize::from(day.hits[2]);
            hits.top10 += usize::from(day.hits[3]);
            for code in &day.top10 {
                *counts.entry(*code).or_default() += 1;
            }
        }

        let pct = |n: usize| n as f64 / days as f64 * 100.0;
        let total: usize = counts.values().sum();
        let avg_rep = total as f64 / counts.len().max(1) as f64;

        let mut most_common: Vec<(Code, usize)> = counts.into_iter().collect();
        // Stable sort keeps ascending code order among equal counts
        most_common.sort_by(|a, b| b.1.cmp(&a.1));
        let max_rep = most_common.first().map(|(_, n)| *n).unwrap_or(0);
        most_common.truncate(MOST_COMMON);

        let (acc1, acc3, acc5, acc10) = (
            pct(hits.top1),
            pct(hits.top3),
            pct(hits.top5),
            pct(hits.top10),
        );
        Some(Self {
            days_tested: days,
            errors: outcome.errors,
            predict_failures: outcome.predict_failures,
            hits,
            acc1,
            acc3,
            acc5,
            acc10,
            avg_top10_repetition: avg_rep,
            max_top10_repetition: max_rep,
            most_common_top10: most_common,
            score_tuple: ScoreTuple::new(acc3, acc5, acc1, avg_rep),
            duration,
        })
    }
}

/// Runner plus aggregation.
#[derive(Debug)]
pub struct Evaluator {
    runner: PredictorRunner,
}

impl Evaluator {
    pub fn new(runner: PredictorRunner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &PredictorRunner {
        &self.runner
    }

    /// Evaluate one parameter map. Fails with `NoValidDays` if nothing could
    /// be scored.
    pub fn evaluate(
        &self,
        target: &AlgorithmDescriptor,
        params: &ParamMap,
        partners: &[Partner],
        range: DateRange,
        checkpoint: &dyn Checkpoint,
    ) -> Result<EvaluationResult> {
        let started = Instant::now();
        let outcome = self.runner.run(target, params, partners, range, checkpoint)?;
        let result = EvaluationResult::from_outcome(&outcome, started.elapsed()).ok_or_else(|| {
            Error::NoValidDays(format!(
                "{range} ({} errors, {} predict failures)",
                outcome.errors, outcome.predict_failures
            ))
        })?;
        debug!(
            target = %target.id,
            params = %params,
            days = result.days_tested,
            score = %result.score_tuple,
            "evaluated"
        );
        Ok(result)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs.max(0.0)).map_err(serde::de::Error::custom)
    }
}
