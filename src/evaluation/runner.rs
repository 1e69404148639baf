//! Predictor runner: materialize a candidate and replay it day by day.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, warn};

use super::{Checkpoint, Partner};
use crate::algorithm::{load_algorithm, AlgorithmDescriptor, LoadedAlgorithm, Predictor};
use crate::error::{Error, Result};
use crate::rewrite::rewrite_source;
use crate::store::ResultStore;
use crate::types::{next_day, Code, DateRange, ParamMap, ScoreVector};

/// Cut-offs at which a day's ranking is checked against the actual draw.
pub const TOP_K: [usize; 4] = [1, 3, 5, 10];

/// Scratch file sequence, shared by every runner in the process.
static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// A rewritten candidate loaded from the scratch directory.
///
/// The scratch file is removed on drop.
pub struct ScratchModule {
    path: PathBuf,
    algorithm: Option<LoadedAlgorithm>,
}

impl ScratchModule {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn predictor(&self) -> Option<&Arc<dyn Predictor>> {
        self.algorithm.as_ref().map(|a| &a.predictor)
    }
}

impl Drop for ScratchModule {
    fn drop(&mut self) {
        self.algorithm = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to remove scratch module")
            }
        }
    }
}

/// One tested day.
#[derive(Debug, Clone, PartialEq)]
pub struct DayOutcome {
    pub date: NaiveDate,
    /// The ten best codes of the combined ranking.
    pub top10: Vec<Code>,
    pub actual: BTreeSet<Code>,
    /// Hit flags for each entry of [`TOP_K`].
    pub hits: [bool; 4],
}

/// Raw result of one replay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub days: Vec<DayOutcome>,
    /// Days with a next-day draw that could not be scored.
    pub errors: usize,
    /// Individual `predict` failures (one algorithm on one day).
    pub predict_failures: usize,
}

/// Replays candidates against the shared store.
#[derive(Debug)]
pub struct PredictorRunner {
    store: Arc<ResultStore>,
    scratch_dir: PathBuf,
}

impl PredictorRunner {
    pub fn new(store: Arc<ResultStore>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Rewrite `target` with `params`, write it under a unique scratch name
    /// and load it.
    pub fn materialize(
        &self,
        target: &AlgorithmDescriptor,
        params: &ParamMap,
    ) -> Result<ScratchModule> {
        let source = fs::read_to_string(&target.source_path)?;
        let rewritten = rewrite_source(
            &source,
            &target.class_name,
            params,
            target.source_path.parent(),
        )?;

        fs::create_dir_all(&self.scratch_dir)?;
        let n = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = self.scratch_dir.join(format!(
            "{}_{}_{n}.toml",
            target.module_id,
            std::process::id()
        ));
        fs::write(&path, rewritten)?;

        let mut module = ScratchModule {
            path,
            algorithm: None,
        };
        let loaded = load_algorithm(&module.path).map_err(|e| {
            Error::Runtime(format!("cannot load rewritten `{}`: {e}", target.id))
        })?;
        module.algorithm = Some(loaded);
        Ok(module)
    }

    /// Evaluate `target` with `params` over `range`.
    ///
    /// Only days whose next day has a draw take part. Of those, a day with no
    /// history, or on which every active algorithm failed, is an error.
    pub fn run(
        &self,
        target: &AlgorithmDescriptor,
        params: &ParamMap,
        partners: &[Partner],
        range: DateRange,
        checkpoint: &dyn Checkpoint,
    ) -> Result<RunOutcome> {
        let module = self.materialize(target, params)?;
        let predictor = module
            .predictor()
            .ok_or_else(|| Error::Runtime(format!("`{}` was not loaded", target.id)))?;

        let mut outcome = RunOutcome::default();
        for date in range.days() {
            let Some(actual) = self.store.get(next_day(date)) else {
                continue;
            };
            checkpoint.check().map_err(Error::Interrupted)?;

            let history = self.store.history_before(date);
            if history.is_empty() {
                outcome.errors += 1;
                continue;
            }

            let mut combined = ScoreVector::default();
            let mut succeeded = 0usize;
            let active = std::iter::once((target.id.as_str(), predictor, 1.0)).chain(
                partners
                    .iter()
                    .map(|p| (p.id.as_str(), &p.predictor, p.weight)),
            );
            for (id, algo, weight) in active {
                checkpoint.check().map_err(Error::Interrupted)?;
                match algo.predict(date, history) {
                    Ok(scores) => {
                        combined.accumulate(&scores, weight);
                        succeeded += 1;
                    }
                    Err(source) => {
                        let err = Error::Predict {
                            algorithm: id.to_string(),
                            source,
                        };
                        debug!(%date, error = %err, "predict failed");
                        outcome.predict_failures += 1;
                    }
                }
            }
            if succeeded == 0 {
                outcome.errors += 1;
                continue;
            }

            let ranked = combined.ranked();
            let hits = TOP_K.map(|k| ranked[..k].iter().any(|c| actual.numbers.contains(c)));
            outcome.days.push(DayOutcome {
                date,
                top10: ranked[..10].to_vec(),
                actual: actual.numbers.clone(),
                hits,
            });
        }
        Ok(outcome)
    }
}
