//! The search worker: one session from first evaluation to `finished`.

use std::sync::Arc;

use chrono::Local;

use super::events::{EventSink, FinishReason};
use super::signals::SessionSignals;
use super::{ResumeFrom, SessionConfig};
use crate::algorithm::AlgorithmDescriptor;
use crate::artifacts::{ArtifactManager, ArtifactMetadata, ArtifactPaths, ResumePoint, ResumeState};
use crate::error::{Error, Interrupt, Result};
use crate::evaluation::{Checkpoint, EvaluationResult, Evaluator, Partner};
use crate::search::{
    Best, CombinationGrid, CombinationSearch, HillClimb, HillClimbOptions, Progress,
    SearchEnd, SearchMode, SearchObserver, SearchOutcome,
};
use crate::types::ParamMap;

/// Saved and fresh scores closer than this are the same score.
const SCORE_TOLERANCE: f64 = 1e-9;

/// Engine knobs taken from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub(crate) struct EngineOptions {
    pub max_cycles: usize,
    pub stall_threshold: usize,
    pub float_epsilon: f64,
    pub combo_warn_threshold: u64,
}

pub(crate) struct Session {
    pub settings: SessionConfig,
    pub target: AlgorithmDescriptor,
    pub partners: Vec<Partner>,
    pub evaluator: Evaluator,
    pub artifacts: ArtifactManager,
    pub signals: Arc<SessionSignals>,
    pub sink: EventSink,
    pub options: EngineOptions,
}

impl Session {
    pub fn run(&self) {
        self.sink.status(format!(
            "optimizing {} over {} ({})",
            self.target.id, self.settings.range, self.settings.mode
        ));
        if self.target.parameters.is_empty() {
            self.sink.finish(
                FinishReason::NoParams,
                format!("`{}` declares no numeric parameters", self.target.id),
            );
            return;
        }
        match self.settings.mode {
            SearchMode::HillClimb => self.hill_climb(),
            SearchMode::Combinations => self.combinations(),
        }
    }

    fn evaluate(&self, params: &ParamMap) -> Result<EvaluationResult> {
        self.evaluator.evaluate(
            &self.target,
            params,
            &self.partners,
            self.settings.range,
            self.signals.as_ref(),
        )
    }

    fn observer(&self) -> Recorder<'_> {
        Recorder {
            session: self,
            last_artifact: None,
        }
    }

    fn resume_point(&self) -> Result<Option<ResumePoint>> {
        let partners = &self.settings.partners;
        let range = self.settings.range;
        match &self.settings.resume_from {
            None => Ok(None),
            Some(ResumeFrom::Latest) => {
                let point = self
                    .artifacts
                    .latest_resume_candidate(&self.target, range, partners);
                if point.is_none() {
                    self.sink
                        .info("no saved point matches this session; starting from defaults");
                }
                Ok(point)
            }
            Some(ResumeFrom::Path(path)) => self
                .artifacts
                .load_resume_point(path, &self.target, range, partners)
                .map(Some),
        }
    }

    fn hill_climb(&self) {
        let resume = match self.resume_point() {
            Ok(point) => point,
            Err(e) => {
                self.sink.finish(FinishReason::ResumeError, e.to_string());
                return;
            }
        };
        let mut start = self.target.defaults();
        if let Some(point) = &resume {
            self.sink.info(format!(
                "resuming from {} saved {}",
                point.origin.display(),
                point.saved_at.format("%Y-%m-%d %H:%M:%S")
            ));
            start = start.merged(&point.params);
        }

        let report = match self.evaluate(&start) {
            Ok(report) => report,
            Err(Error::Interrupted(interrupt)) => {
                self.sink.finish(
                    interrupt.into(),
                    "interrupted before the starting point was scored",
                );
                return;
            }
            Err(e) => {
                let reason = if resume.is_some() {
                    FinishReason::ResumeError
                } else {
                    FinishReason::InitialTestError
                };
                self.sink.log(
                    super::LogLevel::Error,
                    format!("starting point {start} failed ({}): {e}", e.kind()),
                    Some("initial_test"),
                );
                self.sink.finish(reason, e.to_string());
                return;
            }
        };
        if let Some(point) = &resume {
            if !point.score_tuple.approx_eq(&report.score_tuple, SCORE_TOLERANCE) {
                self.sink.warn(format!(
                    "resumed point re-scored {} (saved {}); continuing from the fresh score",
                    report.score_tuple, point.score_tuple
                ));
            }
        }

        let start = Best::new(start, report);
        self.sink.best_update(&start.params, start.score());

        let mut recorder = self.observer();
        let first = recorder.after_evaluation(1, None);
        let outcome = match first {
            Ok(()) => {
                let options = HillClimbOptions {
                    max_cycles: self.options.max_cycles,
                    stall_threshold: self.options.stall_threshold,
                    float_epsilon: self.options.float_epsilon,
                    custom_steps: self.settings.custom_steps.clone(),
                };
                let mut objective = |params: &ParamMap| self.evaluate(params);
                HillClimb::new(&self.target.parameters, options).run(
                    &mut objective,
                    &mut recorder,
                    start,
                )
            }
            Err(interrupt) => SearchOutcome {
                best: Some(start),
                improvements: 0,
                evaluations: 1,
                end: SearchEnd::Interrupted(interrupt),
            },
        };
        recorder.conclude(outcome);
    }

    fn combinations(&self) {
        let grid = match CombinationGrid::new(
            &self.target.parameters,
            self.settings.generation,
            self.options.float_epsilon,
        ) {
            Ok(grid) => grid,
            Err(message) => {
                self.sink.finish(FinishReason::ComboGenerationFailed, message);
                return;
            }
        };
        if grid.raw_count() > self.options.combo_warn_threshold {
            self.sink.warn(format!(
                "{} raw combinations; only the first {} are evaluated",
                grid.raw_count(),
                grid.len()
            ));
        }
        self.sink.info(format!("evaluating {} combinations", grid.len()));

        let mut recorder = self.observer();
        let mut objective = |params: &ParamMap| self.evaluate(params);
        let outcome = CombinationSearch::new(grid).run(&mut objective, &mut recorder);
        recorder.conclude(outcome);
    }

    fn metadata(&self, params: &ParamMap, report: &EvaluationResult) -> ArtifactMetadata {
        ArtifactMetadata {
            mode: self.settings.mode,
            target: self.target.id.clone(),
            params: params.clone(),
            performance: report.clone(),
            score_tuple: report.score_tuple,
            combination_algorithms: self.settings.partners.clone(),
            range: self.settings.range,
            duration_seconds: self.signals.elapsed().as_secs_f64(),
            finish_reason: None,
            timestamp: Local::now(),
        }
    }

    fn save_state(&self, best: &Best<EvaluationResult>, reason: &str) {
        if self.settings.mode != SearchMode::HillClimb {
            return;
        }
        let state = ResumeState {
            target_algorithm: self.target.id.clone(),
            params: best.params.clone(),
            score_tuple: best.score(),
            combination_algorithms: self.settings.partners.clone(),
            optimization_range: self.settings.range,
            save_reason: reason.to_string(),
            save_timestamp: Local::now(),
        };
        if let Err(e) = self.artifacts.write_state(&state) {
            self.sink.warn(format!("could not save resume state: {e}"));
        }
    }
}

/// Observer that turns search callbacks into artifacts and events.
struct Recorder<'a> {
    session: &'a Session,
    last_artifact: Option<ArtifactPaths>,
}

impl Recorder<'_> {
    fn conclude(mut self, outcome: SearchOutcome<EvaluationResult>) {
        let session = self.session;
        let reason = match outcome.end {
            SearchEnd::Completed => FinishReason::Completed,
            SearchEnd::NoImprovement => FinishReason::NoImprovement,
            SearchEnd::Interrupted(interrupt) => interrupt.into(),
            SearchEnd::NoResults => FinishReason::ComboModeNoResults,
        };
        let elapsed = session.signals.elapsed().as_secs_f64();

        if let Some(paths) = self.last_artifact.take() {
            if let Err(e) = session.artifacts.finalize(&paths, reason.as_str(), elapsed) {
                session.sink.warn(format!("could not finalize artifact: {e}"));
            }
        }
        let message = match &outcome.best {
            Some(best) => {
                if reason.persists_best() {
                    session.save_state(best, reason.as_str());
                }
                format!(
                    "{reason} after {} evaluations ({} improvements): best {} {}",
                    outcome.evaluations,
                    outcome.improvements,
                    best.params,
                    best.score()
                )
            }
            None => format!(
                "{reason} after {} evaluations: no combination could be scored",
                outcome.evaluations
            ),
        };
        session.sink.finish(reason, message);
    }
}

impl SearchObserver<EvaluationResult> for Recorder<'_> {
    fn after_evaluation(
        &mut self,
        done: usize,
        total: Option<usize>,
    ) -> std::result::Result<(), Interrupt> {
        let session = self.session;
        let progress = match total {
            Some(total) => Progress::Count {
                current: done,
                total,
            },
            None => Progress::Fraction(session.signals.budget_fraction()),
        };
        session.sink.progress(progress);
        session.signals.check()
    }

    fn improved(&mut self, best: &Best<EvaluationResult>) {
        let session = self.session;
        let metadata = session.metadata(&best.params, &best.report);
        match session.artifacts.write(&session.target, &metadata) {
            Ok(paths) => {
                if session.settings.delete_inferior {
                    match session.artifacts.prune(&session.target.id, &best.score()) {
                        Ok(deleted) if !deleted.is_empty() => session
                            .sink
                            .info(format!("deleted {} inferior artifact files", deleted.len())),
                        Ok(_) => {}
                        Err(e) => session.sink.warn(format!("pruning failed: {e}")),
                    }
                }
                self.last_artifact = Some(paths);
            }
            Err(e) => session.sink.warn(format!("could not write artifact: {e}")),
        }
        session.save_state(best, "improvement");
        session.sink.best_update(&best.params, best.score());
    }

    fn note(&mut self, text: &str) {
        self.session.sink.info(text);
    }

    fn warn(&mut self, text: &str) {
        self.session.sink.warn(text);
    }
}
