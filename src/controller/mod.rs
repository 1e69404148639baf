//! Session controller: validation, the worker thread, and its handle.
//!
//! ```text
//!   caller ──start(SessionConfig)──► Controller ──spawn──► worker (Session)
//!     │                                                     │
//!     ├── pause / resume / stop ──► SessionSignals ◄── check() at every
//!     │                                                suspension point
//!     └── events() ◄──────────── mpsc queue ◄────────── EventSink
//! ```
//!
//! A session runs on its own thread and talks back only through its event
//! queue. The controller refuses to start a second session on an algorithm
//! that already has one running, which keeps each `success/` directory
//! single-writer.

mod events;
mod session;
mod signals;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::algorithm::Registry;
use crate::artifacts::ArtifactManager;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::evaluation::{Evaluator, Partner, PredictorRunner};
use crate::search::{GenerationOptions, SearchMode};
use crate::store::ResultStore;
use crate::types::DateRange;

pub use events::{FinishReason, LogLevel, SessionEvent};
pub use signals::{SessionSignals, SessionState};

use events::EventSink;
use session::{EngineOptions, Session};
use signals::lock;

/// Where a resumed hill-climb starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Most recent matching state file or artifact.
    Latest,
    /// An explicit artifact JSON or state file.
    Path(PathBuf),
}

impl FromStr for ResumeFrom {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" => Err("empty resume source".into()),
            "latest" => Ok(ResumeFrom::Latest),
            path => Ok(ResumeFrom::Path(PathBuf::from(path))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target: String,
    pub range: DateRange,
    pub time_budget: Duration,
    pub mode: SearchMode,
    /// Hill-climb only: explicit step magnitudes per parameter. Each step is
    /// tried in both directions, so its sign is ignored.
    pub custom_steps: BTreeMap<String, Vec<f64>>,
    /// Combinations only.
    pub generation: GenerationOptions,
    /// Algorithms evaluated alongside the target with weight 1.0.
    pub partners: Vec<String>,
    pub delete_inferior: bool,
    pub resume_from: Option<ResumeFrom>,
}

impl SessionConfig {
    pub fn new(target: impl Into<String>, range: DateRange, time_budget: Duration) -> Self {
        Self {
            target: target.into(),
            range,
            time_budget,
            mode: SearchMode::HillClimb,
            custom_steps: BTreeMap::new(),
            generation: GenerationOptions::default(),
            partners: Vec::new(),
            delete_inferior: false,
            resume_from: None,
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Removes a target from the active set when its worker ends.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    target: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.target);
    }
}

pub struct Controller {
    config: Config,
    store: Arc<ResultStore>,
    registry: Arc<Registry>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Controller {
    pub fn new(config: Config, store: Arc<ResultStore>, registry: Arc<Registry>) -> Self {
        Self {
            config,
            store,
            registry,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn artifacts(&self) -> ArtifactManager {
        ArtifactManager::new(&self.config.optimize_dir)
    }

    /// Whether a session on `target` is running.
    pub fn is_active(&self, target: &str) -> bool {
        lock(&self.active).contains(target)
    }

    /// An evaluator with its own scratch directory under the configured one.
    pub fn evaluator(&self, scratch_name: &str) -> Evaluator {
        let scratch = self.config.scratch_dir.join(scratch_name);
        Evaluator::new(PredictorRunner::new(Arc::clone(&self.store), scratch))
    }

    /// Resolve partner ids to predictors, all with weight 1.0.
    pub fn partners(&self, target: &str, ids: &[String]) -> Result<Vec<Partner>> {
        let mut seen = HashSet::new();
        ids.iter()
            .map(|id| {
                if id == target {
                    return Err(Error::InvalidConfig(format!(
                        "`{id}` cannot be its own partner"
                    )));
                }
                if !seen.insert(id.as_str()) {
                    return Err(Error::InvalidConfig(format!("partner `{id}` listed twice")));
                }
                let predictor = self
                    .registry
                    .instance(id)
                    .ok_or_else(|| Error::InvalidConfig(format!("unknown partner `{id}`")))?;
                Ok(Partner::new(id.clone(), predictor))
            })
            .collect()
    }

    fn validate(&self, settings: &SessionConfig) -> Result<()> {
        let (Some(first), Some(last)) = (self.store.first_date(), self.store.last_date()) else {
            return Err(Error::InvalidConfig("the result store is empty".into()));
        };
        let range = settings.range;
        if range.start < first {
            return Err(Error::InvalidConfig(format!(
                "range starts {} before the first result {first}",
                range.start
            )));
        }
        if range.end >= last {
            return Err(Error::InvalidConfig(format!(
                "range must end before the last result {last} so the final day can be scored"
            )));
        }
        if settings.time_budget.is_zero() {
            return Err(Error::InvalidConfig("time budget must be positive".into()));
        }

        let target = self
            .registry
            .descriptor(&settings.target)
            .ok_or_else(|| unknown_algorithm(&settings.target))?;

        match settings.mode {
            SearchMode::HillClimb => {
                for (name, steps) in &settings.custom_steps {
                    if target.kind_of(name).is_none() {
                        return Err(Error::InvalidConfig(format!(
                            "custom steps for undeclared parameter `{name}`"
                        )));
                    }
                    if steps.is_empty() || steps.iter().any(|s| !s.is_finite() || *s == 0.0) {
                        return Err(Error::InvalidConfig(format!(
                            "steps for `{name}` must be non-zero numbers"
                        )));
                    }
                }
            }
            SearchMode::Combinations => {
                let generation = settings.generation;
                if generation.values_per_param == 0 || generation.max_combinations == 0 {
                    return Err(Error::InvalidConfig(
                        "values_per_param and max_combinations must be at least 1".into(),
                    ));
                }
                if settings.resume_from.is_some() {
                    return Err(Error::InvalidConfig(
                        "combination sessions cannot be resumed".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validate `settings` and start a session worker.
    pub fn start(&self, mut settings: SessionConfig) -> Result<SessionHandle> {
        self.validate(&settings)?;
        let target = self
            .registry
            .descriptor(&settings.target)
            .cloned()
            .ok_or_else(|| unknown_algorithm(&settings.target))?;
        let partners = self.partners(&target.id, &settings.partners)?;
        for steps in settings.custom_steps.values_mut() {
            for step in steps.iter_mut() {
                *step = step.abs();
            }
            steps.sort_by(f64::total_cmp);
            steps.dedup();
        }

        if !lock(&self.active).insert(target.id.clone()) {
            return Err(Error::SessionConflict(target.id));
        }
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            target: target.id.clone(),
        };

        let scratch = self.config.scratch_dir.join(&target.id);
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
            debug!(path = %scratch.display(), "cleared scratch directory");
        }

        let signals = Arc::new(SessionSignals::new(
            settings.time_budget,
            Duration::from_millis(self.config.throttle_ms),
        ));
        let (tx, rx) = mpsc::channel();
        let released_signals = Arc::clone(&signals);
        let sink = EventSink::new(target.id.clone(), tx).on_finish(move || {
            remove_scratch(&scratch);
            released_signals.mark_terminated();
            drop(guard);
        });
        let session = Session {
            evaluator: self.evaluator(&target.id),
            artifacts: self.artifacts(),
            signals: Arc::clone(&signals),
            sink: sink.clone(),
            options: EngineOptions {
                max_cycles: self.config.max_cycles,
                stall_threshold: self.config.stall_threshold,
                float_epsilon: self.config.float_epsilon,
                combo_warn_threshold: self.config.combo_warn_threshold,
            },
            settings,
            target,
            partners,
        };

        info!(
            target_algorithm = %session.target.id,
            mode = %session.settings.mode,
            range = %session.settings.range,
            budget_secs = session.settings.time_budget.as_secs_f64(),
            "starting session"
        );
        let id = session.target.id.clone();
        signals.mark_running();
        let worker_signals = Arc::clone(&signals);
        let worker = thread::Builder::new()
            .name(format!("lotopt-{id}"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| session.run()));
                if let Err(payload) = result {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "worker panicked".to_string());
                    let err = Error::Critical(message.clone());
                    sink.error(err.kind(), &message);
                    sink.finish(FinishReason::CriticalError, err.to_string());
                }
                // Releases the target even if no `finished` was ever sent
                drop(session);
                drop(sink);
                worker_signals.mark_terminated();
            })?;

        Ok(SessionHandle {
            target: id,
            signals,
            events: rx,
            worker: Some(worker),
        })
    }
}

fn unknown_algorithm(id: &str) -> Error {
    Error::InvalidConfig(format!("unknown algorithm `{id}`"))
}

fn remove_scratch(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %dir.display(), error = %e, "scratch cleanup failed");
        }
    }
}

/// Caller side of a running session.
pub struct SessionHandle {
    target: String,
    signals: Arc<SessionSignals>,
    events: Receiver<SessionEvent>,
    worker: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.signals.state()
    }

    pub fn pause(&self) -> bool {
        self.signals.pause()
    }

    pub fn resume(&self) -> bool {
        self.signals.resume()
    }

    pub fn stop(&self) {
        self.signals.stop();
    }

    /// The session's event queue, in production order.
    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the worker and return every event not yet received.
    pub fn wait(mut self) -> Vec<SessionEvent> {
        if let Some(worker) = self.worker.take() {
            // Worker panics are caught inside the thread
            let _ = worker.join();
        }
        self.events.try_iter().collect()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.worker.as_ref().is_some_and(|w| !w.is_finished()) {
            self.signals.stop();
        }
    }
}
