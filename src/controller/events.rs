//! Events a session delivers to its caller, in production order.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::signals::lock;
use crate::error::Interrupt;
use crate::search::Progress;
use crate::types::{ParamMap, ScoreTuple};

/// Longest `error` event text.
const ERROR_TEXT_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Why a session ended. Each session reports exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Completed,
    TimeLimit,
    Stopped,
    NoImprovement,
    NoParams,
    ResumeError,
    InitialTestError,
    ComboModeNoResults,
    ComboGenerationFailed,
    CriticalError,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Completed => "completed",
            FinishReason::TimeLimit => "time_limit",
            FinishReason::Stopped => "stopped",
            FinishReason::NoImprovement => "no_improvement",
            FinishReason::NoParams => "no_params",
            FinishReason::ResumeError => "resume_error",
            FinishReason::InitialTestError => "initial_test_error",
            FinishReason::ComboModeNoResults => "combo_mode_no_results",
            FinishReason::ComboGenerationFailed => "combo_generation_failed",
            FinishReason::CriticalError => "critical_error",
        }
    }

    /// The search ran and its best (if any) stands.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            FinishReason::Completed
                | FinishReason::TimeLimit
                | FinishReason::Stopped
                | FinishReason::NoImprovement
        )
    }

    /// Whether a best found before this reason is persisted.
    pub fn persists_best(self) -> bool {
        !matches!(
            self,
            FinishReason::NoParams
                | FinishReason::ResumeError
                | FinishReason::InitialTestError
                | FinishReason::CriticalError
        )
    }
}

impl From<Interrupt> for FinishReason {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Stopped => FinishReason::Stopped,
            Interrupt::TimeLimit => FinishReason::TimeLimit,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Log {
        level: LogLevel,
        text: String,
        tag: Option<String>,
    },
    Status {
        text: String,
    },
    Progress(Progress),
    BestUpdate {
        params: ParamMap,
        score_tuple: ScoreTuple,
    },
    Finished {
        message: String,
        success: bool,
        reason: FinishReason,
    },
    Error {
        text: String,
    },
}

impl SessionEvent {
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionEvent::Finished { .. })
    }
}

type Release = Box<dyn FnOnce() + Send>;

/// Sending half of a session's event queue.
///
/// Sends are best-effort: a caller that dropped its receiver just stops
/// hearing about the session. Every event is mirrored to `tracing`, and at
/// most one `finished` event is ever sent.
#[derive(Clone)]
pub(crate) struct EventSink {
    target: String,
    tx: Sender<SessionEvent>,
    finished: Arc<AtomicBool>,
    release: Arc<Mutex<Option<Release>>>,
}

impl EventSink {
    pub fn new(target: impl Into<String>, tx: Sender<SessionEvent>) -> Self {
        Self {
            target: target.into(),
            tx,
            finished: Arc::new(AtomicBool::new(false)),
            release: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `release` right before the `finished` event goes out, so a caller
    /// reacting to it sees the session's resources already freed.
    pub fn on_finish(self, release: impl FnOnce() + Send + 'static) -> Self {
        *lock(&self.release) = Some(Box::new(release));
        self
    }

    fn send(&self, event: SessionEvent) {
        if self.finished.load(Ordering::SeqCst) {
            debug!(target_algorithm = %self.target, ?event, "event after finish dropped");
            return;
        }
        let _ = self.tx.send(event);
    }

    pub fn log(&self, level: LogLevel, text: impl Into<String>, tag: Option<&str>) {
        let text = text.into();
        let algo = self.target.as_str();
        match level {
            LogLevel::Debug => debug!(target_algorithm = algo, tag, "{text}"),
            LogLevel::Info => info!(target_algorithm = algo, tag, "{text}"),
            LogLevel::Warning => warn!(target_algorithm = algo, tag, "{text}"),
            LogLevel::Error => error!(target_algorithm = algo, tag, "{text}"),
        }
        self.send(SessionEvent::Log {
            level,
            text,
            tag: tag.map(str::to_string),
        });
    }

    pub fn info(&self, text: impl Into<String>) {
        self.log(LogLevel::Info, text, None);
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.log(LogLevel::Warning, text, None);
    }

    pub fn status(&self, text: impl Into<String>) {
        let text = text.into();
        debug!(target_algorithm = %self.target, status = %text);
        self.send(SessionEvent::Status { text });
    }

    pub fn progress(&self, progress: Progress) {
        self.send(SessionEvent::Progress(progress));
    }

    pub fn best_update(&self, params: &ParamMap, score_tuple: ScoreTuple) {
        info!(target_algorithm = %self.target, %params, score = %score_tuple, "best update");
        self.send(SessionEvent::BestUpdate {
            params: params.clone(),
            score_tuple,
        });
    }

    pub fn error(&self, kind: &str, message: &str) {
        let mut text = format!("{kind}: {message}");
        if text.len() > ERROR_TEXT_LIMIT {
            let mut cut = ERROR_TEXT_LIMIT;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("...");
        }
        error!(target_algorithm = %self.target, "{text}");
        self.send(SessionEvent::Error { text });
    }

    /// Send the terminal event. Later calls are ignored.
    pub fn finish(&self, reason: FinishReason, message: impl Into<String>) {
        let message = message.into();
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let release = lock(&self.release).take();
        if let Some(release) = release {
            release();
        }
        let success = reason.is_success();
        info!(target_algorithm = %self.target, %reason, success, "{message}");
        let _ = self.tx.send(SessionEvent::Finished {
            message,
            success,
            reason,
        });
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("target", &self.target)
            .field("finished", &self.finished.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_finish_is_sent_once_and_last() {
        let (tx, rx) = mpsc::channel();
        let sink = EventSink::new("algo", tx);
        sink.info("hello");
        sink.finish(FinishReason::Stopped, "stopped by user");
        sink.finish(FinishReason::CriticalError, "late");
        sink.info("after");

        let events: Vec<SessionEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            SessionEvent::Finished {
                message: "stopped by user".into(),
                success: true,
                reason: FinishReason::Stopped,
            }
        );
    }

    #[test]
    fn test_release_runs_once_before_finished() {
        let (tx, rx) = mpsc::channel();
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let sink = EventSink::new("algo", tx).on_finish(move || {
            assert!(!flag.swap(true, Ordering::SeqCst), "released twice");
        });
        let worker = sink.clone();

        worker.finish(FinishReason::Completed, "done");
        assert!(released.load(Ordering::SeqCst));
        assert!(rx.try_recv().unwrap().is_finished());
        sink.finish(FinishReason::Stopped, "late");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_text_is_truncated() {
        let (tx, rx) = mpsc::channel();
        let sink = EventSink::new("algo", tx);
        sink.error("CriticalError", &"é".repeat(300));
        match rx.try_recv().unwrap() {
            SessionEvent::Error { text } => {
                assert!(text.starts_with("CriticalError: "));
                assert!(text.len() <= ERROR_TEXT_LIMIT + 3);
                assert!(text.ends_with("..."));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(FinishReason::ComboModeNoResults.to_string(), "combo_mode_no_results");
        assert!(FinishReason::NoImprovement.is_success());
        assert!(!FinishReason::InitialTestError.is_success());
        assert!(!FinishReason::ResumeError.persists_best());
        assert_eq!(FinishReason::from(Interrupt::TimeLimit), FinishReason::TimeLimit);
    }
}
