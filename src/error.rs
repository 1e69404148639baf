//! Error kinds for the optimization engine.
//!
//! | Kind               | Raised by         | Effect on a session                     |
//! |--------------------|-------------------|-----------------------------------------|
//! | `DataFormat`       | result store      | session cannot start                    |
//! | `Registry`         | registry / loader | isolated per file, counted              |
//! | `Rewrite`          | source rewriter   | aborts one candidate, search continues  |
//! | `Predict`          | a predictor       | isolated per algorithm per day          |
//! | `NoValidDays`      | evaluator         | `initial_test_error`                    |
//! | `ResumeValidation` | resume discovery  | `resume_error`                          |
//! | `Critical`         | session worker    | `critical_error`                        |
//!
//! `Interrupted` is not a failure: it carries the stop/time-limit signal out
//! of a suspension point so the search can unwind with its best intact.

use std::path::PathBuf;

use thiserror::Error;

use crate::rewrite::RewriteError;

/// Why a suspension point asked the worker to unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Stopped,
    TimeLimit,
}

/// Raised by a predictor's `predict`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PredictError {
    #[error("argument `{name}` must be a positive integer, got {value}")]
    InvalidArgument { name: &'static str, value: f64 },

    #[error("parameter `{0}` is not declared")]
    MissingParameter(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("data format error: {0}")]
    DataFormat(String),

    #[error("failed to load {}: {message}", path.display())]
    Registry { path: PathBuf, message: String },

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error("`{algorithm}` failed to predict: {source}")]
    Predict {
        algorithm: String,
        #[source]
        source: PredictError,
    },

    #[error("no day in {0} has both history and a next-day result")]
    NoValidDays(String),

    #[error("resume validation failed: {0}")]
    ResumeValidation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("an optimization session for `{0}` is already running")]
    SessionConflict(String),

    #[error("interrupted: {0:?}")]
    Interrupted(Interrupt),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("critical error: {0}")]
    Critical(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn registry(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Error::Registry {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Short variant name, used for the truncated `error` event text.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DataFormat(_) => "DataFormatError",
            Error::Registry { .. } => "RegistryError",
            Error::Rewrite(_) => "RewriteError",
            Error::Predict { .. } => "PredictError",
            Error::NoValidDays(_) => "NoValidDaysError",
            Error::ResumeValidation(_) => "ResumeValidationError",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::SessionConflict(_) => "SessionConflict",
            Error::Interrupted(_) => "Interrupted",
            Error::Runtime(_) => "RuntimeError",
            Error::Critical(_) => "CriticalError",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
