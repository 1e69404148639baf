//! lotopt - parameter optimization for lottery prediction algorithms
//!
//! Replays user-written prediction algorithms over historical draw results,
//! scores how well their rankings hit the next day's numbers, and searches
//! their numeric parameters for better scores. Winning parameter sets are
//! written back as rewritten algorithm manifests.
//!
//! # Architecture
//!
//! ```text
//! Result Store → Registry → Source Rewriter → Predictor Runner → Evaluator
//!      ↓            ↓              ↓                 ↓              ↓
//!  draws by     manifests      toml_edit         per-day        score_tuple
//!   date       + kernels     param rewrite     top-k hits     (lexicographic)
//!
//!                  Controller ─► Search (hill-climb | combinations) ─► Artifacts
//!                      │                                                  │
//!                  event queue                                 success/ + resume state
//! ```
//!
//! Everything below the [`controller`] is synchronous and single-threaded;
//! a session runs on its own worker thread and reports through an event
//! queue.

pub mod algorithm;
pub mod artifacts;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod evaluation;
pub mod rewrite;
pub mod search;
pub mod store;
pub mod types;

pub use algorithm::{AlgorithmDescriptor, Predictor, Registry};
pub use artifacts::{ArtifactManager, ArtifactMetadata, ResumeState};
pub use config::Config;
pub use controller::{
    Controller, FinishReason, ResumeFrom, SessionConfig, SessionEvent, SessionHandle,
    SessionState,
};
pub use error::{Error, Interrupt, Result};
pub use evaluation::{EvaluationResult, Evaluator, Partner};
pub use search::{GenerationOptions, SearchMode};
pub use store::ResultStore;
pub use types::{Code, DateRange, Draw, ParamMap, ParamValue, ScoreTuple, ScoreVector};
