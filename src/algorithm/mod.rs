//! User algorithms: manifest format, scoring kernels, and the registry.
//!
//! ## The capability set
//!
//! Every algorithm the engine can run is a [`Predictor`]:
//!
//! | Operation         | Meaning                                                 |
//! |-------------------|---------------------------------------------------------|
//! | `config`          | description + declared numeric parameters              |
//! | `predict`         | per-code additive scores for a target date             |
//! | `extract_numbers` | the codes this algorithm reads out of a raw result     |
//!
//! Algorithms are written as TOML manifests that compose built-in kernels
//! ([`kernels`]) and bind kernel arguments to declared parameters. Because
//! the parameters are plain literals in the manifest, producing a variant
//! with different parameters is a structured edit of the file
//! ([`crate::rewrite`]), and loading that variant is the same code path as
//! loading the original.

pub mod kernels;
pub mod manifest;
mod predictor;
mod registry;

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::error::PredictError;
use crate::types::{Code, Draw, ParamKind, ParamMap, ParamValue, ScoreVector};

pub use manifest::{AlgorithmHeader, Manifest};
pub use predictor::ManifestPredictor;
pub use registry::{load_algorithm, module_id_for, LoadReport, LoadedAlgorithm, Registry};

/// Declared configuration of an algorithm.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmConfig {
    pub description: String,
    /// Numeric defaults in declaration order.
    pub parameters: Vec<(String, ParamValue)>,
}

impl AlgorithmConfig {
    pub fn defaults(&self) -> ParamMap {
        self.parameters.iter().map(|(k, v)| (k.as_str(), *v)).collect()
    }

    pub fn kind_of(&self, name: &str) -> Option<ParamKind> {
        self.parameters
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.kind())
    }
}

/// The contract the predictor runner sees.
pub trait Predictor: Send + Sync {
    fn config(&self) -> &AlgorithmConfig;

    /// Score every code for `target`. `history` holds only draws strictly
    /// before `target`, oldest first.
    fn predict(&self, target: NaiveDate, history: &[Draw]) -> Result<ScoreVector, PredictError>;

    fn extract_numbers(&self, raw: &Map<String, Value>) -> BTreeSet<Code>;
}

/// Registry-level description of a loaded algorithm.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmDescriptor {
    /// File stem; what sessions and artifacts refer to.
    pub id: String,
    /// Deterministic module id derived from the file name.
    pub module_id: String,
    pub display_name: String,
    pub source_path: PathBuf,
    pub class_name: String,
    pub description: String,
    pub parameters: Vec<(String, ParamValue)>,
    pub header: AlgorithmHeader,
}

impl AlgorithmDescriptor {
    /// `(class_name, filename)`: two descriptors are the same algorithm iff
    /// these match.
    pub fn identity(&self) -> (&str, String) {
        let filename = self
            .source_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        (self.class_name.as_str(), filename)
    }

    pub fn defaults(&self) -> ParamMap {
        self.parameters.iter().map(|(k, v)| (k.as_str(), *v)).collect()
    }

    pub fn kind_of(&self, name: &str) -> Option<ParamKind> {
        self.parameters
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.kind())
    }
}
