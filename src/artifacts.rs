//! Artifact manager: winning manifests, their metadata, and resume state.
//!
//! ## Layout
//!
//! ```text
//! <optimize_dir>/<stem>/
//!   optimization_state_<stem>.json          hill-climb resume state
//!   success/
//!     opt_<stem>_top3_37.5_20240314093012.toml     rewritten manifest
//!     opt_<stem>_top3_37.5_20240314093012.json     metadata
//!     combo_<stem>_top3_41.2_20240314101500_1.toml second write in the same second
//! ```
//!
//! The manifest is written before its JSON, so any listed artifact has its
//! source beside it. The `success/` directory of an algorithm has a single
//! writer: the controller refuses overlapping sessions on the same target.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::algorithm::AlgorithmDescriptor;
use crate::error::{Error, Result};
use crate::evaluation::EvaluationResult;
use crate::rewrite::{extract_parameters, rewrite_source};
use crate::search::SearchMode;
use crate::types::{DateRange, ParamMap, ParamValue, ScoreTuple};

const SUCCESS_DIR: &str = "success";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Metadata JSON written next to every artifact manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub mode: SearchMode,
    pub target: String,
    pub params: ParamMap,
    pub performance: EvaluationResult,
    pub score_tuple: ScoreTuple,
    pub combination_algorithms: Vec<String>,
    pub range: DateRange,
    pub duration_seconds: f64,
    pub finish_reason: Option<String>,
    pub timestamp: DateTime<Local>,
}

/// Persisted hill-climb progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub target_algorithm: String,
    pub params: ParamMap,
    pub score_tuple: ScoreTuple,
    pub combination_algorithms: Vec<String>,
    pub optimization_range: DateRange,
    pub save_reason: String,
    pub save_timestamp: DateTime<Local>,
}

/// Paths of one written artifact pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub source: PathBuf,
    pub metadata: PathBuf,
}

/// An artifact found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactEntry {
    pub paths: ArtifactPaths,
    pub metadata: ArtifactMetadata,
}

/// A validated starting point for a resumed hill-climb.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub params: ParamMap,
    pub score_tuple: ScoreTuple,
    pub saved_at: DateTime<Local>,
    /// Artifact JSON or state file it came from.
    pub origin: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactManager {
    root: PathBuf,
}

impl ArtifactManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn algorithm_dir(&self, stem: &str) -> PathBuf {
        self.root.join(stem)
    }

    pub fn success_dir(&self, stem: &str) -> PathBuf {
        self.algorithm_dir(stem).join(SUCCESS_DIR)
    }

    pub fn state_path(&self, stem: &str) -> PathBuf {
        self.algorithm_dir(stem)
            .join(format!("optimization_state_{stem}.json"))
    }

    /// Write the rewritten manifest and its metadata.
    ///
    /// The manifest is checked to round-trip to `metadata.params` before
    /// anything is written.
    pub fn write(
        &self,
        target: &AlgorithmDescriptor,
        metadata: &ArtifactMetadata,
    ) -> Result<ArtifactPaths> {
        let source = fs::read_to_string(&target.source_path)?;
        let rewritten = rewrite_source(
            &source,
            &target.class_name,
            &metadata.params,
            target.source_path.parent(),
        )?;
        let written: ParamMap = extract_parameters(&rewritten)?.into_iter().collect();
        for (name, value) in metadata.params.iter() {
            let declared = written.get(name).map(ParamValue::kind);
            if declared.and_then(|k| value.coerce(k)) != written.get(name) {
                return Err(Error::Runtime(format!(
                    "artifact for `{}` does not round-trip parameter `{name}`",
                    target.id
                )));
            }
        }

        let dir = self.success_dir(&target.id);
        fs::create_dir_all(&dir)?;
        let base = format!(
            "{}_{}_top3_{:.1}_{}",
            metadata.mode.prefix(),
            target.id,
            metadata.score_tuple.acc3(),
            metadata.timestamp.format(TIMESTAMP_FORMAT)
        );
        let paths = free_paths(&dir, &base);

        fs::write(&paths.source, rewritten)?;
        fs::write(&paths.metadata, serde_json::to_string_pretty(metadata)?)?;
        info!(
            artifact = %paths.metadata.display(),
            score = %metadata.score_tuple,
            "wrote artifact"
        );
        Ok(paths)
    }

    /// Artifacts of `stem`, best first (newest first among equal scores).
    /// Files that do not parse are skipped.
    pub fn list(&self, stem: &str) -> Result<Vec<ArtifactEntry>> {
        let dir = self.success_dir(stem);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let family = stem_family(stem)?;

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !family.is_match(name) {
                continue;
            }
            let metadata = match read_json::<ArtifactMetadata>(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable artifact");
                    continue;
                }
            };
            entries.push(ArtifactEntry {
                paths: ArtifactPaths {
                    source: path.with_extension("toml"),
                    metadata: path,
                },
                metadata,
            });
        }

        entries.sort_by(|a, b| {
            b.metadata
                .score_tuple
                .cmp_lex(&a.metadata.score_tuple)
                .then(b.metadata.timestamp.cmp(&a.metadata.timestamp))
                .then(b.paths.metadata.cmp(&a.paths.metadata))
        });
        Ok(entries)
    }

    /// Delete every artifact of `stem` strictly worse than `best`. Returns
    /// the deleted paths. A second call with the same `best` deletes nothing.
    pub fn prune(&self, stem: &str, best: &ScoreTuple) -> Result<Vec<PathBuf>> {
        let mut deleted = Vec::new();
        for entry in self.list(stem)? {
            if !best.beats(&entry.metadata.score_tuple) {
                continue;
            }
            for path in [entry.paths.source, entry.paths.metadata] {
                match fs::remove_file(&path) {
                    Ok(()) => deleted.push(path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if !deleted.is_empty() {
            info!(stem, deleted = deleted.len(), "pruned inferior artifacts");
        }
        Ok(deleted)
    }

    /// Record the session outcome in an already written artifact.
    pub fn finalize(
        &self,
        paths: &ArtifactPaths,
        reason: &str,
        duration_seconds: f64,
    ) -> Result<()> {
        let mut value: serde_json::Value = read_json(&paths.metadata)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("finish_reason".into(), reason.into());
            obj.insert("duration_seconds".into(), duration_seconds.into());
        }
        fs::write(&paths.metadata, serde_json::to_string_pretty(&value)?)?;
        debug!(artifact = %paths.metadata.display(), reason, "finalized artifact");
        Ok(())
    }

    pub fn write_state(&self, state: &ResumeState) -> Result<PathBuf> {
        let path = self.state_path(&state.target_algorithm);
        fs::create_dir_all(self.algorithm_dir(&state.target_algorithm))?;
        fs::write(&path, serde_json::to_string_pretty(state)?)?;
        debug!(path = %path.display(), reason = %state.save_reason, "saved resume state");
        Ok(path)
    }

    pub fn read_state(&self, stem: &str) -> Result<Option<ResumeState>> {
        let path = self.state_path(stem);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// The most recent state file or artifact of `target` that was saved for
    /// the same range and partners and whose parameters fit the target.
    pub fn latest_resume_candidate(
        &self,
        target: &AlgorithmDescriptor,
        range: DateRange,
        partners: &[String],
    ) -> Option<ResumePoint> {
        let mut candidates = Vec::new();

        match self.read_state(&target.id) {
            Ok(Some(state)) => {
                let origin = self.state_path(&target.id);
                match Saved::from(&state).validate(target, range, partners, origin) {
                    Ok(point) => candidates.push(point),
                    Err(e) => debug!(error = %e, "ignoring resume state"),
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "unreadable resume state"),
        }

        match self.list(&target.id) {
            Ok(entries) => {
                for entry in entries {
                    let origin = entry.paths.metadata.clone();
                    match Saved::from(&entry.metadata).validate(target, range, partners, origin) {
                        Ok(point) => candidates.push(point),
                        Err(e) => debug!(error = %e, "ignoring artifact for resume"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "cannot list artifacts"),
        }

        candidates.into_iter().max_by(|a, b| a.saved_at.cmp(&b.saved_at))
    }

    /// Load an explicit artifact JSON or state file as a resume point.
    pub fn load_resume_point(
        &self,
        path: &Path,
        target: &AlgorithmDescriptor,
        range: DateRange,
        partners: &[String],
    ) -> Result<ResumePoint> {
        let origin = path.to_path_buf();
        if let Ok(state) = read_json::<ResumeState>(path) {
            return Saved::from(&state).validate(target, range, partners, origin);
        }
        let metadata: ArtifactMetadata = read_json(path)?;
        Saved::from(&metadata).validate(target, range, partners, origin)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// `dir/base.{toml,json}`, or `dir/base_N.{toml,json}` with the smallest
/// `N` that is free.
fn free_paths(dir: &Path, base: &str) -> ArtifactPaths {
    let make = |name: &str| ArtifactPaths {
        source: dir.join(format!("{name}.toml")),
        metadata: dir.join(format!("{name}.json")),
    };
    let taken = |p: &ArtifactPaths| p.source.exists() || p.metadata.exists();

    let mut paths = make(base);
    let mut n = 1;
    while taken(&paths) {
        paths = make(&format!("{base}_{n}"));
        n += 1;
    }
    paths
}

/// Matches metadata files of `stem` written by either mode.
fn stem_family(stem: &str) -> Result<Regex> {
    let pattern = format!(
        r"^(?:opt|combo)_{}_top3_\d+\.\d_\d{{14}}(?:_\d+)?\.json$",
        regex::escape(stem)
    );
    Regex::new(&pattern).map_err(|e| Error::Runtime(format!("artifact pattern for `{stem}`: {e}")))
}

fn same_partners(a: &[String], b: &[String]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// Every key declared and of a compatible kind, and at least one key.
fn check_params(
    params: &ParamMap,
    target: &AlgorithmDescriptor,
) -> std::result::Result<ParamMap, String> {
    if params.is_empty() {
        return Err("no parameters".into());
    }
    let mut checked = ParamMap::new();
    for (name, value) in params.iter() {
        let kind = target
            .kind_of(name)
            .ok_or_else(|| format!("`{name}` is not a parameter of `{}`", target.id))?;
        let value = value
            .coerce(kind)
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("`{name}` = {value} does not fit a {kind:?} parameter"))?;
        checked.insert(name, value);
    }
    Ok(checked)
}

/// What a state file or an artifact recorded about a saved point.
struct Saved<'a> {
    target: &'a str,
    params: &'a ParamMap,
    score_tuple: ScoreTuple,
    range: DateRange,
    partners: &'a [String],
    saved_at: DateTime<Local>,
}

impl<'a> From<&'a ResumeState> for Saved<'a> {
    fn from(state: &'a ResumeState) -> Self {
        Self {
            target: &state.target_algorithm,
            params: &state.params,
            score_tuple: state.score_tuple,
            range: state.optimization_range,
            partners: &state.combination_algorithms,
            saved_at: state.save_timestamp,
        }
    }
}

impl<'a> From<&'a ArtifactMetadata> for Saved<'a> {
    fn from(meta: &'a ArtifactMetadata) -> Self {
        Self {
            target: &meta.target,
            params: &meta.params,
            score_tuple: meta.score_tuple,
            range: meta.range,
            partners: &meta.combination_algorithms,
            saved_at: meta.timestamp,
        }
    }
}

impl Saved<'_> {
    fn validate(
        &self,
        target: &AlgorithmDescriptor,
        range: DateRange,
        partners: &[String],
        origin: PathBuf,
    ) -> Result<ResumePoint> {
        let reject =
            |reason: String| Error::ResumeValidation(format!("{}: {reason}", origin.display()));
        if self.target != target.id {
            return Err(reject(format!("saved for `{}`", self.target)));
        }
        if self.range != range {
            return Err(reject(format!("saved for range {}", self.range)));
        }
        if !same_partners(self.partners, partners) {
            return Err(reject(format!("saved with partners {:?}", self.partners)));
        }
        if !self.score_tuple.is_finite() {
            return Err(reject("non-finite score".into()));
        }
        let params = check_params(self.params, target).map_err(reject)?;
        Ok(ResumePoint {
            params,
            score_tuple: self.score_tuple,
            saved_at: self.saved_at,
            origin,
        })
    }
}
