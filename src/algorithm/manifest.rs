//! Algorithm manifest parsing.
//!
//! A manifest is a TOML document with an `[algorithm]` table, a `[config]`
//! table holding `description` and `parameters`, an optional `[extract]`
//! table, and one or more `[[signals]]`. Optional metadata lives in leading
//! comment lines:
//!
//! ```text
//! # ID: 482913
//! # Date: 14/03/2024
//! # Version: 1.2.0
//! ```
//!
//! `extends` names a base manifest (relative to the file) whose signals and
//! skip-fields are prepended. Bases may extend further bases.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use super::kernels::Signal;
use crate::error::{Error, Result};
use crate::rewrite;
use crate::types::ParamValue;

const MAX_EXTENDS_DEPTH: usize = 8;

static HEADER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#\s*(ID|Date|Version)\s*:\s*(.*?)\s*$").expect("valid regex"));
static HEADER_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{6}$").expect("valid regex"));
static HEADER_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+){0,3}$").expect("valid regex"));

/// Machine-readable metadata from the manifest's leading comments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlgorithmHeader {
    pub id: Option<String>,
    pub date: Option<NaiveDate>,
    pub version: Option<String>,
}

impl AlgorithmHeader {
    /// Parse the comment block at the top of `text`. Stops at the first line
    /// that is neither blank nor a comment.
    pub fn parse(text: &str, path: &Path) -> Self {
        let mut header = Self::default();
        for line in text.lines().map(str::trim) {
            if line.is_empty() {
                continue;
            }
            if !line.starts_with('#') {
                break;
            }
            let Some(caps) = HEADER_LINE.captures(line) else {
                continue;
            };
            let value = &caps[2];
            match &caps[1] {
                "ID" if HEADER_ID.is_match(value) => header.id = Some(value.to_string()),
                "Date" => match NaiveDate::parse_from_str(value, "%d/%m/%Y") {
                    Ok(date) => header.date = Some(date),
                    Err(_) => {
                        warn!(path = %path.display(), value, "ignoring malformed header date")
                    }
                },
                "Version" if HEADER_VERSION.is_match(value) => {
                    header.version = Some(value.to_string())
                }
                field => {
                    warn!(path = %path.display(), field, value, "ignoring malformed header value")
                }
            }
        }
        header
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.date.is_none() && self.version.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    algorithm: Option<AlgorithmSection>,
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    extract: ExtractSection,
    #[serde(default)]
    signals: Vec<Signal>,
}

#[derive(Debug, Deserialize)]
struct AlgorithmSection {
    class: Option<String>,
    name: Option<String>,
    extends: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigSection {
    #[serde(default)]
    description: String,
    parameters: Option<toml::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ExtractSection {
    #[serde(default)]
    skip_fields: Vec<String>,
}

/// A parsed and validated manifest, with its bases folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub path: PathBuf,
    pub header: AlgorithmHeader,
    pub class_name: String,
    pub display_name: String,
    pub description: String,
    pub parameters: Vec<(String, ParamValue)>,
    pub skip_fields: Vec<String>,
    /// Base signals first, then this file's own.
    pub signals: Vec<Signal>,
    pub extends: Option<PathBuf>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::registry(path, e))?;
        Self::parse(&text, path)
    }

    /// Parse manifest text. `path` locates relative bases and labels errors.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let file: ManifestFile = toml::from_str(text).map_err(|e| Error::registry(path, e))?;

        let algorithm = file
            .algorithm
            .ok_or_else(|| Error::registry(path, "missing [algorithm] table"))?;
        let class_name = algorithm
            .class
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::registry(path, "missing [algorithm] class"))?;

        let parameters = match file.config.parameters {
            None => Vec::new(),
            Some(_) => rewrite::extract_parameters(text).map_err(|e| Error::registry(path, e))?,
        };

        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let extends = algorithm.extends.map(|p| resolve_relative(dir, p));

        let (mut signals, mut skip_fields) = match &extends {
            Some(base) => load_base(base, 1)?,
            None => (Vec::new(), Vec::new()),
        };
        signals.extend(file.signals);
        for field in file.extract.skip_fields {
            if !skip_fields.contains(&field) {
                skip_fields.push(field);
            }
        }

        if signals.is_empty() {
            return Err(Error::registry(path, "no [[signals]] defined"));
        }
        for (idx, signal) in signals.iter().enumerate() {
            for name in signal.args().into_iter().filter_map(|a| a.param_name()) {
                if !parameters.iter().any(|(k, _)| k == name) {
                    return Err(Error::registry(
                        path,
                        format!(
                            "signal #{idx} ({}) references undeclared parameter `{name}`",
                            signal.kind()
                        ),
                    ));
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            header: AlgorithmHeader::parse(text, path),
            display_name: algorithm.name.unwrap_or_else(|| class_name.clone()),
            class_name,
            description: file.config.description,
            parameters,
            skip_fields,
            signals,
            extends,
        })
    }
}

fn resolve_relative(dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        dir.join(path)
    }
}

/// Signals and skip-fields contributed by a base manifest and its own bases.
fn load_base(path: &Path, depth: usize) -> Result<(Vec<Signal>, Vec<String>)> {
    if depth > MAX_EXTENDS_DEPTH {
        return Err(Error::registry(path, "`extends` chain too deep (cycle?)"));
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::registry(path, format!("cannot read base manifest: {e}")))?;
    let file: ManifestFile = toml::from_str(&text).map_err(|e| Error::registry(path, e))?;

    let (mut signals, mut skip_fields) = match file.algorithm.and_then(|a| a.extends) {
        Some(next) => {
            let dir = path.parent().unwrap_or_else(|| Path::new(""));
            load_base(&resolve_relative(dir, next), depth + 1)?
        }
        None => (Vec::new(), Vec::new()),
    };
    signals.extend(file.signals);
    skip_fields.extend(file.extract.skip_fields);
    Ok((signals, skip_fields))
}
