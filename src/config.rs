//! Configuration loading from lotopt.toml and pyproject.toml.
//!
//! Follows the ruff/black convention of a tool table so the optimizer can
//! live next to other project tooling:
//! - `[tool.lotopt]` section in pyproject.toml
//! - Standalone lotopt.toml as the preferred form
//!
//! ## Example
//!
//! ```toml
//! data-file = "data/results.json"
//! algorithms-dir = "algorithms"
//! optimize-dir = "optimize"
//! exclude = ["base.toml", "_*", "experimental_*"]
//! throttle-ms = 5
//! max-cycles = 5
//! stall-threshold = 2
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Algorithm files never treated as algorithms: the shared base manifest and
/// package-init style files.
pub const DEFAULT_EXCLUDES: &[&str] = &["base.toml", "_*"];

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source file for this config (for display).
    pub source: Option<PathBuf>,

    /// Historical results file.
    pub data_file: PathBuf,

    /// Directory scanned for algorithm manifests.
    pub algorithms_dir: PathBuf,

    /// Root of the per-algorithm `success/` directories and resume state.
    pub optimize_dir: PathBuf,

    /// Scratch space for rewritten candidate manifests.
    pub scratch_dir: PathBuf,

    /// Glob patterns (matched against file names) excluded from discovery.
    pub exclude: Vec<String>,

    /// Sleep at each suspension point; 0 disables throttling.
    pub throttle_ms: u64,

    /// Hill-climb outer cycles.
    pub max_cycles: usize,

    /// Consecutive non-improving probes that end one hill-climb direction.
    pub stall_threshold: usize,

    /// Raw combination count above which the caller is warned.
    pub combo_warn_threshold: u64,

    /// Combination cap used when the session does not set one.
    pub default_max_combinations: usize,

    /// Smallest automatic step for real-valued parameters.
    pub float_epsilon: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: None,
            data_file: PathBuf::from("data/results.json"),
            algorithms_dir: PathBuf::from("algorithms"),
            optimize_dir: PathBuf::from("optimize"),
            scratch_dir: PathBuf::from(".lotopt-scratch"),
            exclude: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            throttle_ms: 0,
            max_cycles: 5,
            stall_threshold: 2,
            combo_warn_threshold: 100_000,
            default_max_combinations: 1_000,
            float_epsilon: 0.001,
        }
    }
}

/// Raw config as deserialized from TOML.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    data_file: Option<PathBuf>,
    algorithms_dir: Option<PathBuf>,
    optimize_dir: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    exclude: Option<Vec<String>>,
    extend_exclude: Option<Vec<String>>,
    throttle_ms: Option<u64>,
    max_cycles: Option<usize>,
    stall_threshold: Option<usize>,
    combo_warn_threshold: Option<u64>,
    default_max_combinations: Option<usize>,
    float_epsilon: Option<f64>,
}

/// Wrapper for pyproject.toml structure.
#[derive(Debug, Deserialize)]
struct PyProject {
    tool: Option<PyProjectTool>,
}

#[derive(Debug, Deserialize)]
struct PyProjectTool {
    lotopt: Option<RawConfig>,
}

impl Config {
    /// Load configuration from the given directory.
    ///
    /// Search order:
    /// 1. lotopt.toml in directory
    /// 2. pyproject.toml [tool.lotopt] in directory
    /// 3. Walk up to find either
    /// 4. Default config if nothing found
    ///
    /// Relative paths in a found file resolve against that file's directory.
    pub fn load(directory: &Path) -> Self {
        let mut current = Some(directory.to_path_buf());
        while let Some(dir) = current {
            let lotopt_toml = dir.join("lotopt.toml");
            if lotopt_toml.exists() {
                if let Some(config) = Self::load_lotopt_toml(&lotopt_toml) {
                    return config;
                }
            }

            let pyproject = dir.join("pyproject.toml");
            if pyproject.exists() {
                if let Some(config) = Self::load_pyproject(&pyproject) {
                    return config;
                }
            }
            current = dir.parent().map(Path::to_path_buf);
        }

        Self::default()
    }

    fn load_lotopt_toml(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str::<RawConfig>(&content) {
            Ok(raw) => Some(Self::from_raw(raw, path.to_path_buf())),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring invalid config");
                None
            }
        }
    }

    fn load_pyproject(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        let pyproject: PyProject = match toml::from_str(&content) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring invalid pyproject.toml");
                return None;
            }
        };
        let raw = pyproject.tool?.lotopt?;
        Some(Self::from_raw(raw, path.to_path_buf()))
    }

    fn from_raw(raw: RawConfig, source: PathBuf) -> Self {
        let base = source.parent().map(Path::to_path_buf).unwrap_or_default();
        let resolve = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };
        let defaults = Self::default();

        let mut exclude = raw.exclude.unwrap_or(defaults.exclude);
        exclude.extend(raw.extend_exclude.unwrap_or_default());

        Self {
            data_file: resolve(raw.data_file.unwrap_or(defaults.data_file)),
            algorithms_dir: resolve(raw.algorithms_dir.unwrap_or(defaults.algorithms_dir)),
            optimize_dir: resolve(raw.optimize_dir.unwrap_or(defaults.optimize_dir)),
            scratch_dir: resolve(raw.scratch_dir.unwrap_or(defaults.scratch_dir)),
            exclude,
            throttle_ms: raw.throttle_ms.unwrap_or(defaults.throttle_ms),
            max_cycles: raw.max_cycles.unwrap_or(defaults.max_cycles).max(1),
            stall_threshold: raw.stall_threshold.unwrap_or(defaults.stall_threshold).max(1),
            combo_warn_threshold: raw
                .combo_warn_threshold
                .unwrap_or(defaults.combo_warn_threshold),
            default_max_combinations: raw
                .default_max_combinations
                .unwrap_or(defaults.default_max_combinations)
                .max(1),
            float_epsilon: raw
                .float_epsilon
                .filter(|e| e.is_finite() && *e > 0.0)
                .unwrap_or(defaults.float_epsilon),
            source: Some(source),
        }
    }

    /// Check if a file name matches any exclude pattern.
    pub fn matches_exclude(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        self.exclude
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, &name))
    }

    /// Format config for verbose display.
    pub fn display_summary(&self) -> String {
        let mut lines = Vec::new();

        if let Some(ref source) = self.source {
            lines.push(format!("   Config: {}", source.display()));
        } else {
            lines.push("   Config: (defaults)".to_string());
        }
        lines.push(format!("   Data: {}", self.data_file.display()));
        lines.push(format!("   Algorithms: {}", self.algorithms_dir.display()));
        lines.push(format!("   Output: {}", self.optimize_dir.display()));
        if !self.exclude.is_empty() {
            lines.push(format!("   Exclude: {}", self.exclude.join(", ")));
        }
        if self.throttle_ms > 0 {
            lines.push(format!("   Throttle: {}ms", self.throttle_ms));
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_excludes() {
        let config = Config::default();
        assert!(config.matches_exclude(Path::new("algorithms/base.toml")));
        assert!(config.matches_exclude(Path::new("algorithms/_init.toml")));
        assert!(!config.matches_exclude(Path::new("algorithms/lag_echo.toml")));
    }

    #[test]
    fn test_load_lotopt_toml_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lotopt.toml"),
            "data-file = \"data/r.json\"\nthrottle-ms = 7\nextend-exclude = [\"wip_*\"]\n",
        )
        .unwrap();

        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let config = Config::load(&nested);

        assert_eq!(config.data_file, dir.path().join("data/r.json"));
        assert_eq!(config.throttle_ms, 7);
        assert_eq!(config.max_cycles, 5);
        assert!(config.matches_exclude(Path::new("wip_new.toml")));
        assert!(config.matches_exclude(Path::new("base.toml")));
    }

    #[test]
    fn test_pyproject_tool_section() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            "[project]\nname = \"x\"\n\n[tool.lotopt]\nmax-cycles = 3\nexclude = []\n",
        )
        .unwrap();
        let config = Config::load(dir.path());
        assert_eq!(config.max_cycles, 3);
        assert!(!config.matches_exclude(Path::new("base.toml")));
    }
}
