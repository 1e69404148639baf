//! Algorithm registry: discovery, isolated loading, lookup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{AlgorithmDescriptor, Manifest, ManifestPredictor, Predictor};
use crate::config::Config;
use crate::discovery::find_algorithm_files;
use crate::error::{Error, Result};

/// A descriptor together with its ready-to-run instance.
#[derive(Clone)]
pub struct LoadedAlgorithm {
    pub descriptor: AlgorithmDescriptor,
    pub predictor: Arc<dyn Predictor>,
}

impl std::fmt::Debug for LoadedAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedAlgorithm")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: usize,
    /// `(file, message)` for every file that failed to load.
    pub failures: Vec<(PathBuf, String)>,
}

/// `algo_<stem>` with every character outside `[A-Za-z0-9_]` replaced by `_`.
pub fn module_id_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sanitized: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("algo_{sanitized}")
}

/// Load one manifest file into a descriptor + predictor.
pub fn load_algorithm(path: &Path) -> Result<LoadedAlgorithm> {
    let manifest = Manifest::load(path)?;
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| Error::registry(path, "file has no stem"))?;

    let descriptor = AlgorithmDescriptor {
        id,
        module_id: module_id_for(path),
        display_name: manifest.display_name.clone(),
        source_path: path.to_path_buf(),
        class_name: manifest.class_name.clone(),
        description: manifest.description.clone(),
        parameters: manifest.parameters.clone(),
        header: manifest.header.clone(),
    };
    debug!(id = %descriptor.id, module = %descriptor.module_id, "loaded algorithm");

    Ok(LoadedAlgorithm {
        descriptor,
        predictor: Arc::new(ManifestPredictor::new(manifest)),
    })
}

/// Owns every loaded algorithm instance, keyed by id (file stem).
#[derive(Debug, Clone)]
pub struct Registry {
    config: Config,
    algorithms: BTreeMap<String, LoadedAlgorithm>,
}

impl Registry {
    /// Registry over `dir` with the default exclude patterns.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::from_config(&Config {
            algorithms_dir: dir.into(),
            ..Config::default()
        })
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            config: config.clone(),
            algorithms: BTreeMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.config.algorithms_dir
    }

    /// Drop every instance and rescan the directory. A bad file is recorded
    /// in the report and does not affect the others.
    pub fn scan(&mut self) -> Result<LoadReport> {
        self.algorithms.clear();
        let files = find_algorithm_files(&self.config)?;

        let mut report = LoadReport::default();
        for path in files {
            match load_algorithm(&path) {
                Ok(algo) => {
                    self.algorithms.insert(algo.descriptor.id.clone(), algo);
                    report.loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load algorithm");
                    let message = match e {
                        Error::Registry { message, .. } => message,
                        other => other.to_string(),
                    };
                    report.failures.push((path, message));
                }
            }
        }
        info!(
            loaded = report.loaded,
            failed = report.failures.len(),
            dir = %self.dir().display(),
            "scanned algorithms"
        );
        Ok(report)
    }

    pub fn reload(&mut self) -> Result<LoadReport> {
        self.scan()
    }

    pub fn get(&self, id: &str) -> Option<&LoadedAlgorithm> {
        self.algorithms.get(id)
    }

    pub fn descriptor(&self, id: &str) -> Option<&AlgorithmDescriptor> {
        self.get(id).map(|a| &a.descriptor)
    }

    pub fn instance(&self, id: &str) -> Option<Arc<dyn Predictor>> {
        self.get(id).map(|a| Arc::clone(&a.predictor))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.algorithms.contains_key(id)
    }

    /// Descriptors sorted alphabetically by filename.
    pub fn list(&self) -> Vec<&AlgorithmDescriptor> {
        let mut list: Vec<&AlgorithmDescriptor> =
            self.algorithms.values().map(|a| &a.descriptor).collect();
        list.sort_by_key(|d| d.identity().1);
        list
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.algorithms.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.algorithms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.algorithms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const GOOD: &str = "[algorithm]\nclass = \"Good\"\n[config.parameters]\nw = 3\n[[signals]]\nkind = \"frequency\"\nwindow = \"w\"\n";

    #[test]
    fn test_module_id_is_sanitized() {
        assert_eq!(module_id_for(Path::new("x/lag-echo v2.toml")), "algo_lag_echo_v2");
        assert_eq!(module_id_for(Path::new("hot_cold.toml")), "algo_hot_cold");
    }

    #[test]
    fn test_scan_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b-good.toml"), GOOD).unwrap();
        fs::write(dir.path().join("b.toml"), GOOD).unwrap();
        fs::write(dir.path().join("broken.toml"), "[algorithm\n").unwrap();
        let base = "[[signals]]\nkind = \"gap\"\nweight = 1\n";
        fs::write(dir.path().join("base.toml"), base).unwrap();
        fs::write(dir.path().join("_init.toml"), GOOD).unwrap();
        fs::write(dir.path().join("notes.md"), "# not an algorithm").unwrap();

        let mut registry = Registry::new(dir.path());
        let report = registry.scan().unwrap();

        assert_eq!(report.loaded, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].0.ends_with("broken.toml"));

        let names: Vec<String> = registry.list().iter().map(|d| d.identity().1).collect();
        assert_eq!(names, vec!["b-good.toml", "b.toml"]);

        let good = registry.descriptor("b").unwrap();
        assert_eq!(good.class_name, "Good");
        assert_eq!(good.module_id, "algo_b");
        assert!(registry.instance("b-good").is_some());
        assert!(registry.get("broken").is_none());
    }

    #[test]
    fn test_reload_drops_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.toml"), GOOD).unwrap();
        let mut registry = Registry::new(dir.path());
        registry.scan().unwrap();
        assert!(registry.contains("a"));

        fs::remove_file(dir.path().join("a.toml")).unwrap();
        let report = registry.reload().unwrap();
        assert_eq!(report.loaded, 0);
        assert!(registry.is_empty());
    }
}
