//! Flat, git-aware scan of the algorithms directory.
//!
//! Only the top level is scanned: bases and helpers live next to the
//! algorithms and are filtered out by name (`base.toml`, `_*`, and any
//! configured exclude glob). Results are sorted so load order, and the
//! report built from it, is reproducible.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::config::Config;
use crate::error::{Error, Result};

/// Manifest extension.
const ALGORITHM_EXTENSION: &str = "toml";

/// Find algorithm manifests in `config.algorithms_dir`.
pub fn find_algorithm_files(config: &Config) -> Result<Vec<PathBuf>> {
    let directory = config.algorithms_dir.as_path();
    if !directory.is_dir() {
        return Err(Error::registry(directory, "algorithms directory does not exist"));
    }

    let walker = WalkBuilder::new(directory)
        .hidden(true)           // Dotfiles are never algorithms
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false)     // Work even in non-git directories
        .follow_links(false)
        .max_depth(Some(1))
        .build();

    let mut files: Vec<PathBuf> = walker
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| path.is_file() && is_algorithm_file(path))
        .filter(|path| !config.matches_exclude(path))
        .collect();

    files.sort();
    Ok(files)
}

fn is_algorithm_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(ALGORITHM_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_for(dir: &Path) -> Config {
        Config {
            algorithms_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_extension_filtering() {
        assert!(is_algorithm_file(Path::new("lag.toml")));
        assert!(is_algorithm_file(Path::new("LAG.TOML")));
        assert!(!is_algorithm_file(Path::new("lag.py")));
        assert!(!is_algorithm_file(Path::new("toml")));
    }

    #[test]
    fn test_nonexistent_dir() {
        let result = find_algorithm_files(&config_for(Path::new("/nonexistent/algos/xyz")));
        assert!(matches!(result, Err(Error::Registry { .. })));
    }

    #[test]
    fn test_flat_sorted_and_excluded() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("zeta.toml"), "")?;
        fs::write(dir.path().join("alpha.toml"), "")?;
        fs::write(dir.path().join("base.toml"), "")?;
        fs::write(dir.path().join("_shared.toml"), "")?;
        fs::write(dir.path().join("readme.md"), "")?;
        fs::create_dir(dir.path().join("nested"))?;
        fs::write(dir.path().join("nested/deep.toml"), "")?;

        let files = find_algorithm_files(&config_for(dir.path()))?;
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["alpha.toml", "zeta.toml"]);
        Ok(())
    }
}
