//! Experiment directory layout
//!
//! ```text
//! <cfg_dir>/experiments/<cfg_stem>/<timestamp>/
//!     <cfg file copy>
//!     logs/
//!     checkpoints/
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Directories of one training run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentDirs {
    pub root: PathBuf,
    pub logs: PathBuf,
    pub checkpoints: PathBuf,
}

/// Create a fresh run directory next to the config and copy the config into it
pub fn exp_manager(config_path: &Path) -> Result<ExperimentDirs> {
    let base_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stem = config_path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("Config path has no file name")?;

    let experiment_dir = base_dir.join("experiments").join(stem);
    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    // Runs started within the same second get a numeric suffix
    let mut root = experiment_dir.join(&timestamp);
    let mut suffix = 1;
    while root.exists() {
        root = experiment_dir.join(format!("{}_{}", timestamp, suffix));
        suffix += 1;
    }

    let dirs = ExperimentDirs {
        logs: root.join("logs"),
        checkpoints: root.join("checkpoints"),
        root,
    };
    for dir in [&dirs.logs, &dirs.checkpoints] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    if let Some(name) = config_path.file_name() {
        std::fs::copy(config_path, dirs.root.join(name))
            .with_context(|| format!("Failed to copy {}", config_path.display()))?;
    }

    tracing::info!("Experiment directory: {}", dirs.root.display());
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout() {
        let dir = tempdir().unwrap();
        let cfg = dir.path().join("ecapa.yaml");
        std::fs::write(&cfg, "trainer: {}\n").unwrap();

        let dirs = exp_manager(&cfg).unwrap();
        assert!(dirs.root.starts_with(dir.path().join("experiments").join("ecapa")));
        assert!(dirs.logs.is_dir());
        assert!(dirs.checkpoints.is_dir());
        assert!(dirs.root.join("ecapa.yaml").is_file());
    }

    #[test]
    fn test_runs_do_not_collide() {
        let dir = tempdir().unwrap();
        let cfg = dir.path().join("run.yaml");
        std::fs::write(&cfg, "{}\n").unwrap();

        let first = exp_manager(&cfg).unwrap();
        let second = exp_manager(&cfg).unwrap();
        assert_ne!(first.root, second.root);
    }

    #[test]
    fn test_missing_config_fails() {
        let dir = tempdir().unwrap();
        assert!(exp_manager(&dir.path().join("absent.yaml")).is_err());
    }
}
