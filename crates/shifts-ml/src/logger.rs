//! JSON-lines metrics logger

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::traits::{Metrics, MetricsLogger};

#[derive(Serialize)]
struct MetricsLine<'a> {
    step: usize,
    timestamp: String,
    #[serde(flatten)]
    metrics: &'a Metrics,
}

/// Appends one JSON object per `log_metrics` call to `<save_dir>/metrics.jsonl`
/// and writes hyperparameters to `<save_dir>/hparams.yaml`
pub struct JsonlLogger {
    save_dir: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlLogger {
    pub fn new(save_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(save_dir)
            .with_context(|| format!("Failed to create log dir {}", save_dir.display()))?;
        let path = save_dir.join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        tracing::info!("Logging metrics to {}", path.display());
        Ok(Self {
            save_dir: save_dir.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl MetricsLogger for JsonlLogger {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    fn log_hyperparams(&self, params: &serde_yaml::Value) -> Result<()> {
        let path = self.save_dir.join("hparams.yaml");
        let yaml = serde_yaml::to_string(params)?;
        std::fs::write(&path, yaml).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn log_metrics(&self, metrics: &Metrics, step: usize) -> Result<()> {
        let line = MetricsLine {
            step,
            timestamp: chrono::Utc::now().to_rfc3339(),
            metrics,
        };
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, &line)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

impl Drop for JsonlLogger {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_metrics_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonlLogger::new(&dir.path().join("logs")).unwrap();

        let mut metrics = Metrics::new();
        metrics.insert("train_loss".to_string(), 1.5);
        logger.log_metrics(&metrics, 10).unwrap();
        metrics.insert("train_loss".to_string(), 1.0);
        logger.log_metrics(&metrics, 20).unwrap();
        logger.finalize().unwrap();

        let content = std::fs::read_to_string(dir.path().join("logs/metrics.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["step"], 20);
        assert_eq!(lines[1]["train_loss"], 1.0);
    }

    #[test]
    fn test_hparams_file() {
        let dir = tempdir().unwrap();
        let logger = JsonlLogger::new(dir.path()).unwrap();
        let params: serde_yaml::Value = serde_yaml::from_str("lr: 0.1\nmomentum: 0.9").unwrap();
        logger.log_hyperparams(&params).unwrap();

        let written: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(dir.path().join("hparams.yaml")).unwrap())
                .unwrap();
        assert_eq!(written, params);
        assert_eq!(logger.save_dir(), dir.path());
    }
}
