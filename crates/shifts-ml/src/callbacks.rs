//! Training loop callbacks
//!
//! `ModelCheckpoint` writes JSON checkpoints that `read_checkpoint_counters`
//! understands, so any of them can be used to resume loop counters.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shifts_types::{ConfigError, FromParams};
use std::path::{Path, PathBuf};

use crate::traits::{Callback, LoopState, Metrics, MetricsLogger, TrainingModule};

/// Direction in which a monitored metric improves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Min,
    Max,
}

impl Mode {
    /// `candidate` beats `reference` by more than `min_delta`
    pub fn improves(self, candidate: f64, reference: f64, min_delta: f64) -> bool {
        match self {
            Mode::Min => candidate < reference - min_delta,
            Mode::Max => candidate > reference + min_delta,
        }
    }
}

// ============================================================================
// Checkpoint files
// ============================================================================

/// On-disk checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub global_step: usize,
    pub epoch: usize,
    #[serde(default)]
    pub monitor: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub state_dict: serde_json::Value,
}

impl CheckpointRecord {
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))
    }
}

#[derive(Deserialize)]
struct Counters {
    global_step: usize,
    epoch: usize,
}

/// Read `global_step` and `epoch` from a checkpoint file
pub fn read_checkpoint_counters(path: &Path) -> Result<LoopState> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    let counters: Counters = serde_json::from_str(&content)
        .with_context(|| format!("Invalid checkpoint {}", path.display()))?;
    Ok(LoopState {
        global_step: counters.global_step,
        current_epoch: counters.epoch,
    })
}

// ============================================================================
// ModelCheckpoint
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelCheckpointParams {
    /// Always injected by the trainer builder
    pub dirpath: PathBuf,
    #[serde(default)]
    pub monitor: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "ModelCheckpointParams::default_top_k")]
    pub save_top_k: usize,
    #[serde(default = "ModelCheckpointParams::default_save_last")]
    pub save_last: bool,
    #[serde(default = "ModelCheckpointParams::default_filename")]
    pub filename: String,
}

impl ModelCheckpointParams {
    fn default_top_k() -> usize {
        1
    }

    fn default_save_last() -> bool {
        true
    }

    fn default_filename() -> String {
        "{epoch}-{step}".to_string()
    }
}

pub struct ModelCheckpoint {
    dirpath: PathBuf,
    monitor: Option<String>,
    mode: Mode,
    save_top_k: usize,
    save_last: bool,
    filename: String,
    /// Kept checkpoints, best first
    best_k: Vec<(f64, PathBuf)>,
    latest: Option<PathBuf>,
}

impl FromParams for ModelCheckpoint {
    type Params = ModelCheckpointParams;

    fn from_params(p: ModelCheckpointParams) -> Result<Self, ConfigError> {
        if p.filename.trim().is_empty() {
            return Err(ConfigError::invalid(
                "ModelCheckpoint.filename",
                "must not be empty",
            ));
        }
        Ok(Self {
            dirpath: p.dirpath,
            monitor: p.monitor,
            mode: p.mode,
            save_top_k: p.save_top_k,
            save_last: p.save_last,
            filename: p.filename,
            best_k: Vec::new(),
            latest: None,
        })
    }
}

impl ModelCheckpoint {
    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    pub fn best_model_path(&self) -> Option<&Path> {
        self.best_k
            .first()
            .map(|(_, p)| p.as_path())
            .or(self.latest.as_deref())
    }

    /// Expand `{epoch}`, `{step}` and `{<monitor>}` as `name=value`
    fn format_name(&self, state: &LoopState, score: Option<f64>) -> String {
        let mut name = self
            .filename
            .replace("{epoch}", &format!("epoch={}", state.current_epoch))
            .replace("{step}", &format!("step={}", state.global_step));
        if let (Some(monitor), Some(score)) = (&self.monitor, score) {
            name = name.replace(
                &format!("{{{}}}", monitor),
                &format!("{}={:.4}", monitor, score),
            );
        }
        format!("{}.ckpt", name)
    }

    fn save(
        &self,
        path: &Path,
        state: &LoopState,
        score: Option<f64>,
        module: &dyn TrainingModule,
    ) -> Result<()> {
        CheckpointRecord {
            global_step: state.global_step,
            epoch: state.current_epoch,
            monitor: self.monitor.clone(),
            score,
            state_dict: module.state_dict(),
        }
        .write(path)?;
        tracing::info!("Saved checkpoint: {}", path.display());
        Ok(())
    }

    fn remove(path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove checkpoint {}: {}", path.display(), e);
        }
    }
}

impl Callback for ModelCheckpoint {
    fn name(&self) -> &'static str {
        "ModelCheckpoint"
    }

    fn on_fit_start(&mut self, _state: &LoopState, _logger: &dyn MetricsLogger) -> Result<()> {
        std::fs::create_dir_all(&self.dirpath)
            .with_context(|| format!("Failed to create {}", self.dirpath.display()))
    }

    fn on_validation_end(
        &mut self,
        state: &LoopState,
        metrics: &Metrics,
        module: &dyn TrainingModule,
    ) -> Result<()> {
        if self.save_top_k == 0 {
            return Ok(());
        }

        let Some(monitor) = self.monitor.clone() else {
            // No monitor: keep only the most recent checkpoint
            let path = self.dirpath.join(self.format_name(state, None));
            self.save(&path, state, None, module)?;
            if let Some(previous) = self.latest.replace(path.clone()) {
                if previous != path {
                    Self::remove(&previous);
                }
            }
            return Ok(());
        };

        let Some(&score) = metrics.get(&monitor) else {
            tracing::warn!("ModelCheckpoint: metric '{}' not found, skipping", monitor);
            return Ok(());
        };
        if score.is_nan() {
            return Ok(());
        }

        let qualifies = self.best_k.len() < self.save_top_k
            || self
                .best_k
                .last()
                .map_or(true, |(worst, _)| self.mode.improves(score, *worst, 0.0));
        if !qualifies {
            return Ok(());
        }

        let path = self.dirpath.join(self.format_name(state, Some(score)));
        self.save(&path, state, Some(score), module)?;
        self.best_k.retain(|(_, p)| p != &path);
        self.best_k.push((score, path.clone()));
        let mode = self.mode;
        self.best_k.sort_by(|a, b| match mode {
            Mode::Min => a.0.total_cmp(&b.0),
            Mode::Max => b.0.total_cmp(&a.0),
        });
        while self.best_k.len() > self.save_top_k {
            if let Some((_, evicted)) = self.best_k.pop() {
                Self::remove(&evicted);
            }
        }
        self.latest = Some(path);
        Ok(())
    }

    fn on_fit_end(&mut self, state: &LoopState, module: &dyn TrainingModule) -> Result<()> {
        if self.save_last {
            let path = self.dirpath.join("last.ckpt");
            self.save(&path, state, None, module)?;
        }
        Ok(())
    }
}

// ============================================================================
// EarlyStopping
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EarlyStoppingParams {
    #[serde(default = "EarlyStoppingParams::default_monitor")]
    pub monitor: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "EarlyStoppingParams::default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub min_delta: f64,
}

impl EarlyStoppingParams {
    fn default_monitor() -> String {
        "val_eer".to_string()
    }

    fn default_patience() -> usize {
        3
    }
}

/// Stop when `monitor` has not improved for `patience` validations
pub struct EarlyStopping {
    monitor: String,
    mode: Mode,
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    wait_count: usize,
    stopped: bool,
}

impl FromParams for EarlyStopping {
    type Params = EarlyStoppingParams;

    fn from_params(p: EarlyStoppingParams) -> Result<Self, ConfigError> {
        if p.min_delta < 0.0 {
            return Err(ConfigError::invalid(
                "EarlyStopping.min_delta",
                "must be non-negative",
            ));
        }
        Ok(Self {
            monitor: p.monitor,
            mode: p.mode,
            patience: p.patience,
            min_delta: p.min_delta,
            best: None,
            wait_count: 0,
            stopped: false,
        })
    }
}

impl Callback for EarlyStopping {
    fn name(&self) -> &'static str {
        "EarlyStopping"
    }

    fn on_validation_end(
        &mut self,
        state: &LoopState,
        metrics: &Metrics,
        _module: &dyn TrainingModule,
    ) -> Result<()> {
        let Some(&score) = metrics.get(&self.monitor) else {
            tracing::warn!("EarlyStopping: metric '{}' not found", self.monitor);
            return Ok(());
        };

        let improved = match self.best {
            None => !score.is_nan(),
            Some(best) => self.mode.improves(score, best, self.min_delta),
        };
        if improved {
            self.best = Some(score);
            self.wait_count = 0;
        } else {
            self.wait_count += 1;
            if self.wait_count >= self.patience {
                self.stopped = true;
                tracing::info!(
                    "Early stopping at epoch {}: {} did not improve for {} validations (best {:?})",
                    state.current_epoch,
                    self.monitor,
                    self.wait_count,
                    self.best
                );
            }
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stopped
    }
}

// ============================================================================
// LearningRateMonitor
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingInterval {
    Step,
    #[default]
    Epoch,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LearningRateMonitorParams {
    #[serde(default)]
    pub logging_interval: LoggingInterval,
}

/// Logs the optimizer learning rate as `lr-SGD`
pub struct LearningRateMonitor {
    logging_interval: LoggingInterval,
}

impl FromParams for LearningRateMonitor {
    type Params = LearningRateMonitorParams;

    fn from_params(p: LearningRateMonitorParams) -> Result<Self, ConfigError> {
        Ok(Self {
            logging_interval: p.logging_interval,
        })
    }
}

impl LearningRateMonitor {
    fn log(&self, state: &LoopState, module: &dyn TrainingModule, logger: &dyn MetricsLogger) -> Result<()> {
        let mut metrics = Metrics::new();
        metrics.insert("lr-SGD".to_string(), module.current_lr() as f64);
        logger.log_metrics(&metrics, state.global_step)
    }
}

impl Callback for LearningRateMonitor {
    fn name(&self) -> &'static str {
        "LearningRateMonitor"
    }

    fn on_train_batch_end(
        &mut self,
        state: &LoopState,
        _metrics: &Metrics,
        module: &dyn TrainingModule,
        logger: &dyn MetricsLogger,
    ) -> Result<()> {
        if self.logging_interval == LoggingInterval::Step {
            self.log(state, module, logger)?;
        }
        Ok(())
    }

    fn on_train_epoch_end(
        &mut self,
        state: &LoopState,
        module: &dyn TrainingModule,
        logger: &dyn MetricsLogger,
    ) -> Result<()> {
        if self.logging_interval == LoggingInterval::Epoch {
            self.log(state, module, logger)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::JsonlLogger;
    use tempfile::tempdir;

    struct FixedModule;

    impl TrainingModule for FixedModule {
        fn configure_optimizers(&mut self, _total: usize, _start: usize) -> Result<()> {
            Ok(())
        }

        fn num_train_batches(&self) -> usize {
            1
        }

        fn training_step(&mut self, _state: &LoopState, _batch_idx: usize) -> Result<Metrics> {
            Ok(Metrics::new())
        }

        fn validation_epoch(&mut self, _state: &LoopState) -> Result<Metrics> {
            Ok(Metrics::new())
        }

        fn current_lr(&self) -> f32 {
            0.5
        }

        fn state_dict(&self) -> serde_json::Value {
            serde_json::json!({"weights": [1.0, 2.0]})
        }
    }

    fn metrics(name: &str, value: f64) -> Metrics {
        let mut m = Metrics::new();
        m.insert(name.to_string(), value);
        m
    }

    fn checkpoint(dir: &Path, yaml: &str) -> ModelCheckpoint {
        let mut params: serde_yaml::Mapping = serde_yaml::from_str(yaml).unwrap();
        params.insert("dirpath".into(), dir.to_string_lossy().into_owned().into());
        let params: ModelCheckpointParams =
            serde_yaml::from_value(serde_yaml::Value::Mapping(params)).unwrap();
        ModelCheckpoint::from_params(params).unwrap()
    }

    #[test]
    fn test_checkpoint_keeps_top_k() {
        let dir = tempdir().unwrap();
        let mut ckpt = checkpoint(dir.path(), "monitor: val_eer\nsave_top_k: 2");
        let module = FixedModule;

        for (epoch, eer) in [0.30, 0.20, 0.25, 0.40].iter().enumerate() {
            let state = LoopState {
                global_step: (epoch + 1) * 10,
                current_epoch: epoch,
            };
            ckpt.on_validation_end(&state, &metrics("val_eer", *eer), &module)
                .unwrap();
        }

        let mut files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files, vec!["epoch=1-step=20.ckpt", "epoch=2-step=30.ckpt"]);
        assert_eq!(
            ckpt.best_model_path().unwrap(),
            dir.path().join("epoch=1-step=20.ckpt")
        );
    }

    #[test]
    fn test_last_checkpoint_resumable() {
        let dir = tempdir().unwrap();
        let mut ckpt = checkpoint(dir.path(), "{}");
        let state = LoopState {
            global_step: 42,
            current_epoch: 3,
        };
        ckpt.on_fit_end(&state, &FixedModule).unwrap();

        let path = dir.path().join("last.ckpt");
        assert_eq!(read_checkpoint_counters(&path).unwrap(), state);
        assert_eq!(ckpt.dirpath(), dir.path());
    }

    #[test]
    fn test_monitor_in_filename() {
        let dir = tempdir().unwrap();
        let ckpt = checkpoint(dir.path(), "monitor: val_eer\nfilename: '{epoch}-{val_eer}'");
        let name = ckpt.format_name(
            &LoopState {
                global_step: 5,
                current_epoch: 1,
            },
            Some(0.125),
        );
        assert_eq!(name, "epoch=1-val_eer=0.1250.ckpt");
    }

    #[test]
    fn test_early_stopping_patience() {
        let mut es = EarlyStopping::from_params(EarlyStoppingParams {
            monitor: "val_eer".to_string(),
            mode: Mode::Min,
            patience: 2,
            min_delta: 0.01,
        })
        .unwrap();
        let state = LoopState::default();
        for eer in [0.30, 0.25, 0.245, 0.26] {
            assert!(!es.should_stop());
            es.on_validation_end(&state, &metrics("val_eer", eer), &FixedModule)
                .unwrap();
        }
        assert!(es.should_stop());
    }

    #[test]
    fn test_early_stopping_ignores_missing_metric() {
        let mut es = EarlyStopping::from_params(EarlyStoppingParams {
            monitor: "val_eer".to_string(),
            mode: Mode::Min,
            patience: 1,
            min_delta: 0.0,
        })
        .unwrap();
        es.on_validation_end(&LoopState::default(), &Metrics::new(), &FixedModule)
            .unwrap();
        assert!(!es.should_stop());
    }

    #[test]
    fn test_lr_monitor_logs_per_step() {
        let dir = tempdir().unwrap();
        let logger = JsonlLogger::new(dir.path()).unwrap();
        let mut monitor = LearningRateMonitor::from_params(LearningRateMonitorParams {
            logging_interval: LoggingInterval::Step,
        })
        .unwrap();
        let state = LoopState {
            global_step: 1,
            current_epoch: 0,
        };
        monitor
            .on_train_batch_end(&state, &Metrics::new(), &FixedModule, &logger)
            .unwrap();
        monitor
            .on_train_epoch_end(&state, &FixedModule, &logger)
            .unwrap();
        logger.finalize().unwrap();

        let content = std::fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("lr-SGD"));
    }
}
