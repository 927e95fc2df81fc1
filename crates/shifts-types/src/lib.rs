//! Shared configuration types for speech-shifts
//!
//! This crate contains the YAML configuration schema used across the
//! training harness, plus the [`FromParams`] contract every pluggable
//! component implements so that registries can build it from a params block.

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Raw parameter block of a component entry
pub type Params = Mapping;

// ============================================================================
// Errors
// ============================================================================

/// Configuration errors raised while reading or validating a config
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A mandatory section or value is absent
    #[error("{0} is missing")]
    Missing(String),

    /// `type` does not resolve in the registry of its domain
    #[error("{domain} of type {kind} is not supported")]
    UnknownType { domain: String, kind: String },

    /// Params block does not match the component's schema
    #[error("invalid params for {domain} of type {kind}: {source}")]
    InvalidParams {
        domain: String,
        kind: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Params parsed but a value is out of range
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A component that can be constructed from a typed params block
pub trait FromParams: Sized {
    /// Params schema; unknown fields should be rejected by the schema itself
    type Params: DeserializeOwned;

    /// Validate params and build the component
    fn from_params(params: Self::Params) -> Result<Self, ConfigError>;
}

/// Read and parse a YAML file into `T`
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Component entries
// ============================================================================

fn default_enabled() -> bool {
    true
}

/// One configured pluggable unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentEntry {
    /// Registry identifier. In tables the mapping key plays this role.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(
        default = "default_enabled",
        alias = "do_augment",
        alias = "do_callback"
    )]
    pub do_enable: bool,
    /// Application probability for perturbations
    #[serde(default, alias = "p", skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
}

impl ComponentEntry {
    /// Entry with the given type and params, enabled
    pub fn new(kind: impl Into<String>, params: Params) -> Self {
        Self {
            kind: Some(kind.into()),
            params,
            do_enable: true,
            weight: None,
        }
    }

    /// Weight, defaulting to 1.0 (always applied)
    pub fn weight_or_default(&self) -> f32 {
        self.weight.unwrap_or(1.0)
    }
}

/// Keys accepted for the enable flag of a table entry
const ENABLE_KEYS: [&str; 3] = ["do_enable", "do_augment", "do_callback"];

/// One row of a component table, kept as raw YAML until it is built
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    name: String,
    raw: Value,
}

impl TableEntry {
    pub fn new(name: impl Into<String>, raw: Value) -> Self {
        Self {
            name: name.into(),
            raw,
        }
    }

    /// Registry identifier (the mapping key)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enable flag; only this key is read, params stay untouched
    pub fn is_enabled(&self) -> Result<bool, ConfigError> {
        let Value::Mapping(fields) = &self.raw else {
            return Ok(true);
        };
        for key in ENABLE_KEYS {
            match fields.get(key) {
                None => continue,
                Some(Value::Bool(enabled)) => return Ok(*enabled),
                Some(other) => {
                    return Err(ConfigError::invalid(
                        format!("{}.{}", self.name, key),
                        format!("expected a boolean, got {:?}", other),
                    ))
                }
            }
        }
        Ok(true)
    }

    /// Full entry with typed `params` and `p`; an empty row is an empty entry
    pub fn parse(&self) -> Result<ComponentEntry, serde_yaml::Error> {
        let raw = match &self.raw {
            Value::Null => Value::Mapping(Mapping::new()),
            other => other.clone(),
        };
        serde_yaml::from_value(raw)
    }
}

/// Ordered component table, in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentTable {
    entries: Vec<TableEntry>,
}

impl ComponentTable {
    pub fn new(entries: Vec<TableEntry>) -> Self {
        Self { entries }
    }

    /// Table from a YAML mapping; keys must be strings
    pub fn from_mapping(raw: Mapping) -> Result<Self, String> {
        let mut entries = Vec::with_capacity(raw.len());
        // serde_yaml::Mapping keeps insertion order
        for (key, value) in raw {
            match key {
                Value::String(name) => entries.push(TableEntry::new(name, value)),
                other => return Err(format!("component key must be a string, got {:?}", other)),
            }
        }
        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'de> Deserialize<'de> for ComponentTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<Mapping>::deserialize(deserializer)?.unwrap_or_default();
        Self::from_mapping(raw).map_err(D::Error::custom)
    }
}

/// A table section given inline or as a path to a separate YAML file
#[derive(Debug, Clone)]
pub enum TableSource {
    Path(PathBuf),
    Inline(ComponentTable),
}

impl<'de> Deserialize<'de> for TableSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(path) => Ok(TableSource::Path(PathBuf::from(path))),
            Value::Mapping(raw) => ComponentTable::from_mapping(raw)
                .map(TableSource::Inline)
                .map_err(D::Error::custom),
            Value::Null => Ok(TableSource::Inline(ComponentTable::default())),
            other => Err(D::Error::custom(format!(
                "expected a file path or a mapping of components, got {:?}",
                other
            ))),
        }
    }
}

impl TableSource {
    /// Resolve to a table, reading the file relative to `base_dir` if needed
    pub fn load(&self, base_dir: &Path) -> Result<ComponentTable, ConfigError> {
        match self {
            TableSource::Inline(table) => Ok(table.clone()),
            TableSource::Path(path) => read_yaml(&resolve_path(base_dir, path)),
        }
    }
}

/// Join `path` onto `base_dir` unless it is already absolute
pub fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

// ============================================================================
// Model
// ============================================================================

/// Model section of the training config
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    pub featurizer_type: String,
    #[serde(default)]
    pub classifier_type: Option<String>,
    /// Overrides merged on top of the external classifier block
    #[serde(default)]
    pub params: Params,
    #[serde(default, alias = "cfg_path")]
    pub external_config_path: Option<PathBuf>,
}

impl ModelSpec {
    /// External config path; also accepted as `params.cfg_path`
    pub fn external_config_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.external_config_path {
            return Ok(path.clone());
        }
        match self.params.get("cfg_path") {
            Some(Value::String(path)) => Ok(PathBuf::from(path)),
            _ => Err(ConfigError::Missing("model.external_config_path".into())),
        }
    }

    /// Params without the `cfg_path` pointer
    pub fn override_params(&self) -> Params {
        let mut params = self.params.clone();
        params.remove("cfg_path");
        params
    }
}

/// External model config: base featurizer and classifier blocks
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalModelConfig {
    pub featurizer: Params,
    #[serde(default)]
    pub classifier: Params,
}

// ============================================================================
// Data
// ============================================================================

/// Data section of the training config
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    pub root_dir: PathBuf,
    pub params: DataParams,
}

fn default_n_views() -> usize {
    1
}

fn default_num_workers() -> usize {
    10
}

fn default_sample_rate() -> u32 {
    16000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataParams {
    #[serde(default = "default_n_views")]
    pub n_views: usize,
    pub train_bs: usize,
    pub eval_bs: usize,
    /// Worker threads for the val / id_val loaders
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

// ============================================================================
// Optimization
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
}

/// Learning rate schedule
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase", deny_unknown_fields)]
pub enum SchedulerConfig {
    /// Linear warmup, then cosine decay to `min_lr` over the run
    Cosine {
        #[serde(default)]
        warmup_steps: usize,
        #[serde(default)]
        min_lr: f32,
    },
    /// Linear warmup, then constant
    Warmup { warmup_steps: usize },
    Constant,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    #[serde(default = "OptimizerConfig::default_kind")]
    pub name: OptimizerKind,
    #[serde(default = "OptimizerConfig::default_lr")]
    pub lr: f32,
    #[serde(default = "OptimizerConfig::default_momentum")]
    pub momentum: f32,
    #[serde(default = "OptimizerConfig::default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default)]
    pub sched: Option<SchedulerConfig>,
}

impl OptimizerConfig {
    fn default_kind() -> OptimizerKind {
        OptimizerKind::Sgd
    }

    fn default_lr() -> f32 {
        0.1
    }

    fn default_momentum() -> f32 {
        0.9
    }

    fn default_weight_decay() -> f32 {
        5e-4
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lr <= 0.0 {
            return Err(ConfigError::invalid("optimizer.lr", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::invalid("optimizer.momentum", "must be in [0, 1)"));
        }
        if self.weight_decay < 0.0 {
            return Err(ConfigError::invalid("optimizer.weight_decay", "must be >= 0"));
        }
        Ok(())
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            name: Self::default_kind(),
            lr: Self::default_lr(),
            momentum: Self::default_momentum(),
            weight_decay: Self::default_weight_decay(),
            sched: None,
        }
    }
}

// ============================================================================
// Trainer
// ============================================================================

/// Training-loop controller settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    /// 0 = bounded by `max_epochs` only
    pub max_steps: usize,
    pub log_every_n_steps: usize,
    pub check_val_every_n_epoch: usize,
    /// 0 = all batches
    pub limit_train_batches: usize,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 10,
            max_steps: 0,
            log_every_n_steps: 50,
            check_val_every_n_epoch: 1,
            limit_train_batches: 0,
            seed: 42,
        }
    }
}

impl TrainerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_epochs == 0 && self.max_steps == 0 {
            return Err(ConfigError::invalid(
                "trainer",
                "one of max_epochs or max_steps must be non-zero",
            ));
        }
        if self.log_every_n_steps == 0 {
            return Err(ConfigError::invalid("trainer.log_every_n_steps", "must be at least 1"));
        }
        if self.check_val_every_n_epoch == 0 {
            return Err(ConfigError::invalid(
                "trainer.check_val_every_n_epoch",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Top-level config
// ============================================================================

/// Whole training configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub audio_augmentations: Option<TableSource>,
    #[serde(default)]
    pub spec_augmentations: Option<TableSource>,
    #[serde(default)]
    pub preprocessor: Option<ComponentEntry>,
    #[serde(default)]
    pub loss: Option<ComponentEntry>,
    #[serde(default)]
    pub model: Option<ModelSpec>,
    #[serde(default)]
    pub data: Option<DataConfig>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub callbacks: Option<TableSource>,
    #[serde(default)]
    pub explicit_checkpoint_path: Option<PathBuf>,
    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl TrainingConfig {
    /// Parse from a YAML string; relative paths resolve against the CWD
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.base_dir = PathBuf::from(".");
        Ok(config)
    }

    /// Load from a file; relative paths resolve against the file's directory
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = read_yaml(path)?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    /// Resolve a path from the config against `base_dir`
    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_path(&self.base_dir, path)
    }

    /// Load an optional table section
    pub fn load_table(&self, source: Option<&TableSource>) -> Result<ComponentTable, ConfigError> {
        match source {
            Some(source) => source.load(&self.base_dir),
            None => Ok(ComponentTable::default()),
        }
    }

    /// Configured resume checkpoint, ignoring an empty path
    pub fn explicit_checkpoint(&self) -> Option<PathBuf> {
        self.explicit_checkpoint_path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| self.resolve(p))
    }

    /// Fail fast on absent mandatory sections, before any data is touched
    pub fn validate_required(&self) -> Result<(), ConfigError> {
        if self.preprocessor.is_none() {
            return Err(ConfigError::Missing("preprocessor".into()));
        }
        if self.loss.is_none() {
            return Err(ConfigError::Missing("loss".into()));
        }
        if self.model.is_none() {
            return Err(ConfigError::Missing("model".into()));
        }
        if self.data.is_none() {
            return Err(ConfigError::Missing("data".into()));
        }
        self.optimizer.validate()?;
        self.trainer.validate()
    }
}
