//! Component builders
//!
//! Turn the sections of a [`TrainingConfig`] into live components. Every
//! decision (created, skipped as unknown, turned off) is reported to a
//! [`BuildObserver`].

use anyhow::{Context, Result};
use serde_yaml::Value;
use shifts_audio::{AudioAugmentor, Compose, Preprocessor};
use shifts_ml::{read_checkpoint_counters, Callback, Classifier, Featurizer, JsonlLogger, Loss, Trainer};
use shifts_types::{
    read_yaml, resolve_path, ComponentEntry, ComponentTable, ConfigError, DataConfig,
    ExternalModelConfig, ModelSpec, Params, TrainingConfig,
};
use std::path::Path;
use std::sync::Arc;

use crate::data::{get_eval_loader, get_train_loader, EvalLoader, LoaderKind, MlsrDataset, Subset, TrainLoader};
use crate::exp_manager::exp_manager;
use crate::observe::{BuildEvent, BuildObserver, Outcome};
use crate::registry::Registry;
use crate::supported::{Registries, MODEL_CHECKPOINT};

/// Subset and loader for every split
pub struct SplitLoaders {
    pub train: (Arc<Subset>, TrainLoader),
    pub val: (Arc<Subset>, EvalLoader),
    pub id_val: (Arc<Subset>, EvalLoader),
    pub test: (Arc<Subset>, EvalLoader),
}

pub struct ComponentBuilder<'a> {
    registries: &'a Registries,
    observer: &'a dyn BuildObserver,
}

impl<'a> ComponentBuilder<'a> {
    pub fn new(registries: &'a Registries, observer: &'a dyn BuildObserver) -> Self {
        Self {
            registries,
            observer,
        }
    }

    /// Builder over the built-in registries
    pub fn standard(observer: &'a dyn BuildObserver) -> Self {
        Self::new(Registries::standard(), observer)
    }

    fn record(&self, domain: &str, kind: &str, outcome: Outcome) {
        self.observer.record(BuildEvent::new(domain, kind, outcome));
    }

    /// Walk a table in order: unknown and disabled entries are skipped
    /// without reading their params, the rest are constructed by `make`
    fn resolve_table<T: ?Sized + 'static, R>(
        &self,
        registry: &Registry<T>,
        table: &ComponentTable,
        mut make: impl FnMut(&str, &ComponentEntry) -> Result<R, ConfigError>,
    ) -> Result<Vec<R>, ConfigError> {
        let mut built = Vec::with_capacity(table.len());
        for row in table.iter() {
            let kind = row.name();
            if !registry.contains(kind) {
                self.record(registry.domain(), kind, Outcome::NotFound);
                continue;
            }
            if !row.is_enabled()? {
                self.record(registry.domain(), kind, Outcome::Disabled);
                continue;
            }
            let entry = row.parse().map_err(|source| ConfigError::InvalidParams {
                domain: registry.domain().to_string(),
                kind: kind.to_string(),
                source,
            })?;
            built.push(make(kind, &entry)?);
            self.record(registry.domain(), kind, Outcome::Created);
        }
        Ok(built)
    }

    fn weighted<T: ?Sized + 'static>(
        &self,
        registry: &Registry<T>,
        table: &ComponentTable,
    ) -> Result<Vec<(f32, Box<T>)>, ConfigError> {
        self.resolve_table(registry, table, |kind, entry| {
            let weight = entry.weight_or_default();
            if !(0.0..=1.0).contains(&weight) {
                return Err(ConfigError::invalid(
                    format!("{}.p", kind),
                    format!("probability must be in [0, 1], got {}", weight),
                ));
            }
            Ok((weight, registry.create(kind, entry.params.clone())?))
        })
    }

    /// Waveform perturbations, in table order
    pub fn build_augmentor(&self, table: &ComponentTable) -> Result<AudioAugmentor, ConfigError> {
        let perturbations = self.weighted(&self.registries.audio_augmentations, table)?;
        Ok(AudioAugmentor::new(perturbations))
    }

    /// Spectrogram perturbations, in table order
    pub fn build_spec_augmentor(&self, table: &ComponentTable) -> Result<Compose, ConfigError> {
        let perturbations = self.weighted(&self.registries.spec_augmentations, table)?;
        Ok(Compose::new(perturbations))
    }

    /// Feature extractor; `eval` switches dithering off
    pub fn build_preprocessor(
        &self,
        entry: Option<&ComponentEntry>,
        eval: bool,
    ) -> Result<Box<dyn Preprocessor>, ConfigError> {
        let entry = entry.ok_or_else(|| ConfigError::Missing("preprocessor".into()))?;
        let kind = entry
            .kind
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("preprocessor.type".into()))?;

        let mut params = entry.params.clone();
        if eval {
            params.insert(Value::from("dither"), Value::from(0.0));
        }
        let preprocessor = self.registries.preprocessors.create(kind, params)?;
        self.record(self.registries.preprocessors.domain(), kind, Outcome::Created);
        Ok(preprocessor)
    }

    pub fn build_loss(&self, entry: Option<&ComponentEntry>) -> Result<Box<dyn Loss>, ConfigError> {
        let entry = entry.ok_or_else(|| ConfigError::Missing("loss".into()))?;
        let kind = entry
            .kind
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("loss.type".into()))?;

        let loss = self.registries.losses.create(kind, entry.params.clone())?;
        self.record(self.registries.losses.domain(), kind, Outcome::Created);
        Ok(loss)
    }

    /// Featurizer and optional classifier head
    ///
    /// Both start from the external model config; `spec.params` override the
    /// classifier block and `num_classes` is always injected.
    pub fn build_model(
        &self,
        spec: Option<&ModelSpec>,
        base_dir: &Path,
        num_classes: usize,
    ) -> Result<(Box<dyn Featurizer>, Option<Box<dyn Classifier>>), ConfigError> {
        let spec = spec.ok_or_else(|| ConfigError::Missing("model".into()))?;
        let external_path = resolve_path(base_dir, &spec.external_config_path()?);
        let external: ExternalModelConfig = read_yaml(&external_path)?;

        let featurizers = &self.registries.featurizers;
        let featurizer = featurizers.create(&spec.featurizer_type, external.featurizer)?;
        self.record(featurizers.domain(), &spec.featurizer_type, Outcome::Created);

        let Some(classifier_type) = spec.classifier_type.as_deref() else {
            return Ok((featurizer, None));
        };

        let mut params: Params = external.classifier;
        for (key, value) in spec.override_params() {
            params.insert(key, value);
        }
        params.insert(Value::from("num_classes"), Value::from(num_classes as u64));

        let classifiers = &self.registries.classifiers;
        let classifier = classifiers.create(classifier_type, params)?;
        self.observer.record(
            BuildEvent::new(classifiers.domain(), classifier_type, Outcome::Created)
                .with_detail(format!("num_classes={}", num_classes)),
        );
        Ok((featurizer, Some(classifier)))
    }

    /// Training callbacks; checkpoint writers are rooted at `checkpoint_dir`
    pub fn build_callbacks(
        &self,
        table: &ComponentTable,
        checkpoint_dir: &Path,
    ) -> Result<Vec<Box<dyn Callback>>, ConfigError> {
        let registry = &self.registries.callbacks;
        self.resolve_table(registry, table, |kind, entry| {
            let mut params = entry.params.clone();
            if kind == MODEL_CHECKPOINT {
                params.insert(
                    Value::from("dirpath"),
                    Value::from(checkpoint_dir.to_string_lossy().into_owned()),
                );
            }
            registry.create(kind, params)
        })
    }

    /// Experiment dirs, callbacks, logger and trainer; counters restored from
    /// `explicit_checkpoint_path` when that file exists
    pub fn build_trainer(&self, config: &TrainingConfig, config_path: &Path) -> Result<Trainer> {
        let dirs = exp_manager(config_path)?;

        let callbacks_table = config.load_table(config.callbacks.as_ref())?;
        let callbacks = self.build_callbacks(&callbacks_table, &dirs.checkpoints)?;

        let logger = JsonlLogger::new(&dirs.logs)?;
        self.record("Logger", "JsonlLogger", Outcome::Created);

        let mut trainer = Trainer::new(config.trainer.clone(), Box::new(logger), callbacks)?;
        self.record("Trainer", "Trainer", Outcome::Created);

        if let Some(checkpoint) = config.explicit_checkpoint() {
            if checkpoint.is_file() {
                let counters = read_checkpoint_counters(&checkpoint)?;
                trainer.resume_from_counters(counters);
            } else {
                tracing::warn!(
                    "Checkpoint {} does not exist, starting from scratch",
                    checkpoint.display()
                );
            }
        }
        Ok(trainer)
    }

    /// Subsets and loaders for train / val / id_val / test
    pub fn build_dataloaders(
        &self,
        data: Option<&DataConfig>,
        base_dir: &Path,
        augmentor: Option<Arc<AudioAugmentor>>,
        seed: u64,
    ) -> Result<SplitLoaders> {
        let data = data.ok_or_else(|| ConfigError::Missing("data".into()))?;
        let params = &data.params;
        if params.train_bs == 0 {
            return Err(ConfigError::invalid("data.params.train_bs", "must be at least 1").into());
        }
        if params.eval_bs == 0 {
            return Err(ConfigError::invalid("data.params.eval_bs", "must be at least 1").into());
        }

        let root_dir = resolve_path(base_dir, &data.root_dir);
        let dataset = MlsrDataset::open(&root_dir, params.sample_rate)
            .with_context(|| format!("Failed to open dataset at {}", root_dir.display()))?;

        let train_kind = if params.n_views > 1 {
            LoaderKind::MultiView {
                n_views: params.n_views,
            }
        } else {
            LoaderKind::SingleView
        };
        let train = Arc::new(dataset.get_subset("train", train_kind, augmentor)?);
        let eval_subset = |split: &str| -> Result<Arc<Subset>> {
            Ok(Arc::new(dataset.get_subset(split, LoaderKind::SingleView, None)?))
        };
        let val = eval_subset("val")?;
        let id_val = eval_subset("id_val")?;
        let test = eval_subset("test")?;

        Ok(SplitLoaders {
            train: (train.clone(), get_train_loader(train, params.train_bs, seed)),
            val: (val.clone(), get_eval_loader(val, params.eval_bs, params.num_workers)),
            id_val: (id_val.clone(), get_eval_loader(id_val, params.eval_bs, params.num_workers)),
            test: (test.clone(), get_eval_loader(test, params.eval_bs, 0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::small_dataset;
    use crate::observe::RecordingObserver;
    use shifts_ml::{BatchSource, MetricsLogger, TrainingLoop};
    use tempfile::tempdir;

    fn table(yaml: &str) -> ComponentTable {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn entry(yaml: &str) -> ComponentEntry {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_augmentor_order_and_skips() {
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);
        let augmentor = builder
            .build_augmentor(&table(
                r#"
speed:
  params: {resample_type: kaiser_fast, min_speed_rate: 0.9, max_speed_rate: 1.1}
  p: 0.5
reverb:
  params: {}
gain:
  params: {min_gain_dbfs: -10, max_gain_dbfs: 10}
white_noise:
  do_augment: false
  params: {not_a_field: 1}
"#,
            ))
            .unwrap();

        assert_eq!(augmentor.names(), vec!["speed", "gain"]);
        let domain = "Audio augmentation";
        assert_eq!(observer.kinds(domain, Outcome::Created), vec!["speed", "gain"]);
        assert_eq!(observer.kinds(domain, Outcome::NotFound), vec!["reverb"]);
        assert_eq!(observer.kinds(domain, Outcome::Disabled), vec!["white_noise"]);
    }

    #[test]
    fn test_skipped_rows_are_never_parsed() {
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);
        let augmentor = builder
            .build_augmentor(&table(
                r#"
gain:
  do_augment: false
  params: 5
  p: high
reverb:
  params: [1, 2]
  p: high
shift:
"#,
            ))
            .unwrap();

        assert_eq!(augmentor.names(), vec!["shift"]);
        let domain = "Audio augmentation";
        assert_eq!(observer.kinds(domain, Outcome::Disabled), vec!["gain"]);
        assert_eq!(observer.kinds(domain, Outcome::NotFound), vec!["reverb"]);
    }

    #[test]
    fn test_enabled_row_with_malformed_fields_names_the_entry() {
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);
        let err = builder
            .build_augmentor(&table("gain:\n  params: 5\n"))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidParams { ref kind, .. } if kind == "gain"));

        let err = builder
            .build_callbacks(&table("EarlyStopping:\n  p: high\n"), Path::new("ckpts"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("EarlyStopping"));
    }

    #[test]
    fn test_spec_augmentor_invalid_params_fail() {
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);
        let err = builder
            .build_spec_augmentor(&table("freq_mask:\n  params: {freq_masks: 2, bogus: 1}\n"))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidParams { ref kind, .. } if kind == "freq_mask"));

        let err = builder
            .build_spec_augmentor(&table("time_mask:\n  params: {}\n  p: 1.5\n"))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let compose = builder
            .build_spec_augmentor(&table("freq_mask:\n  params: {freq_masks: 2, freq_width: 4}\ntime_mask:\n  params: {}\n"))
            .unwrap();
        assert_eq!(compose.names(), vec!["freq_mask", "time_mask"]);
    }

    #[test]
    fn test_eval_preprocessor_disables_dither() {
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);
        let cfg = entry("type: mel\nparams: {features: 40, dither: 0.5}\n");

        let train = builder.build_preprocessor(Some(&cfg), false).unwrap();
        let eval = builder.build_preprocessor(Some(&cfg), true).unwrap();
        assert_eq!(train.dither(), 0.5);
        assert_eq!(eval.dither(), 0.0);
        assert_eq!(eval.features(), 40);
    }

    #[test]
    fn test_preprocessor_errors() {
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);

        let err = builder.build_preprocessor(None, false).err().unwrap();
        assert!(matches!(err, ConfigError::Missing(ref s) if s == "preprocessor"));

        let err = builder
            .build_preprocessor(Some(&entry("type: wav2vec\n")), false)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::UnknownType { ref kind, .. } if kind == "wav2vec"));
    }

    #[test]
    fn test_loss() {
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);
        let loss = builder
            .build_loss(Some(&entry("type: aam_softmax\nparams: {scale: 30, margin: 0.2}\n")))
            .unwrap();
        assert_eq!(loss.name(), "aam_softmax");
        assert!(matches!(
            builder.build_loss(None).err().unwrap(),
            ConfigError::Missing(_)
        ));
    }

    fn write_external(dir: &Path, classifier_block: &str) {
        std::fs::write(
            dir.join("model.yaml"),
            format!(
                "featurizer:\n  feat_in: 40\n  channels: 16\n  emb_dim: 192\n{}",
                classifier_block
            ),
        )
        .unwrap();
    }

    fn model_spec(yaml: &str) -> ModelSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_model_spec_params_override_external() {
        let dir = tempdir().unwrap();
        write_external(dir.path(), "classifier:\n  feat_in: 256\n  num_classes: 3\n  seed: 5\n");
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);

        let spec = model_spec(
            "featurizer_type: stats_pool\nclassifier_type: linear\nexternal_config_path: model.yaml\nparams:\n  feat_in: 192\n",
        );
        let (featurizer, classifier) = builder.build_model(Some(&spec), dir.path(), 7).unwrap();
        let classifier = classifier.unwrap();
        assert_eq!(featurizer.embedding_dim(), 192);
        assert_eq!(classifier.feat_in(), 192);
        assert_eq!(classifier.num_classes(), 7);

        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].detail.as_deref(), Some("num_classes=7"));
    }

    #[test]
    fn test_featurizer_only_ignores_classifier_block() {
        let dir = tempdir().unwrap();
        write_external(dir.path(), "classifier:\n  garbage: true\n");
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);

        let spec = model_spec("featurizer_type: stats_pool\nparams:\n  cfg_path: model.yaml\n");
        let (_, classifier) = builder.build_model(Some(&spec), dir.path(), 3).unwrap();
        assert!(classifier.is_none());
        assert!(observer.kinds("Classifier", Outcome::Created).is_empty());
    }

    #[test]
    fn test_only_model_checkpoint_gets_dirpath() {
        let dir = tempdir().unwrap();
        let ckpt_dir = dir.path().join("ckpts");
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);

        // EarlyStopping rejects unknown fields, so an injected dirpath would fail here
        let callbacks = builder
            .build_callbacks(
                &table(
                    r#"
ModelCheckpoint:
  params: {dirpath: /elsewhere, monitor: val_eer}
EarlyStopping:
  params: {monitor: val_eer, patience: 2}
LearningRateMonitor:
  do_callback: false
Unknown:
  params: {}
"#,
                ),
                &ckpt_dir,
            )
            .unwrap();
        let names: Vec<_> = callbacks.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["ModelCheckpoint", "EarlyStopping"]);
        assert_eq!(observer.kinds("Callback", Outcome::NotFound), vec!["Unknown"]);

        let logger = JsonlLogger::new(&dir.path().join("logs")).unwrap();
        let mut callbacks = callbacks;
        callbacks[0]
            .on_fit_start(&Default::default(), &logger)
            .unwrap();
        assert!(ckpt_dir.is_dir());
        assert!(!Path::new("/elsewhere").exists());
    }

    fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
        let path = dir.join("train.yaml");
        std::fs::write(
            &path,
            format!(
                "trainer:\n  max_epochs: 1\ncallbacks:\n  EarlyStopping:\n    params: {{patience: 1}}\n{}",
                extra
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_trainer_resumes_only_from_existing_checkpoint() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("resume.ckpt"),
            r#"{"global_step": 120, "epoch": 4, "state_dict": {}}"#,
        )
        .unwrap();
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);

        let path = write_config(dir.path(), "explicit_checkpoint_path: resume.ckpt\n");
        let config = TrainingConfig::load(&path).unwrap();
        let trainer = builder.build_trainer(&config, &path).unwrap();
        assert_eq!(trainer.state().global_step, 120);
        assert_eq!(trainer.state().current_epoch, 4);
        assert_eq!(trainer.callback_names(), vec!["EarlyStopping"]);
        assert!(trainer.logger().save_dir().is_dir());

        let path = write_config(dir.path(), "explicit_checkpoint_path: missing.ckpt\n");
        let config = TrainingConfig::load(&path).unwrap();
        let trainer = builder.build_trainer(&config, &path).unwrap();
        assert_eq!(trainer.state().global_step, 0);
        assert_eq!(trainer.state().current_epoch, 0);
    }

    #[test]
    fn test_dataloaders() {
        let root = small_dataset();
        let observer = RecordingObserver::new();
        let builder = ComponentBuilder::standard(&observer);
        let data: DataConfig = serde_yaml::from_str(&format!(
            "root_dir: {}\nparams: {{n_views: 2, train_bs: 2, eval_bs: 2, num_workers: 3}}\n",
            root.path().display()
        ))
        .unwrap();

        let loaders = builder
            .build_dataloaders(Some(&data), Path::new("."), Some(Arc::new(AudioAugmentor::default())), 1)
            .unwrap();
        assert_eq!(loaders.train.0.kind(), LoaderKind::MultiView { n_views: 2 });
        assert!(loaders.train.0.has_augmentor());
        assert!(!loaders.val.0.has_augmentor());
        assert_eq!(loaders.val.0.kind(), LoaderKind::SingleView);
        assert_eq!(loaders.train.0.num_classes(), 3);
        assert_eq!(loaders.train.1.num_batches(), 2);
        assert_eq!(loaders.train.1.batch(0, 0).unwrap().len(), 4);
        assert_eq!(loaders.test.1.num_batches(), 1);

        assert!(matches!(
            builder
                .build_dataloaders(None, Path::new("."), None, 1)
                .err()
                .unwrap()
                .downcast_ref::<ConfigError>(),
            Some(ConfigError::Missing(_))
        ));
    }
}
