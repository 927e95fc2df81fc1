//! End-to-end training entry point

use anyhow::{Context, Result};
use shifts_ml::{DataLoaders, SpeakerEmbeddingModel, Trainer, TrainingLoop};
use shifts_types::{read_yaml, ConfigError, TrainingConfig};
use std::path::Path;
use std::sync::Arc;

use crate::builder::ComponentBuilder;
use crate::env::setup_env_vars;
use crate::observe::{BuildObserver, TracingObserver};

/// Train from the config at `cfg_path`, logging builder decisions via tracing
pub fn train(cfg_path: Option<&Path>) -> Result<()> {
    run(cfg_path, &TracingObserver)?;
    Ok(())
}

/// Build every component, fit, and return the finished trainer
pub fn run(cfg_path: Option<&Path>, observer: &dyn BuildObserver) -> Result<Trainer> {
    let cfg_path = cfg_path.ok_or_else(|| ConfigError::Missing("--cfg".into()))?;
    let config = TrainingConfig::load(cfg_path)?;
    config.validate_required()?;
    setup_env_vars();

    tracing::info!("Training config: {}", cfg_path.display());
    let builder = ComponentBuilder::standard(observer);

    let augmentations = config.load_table(config.audio_augmentations.as_ref())?;
    let augmentor = Arc::new(builder.build_augmentor(&augmentations)?);

    let loaders = builder.build_dataloaders(
        config.data.as_ref(),
        &config.base_dir,
        Some(augmentor),
        config.trainer.seed,
    )?;
    let num_classes = loaders.train.0.num_classes();
    tracing::info!("Train split: {} utterances, {} speakers", loaders.train.0.len(), num_classes);

    let (featurizer, classifier) =
        builder.build_model(config.model.as_ref(), &config.base_dir, num_classes)?;

    let spec_augmentations = config.load_table(config.spec_augmentations.as_ref())?;
    let spec_augmentor = builder.build_spec_augmentor(&spec_augmentations)?;

    let preprocessor = builder.build_preprocessor(config.preprocessor.as_ref(), false)?;
    let eval_preprocessor = builder.build_preprocessor(config.preprocessor.as_ref(), true)?;
    let loss = builder.build_loss(config.loss.as_ref())?;

    let mut trainer = builder.build_trainer(&config, cfg_path)?;
    let hparams: serde_yaml::Value = read_yaml(cfg_path)?;
    trainer.logger().log_hyperparams(&hparams)?;

    let mut model = SpeakerEmbeddingModel::new(
        preprocessor,
        spec_augmentor,
        featurizer,
        classifier,
        loss,
        config.optimizer.clone(),
    )?
    .with_eval_preprocessor(eval_preprocessor)?
    .with_seed(config.trainer.seed);

    model.setup_dataloaders(DataLoaders {
        train: Box::new(loaders.train.1),
        val: Box::new(loaders.val.1),
        id_val: Box::new(loaders.id_val.1),
    });

    trainer.fit(&mut model).context("Training failed")?;
    Ok(trainer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::small_dataset;
    use crate::observe::{Outcome, RecordingObserver};
    use tempfile::tempdir;

    fn write_run(dir: &Path, data_root: &Path, model_section: &str) -> std::path::PathBuf {
        std::fs::write(
            dir.join("model.yaml"),
            "featurizer:\n  feat_in: 16\n  channels: 32\n  emb_dim: 8\n  seed: 3\nclassifier:\n  feat_in: 8\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("augs.yaml"),
            "gain:\n  params: {min_gain_dbfs: -3, max_gain_dbfs: 3}\n  p: 0.5\nreverb:\n  params: {}\n",
        )
        .unwrap();

        let cfg = format!(
            r#"
audio_augmentations: augs.yaml
spec_augmentations:
  time_mask:
    params: {{time_masks: 1, time_width: 2}}
    do_augment: false
preprocessor:
  type: mel
  params: {{features: 16, dither: 0.00001, normalize: none}}
loss:
  type: cross_entropy
{}
data:
  root_dir: {}
  params: {{n_views: 2, train_bs: 2, eval_bs: 2, num_workers: 2}}
optimizer:
  lr: 0.05
  sched: {{name: cosine, warmup_steps: 1}}
trainer:
  max_epochs: 2
  log_every_n_steps: 1
callbacks:
  ModelCheckpoint:
    params: {{monitor: val_eer, save_top_k: 1}}
  LearningRateMonitor:
    params: {{logging_interval: step}}
"#,
            model_section,
            data_root.display()
        );
        let path = dir.join("run.yaml");
        std::fs::write(&path, cfg).unwrap();
        path
    }

    fn run_dirs(dir: &Path) -> std::path::PathBuf {
        let runs: Vec<_> = std::fs::read_dir(dir.join("experiments").join("run"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(runs.len(), 1);
        runs[0].clone()
    }

    #[test]
    fn test_end_to_end() {
        let data = small_dataset();
        let dir = tempdir().unwrap();
        let cfg = write_run(
            dir.path(),
            data.path(),
            "model:\n  featurizer_type: stats_pool\n  classifier_type: linear\n  external_config_path: model.yaml\n",
        );

        let observer = RecordingObserver::new();
        let trainer = run(Some(&cfg), &observer).unwrap();
        assert_eq!(trainer.state().current_epoch, 2);
        assert_eq!(trainer.state().global_step, 4);

        assert_eq!(observer.kinds("Audio augmentation", Outcome::Created), vec!["gain"]);
        assert_eq!(observer.kinds("Audio augmentation", Outcome::NotFound), vec!["reverb"]);
        assert_eq!(
            observer.kinds("Spectrogram augmentation", Outcome::Disabled),
            vec!["time_mask"]
        );
        let classifier = observer
            .events()
            .into_iter()
            .find(|e| e.domain == "Classifier")
            .unwrap();
        assert_eq!(classifier.detail.as_deref(), Some("num_classes=3"));

        let run_dir = run_dirs(dir.path());
        assert!(run_dir.join("run.yaml").is_file());
        assert!(run_dir.join("logs/hparams.yaml").is_file());
        assert!(run_dir.join("checkpoints/last.ckpt").is_file());
        let metrics = std::fs::read_to_string(run_dir.join("logs/metrics.jsonl")).unwrap();
        assert!(metrics.contains("train_loss"));
        assert!(metrics.contains("val_eer"));
    }

    #[test]
    fn test_missing_cfg() {
        let err = run(None, &RecordingObserver::new()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Missing(s)) if s == "--cfg"
        ));
    }

    #[test]
    fn test_missing_section_fails_before_data() {
        let dir = tempdir().unwrap();
        // Data root does not exist: the missing model section must be reported first
        let cfg = write_run(dir.path(), &dir.path().join("no-such-root"), "");

        let observer = RecordingObserver::new();
        let err = run(Some(&cfg), &observer).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Missing(s)) if s == "model"
        ));
        assert!(observer.events().is_empty());
        assert!(!dir.path().join("experiments").exists());
    }

    #[test]
    fn test_featurizer_only_model_cannot_train() {
        let data = small_dataset();
        let dir = tempdir().unwrap();
        let cfg = write_run(
            dir.path(),
            data.path(),
            "model:\n  featurizer_type: stats_pool\n  external_config_path: model.yaml\n",
        );

        let observer = RecordingObserver::new();
        let err = run(Some(&cfg), &observer).err().unwrap();
        assert!(format!("{:#}", err).contains("no classifier"));
        assert!(observer.kinds("Classifier", Outcome::Created).is_empty());
    }
}
