//! Speaker embedding model
//!
//! Waveform → preprocessor → (train only) spectrogram augmentation →
//! featurizer → classifier → loss. Only the classifier head is trained;
//! the featurizer is a fixed extractor.

use anyhow::{Context, Result};
use ndarray::{stack, Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use shifts_audio::{Compose, Preprocessor};
use shifts_types::OptimizerConfig;

use crate::lr_scheduler::{build_scheduler, LRScheduler};
use crate::metrics::pairwise_eer;
use crate::optim::Sgd;
use crate::traits::{
    BatchSource, Classifier, Featurizer, LoopState, Loss, Metrics, TrainingModule,
};

/// Loaders consumed by `fit`
pub struct DataLoaders {
    pub train: Box<dyn BatchSource>,
    pub val: Box<dyn BatchSource>,
    pub id_val: Box<dyn BatchSource>,
}

pub struct SpeakerEmbeddingModel {
    preprocessor: Box<dyn Preprocessor>,
    eval_preprocessor: Option<Box<dyn Preprocessor>>,
    spec_augmentor: Compose,
    featurizer: Box<dyn Featurizer>,
    classifier: Option<Box<dyn Classifier>>,
    loss: Box<dyn Loss>,
    optim_config: OptimizerConfig,
    optimizer: Sgd,
    scheduler: Box<dyn LRScheduler>,
    rng: StdRng,
    loaders: Option<DataLoaders>,
}

fn embed_utterance(
    preprocessor: &dyn Preprocessor,
    spec_augmentor: Option<&Compose>,
    featurizer: &dyn Featurizer,
    audio: &[f32],
    rng: &mut dyn RngCore,
) -> Result<Array1<f32>> {
    let mut features = preprocessor.process(audio, rng)?;
    if let Some(augmentor) = spec_augmentor {
        augmentor.apply(&mut features, rng);
    }
    featurizer.embed(&features)
}

fn stack_rows(rows: &[Array1<f32>]) -> Result<Array2<f32>> {
    let views: Vec<ArrayView1<f32>> = rows.iter().map(|r| r.view()).collect();
    Ok(stack(Axis(0), &views)?)
}

fn accuracy(logits: &Array2<f32>, labels: &[usize]) -> f64 {
    let correct = logits
        .axis_iter(Axis(0))
        .zip(labels)
        .filter(|(row, &label)| {
            let predicted = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i);
            predicted == Some(label)
        })
        .count();
    correct as f64 / labels.len().max(1) as f64
}

impl SpeakerEmbeddingModel {
    pub fn new(
        preprocessor: Box<dyn Preprocessor>,
        spec_augmentor: Compose,
        featurizer: Box<dyn Featurizer>,
        classifier: Option<Box<dyn Classifier>>,
        loss: Box<dyn Loss>,
        optim_config: OptimizerConfig,
    ) -> Result<Self> {
        if preprocessor.features() != featurizer.feat_in() {
            anyhow::bail!(
                "Preprocessor produces {} features but featurizer {} expects {}",
                preprocessor.features(),
                featurizer.name(),
                featurizer.feat_in()
            );
        }
        if let Some(classifier) = &classifier {
            if classifier.feat_in() != featurizer.embedding_dim() {
                anyhow::bail!(
                    "Classifier {} expects {}-dim embeddings, featurizer produces {}",
                    classifier.name(),
                    classifier.feat_in(),
                    featurizer.embedding_dim()
                );
            }
        }

        tracing::info!(
            "SpeakerEmbeddingModel: {} → {} → {} ({} spec augmentations)",
            preprocessor.name(),
            featurizer.name(),
            classifier.as_ref().map_or("no classifier", |c| c.name()),
            spec_augmentor.len()
        );

        Ok(Self {
            optimizer: Sgd::from_config(&optim_config),
            scheduler: build_scheduler(None, optim_config.lr, 0),
            preprocessor,
            eval_preprocessor: None,
            spec_augmentor,
            featurizer,
            classifier,
            loss,
            optim_config,
            rng: StdRng::from_entropy(),
            loaders: None,
        })
    }

    /// Preprocessor used for validation and embedding extraction
    pub fn with_eval_preprocessor(mut self, preprocessor: Box<dyn Preprocessor>) -> Result<Self> {
        if preprocessor.features() != self.featurizer.feat_in() {
            anyhow::bail!(
                "Eval preprocessor produces {} features, expected {}",
                preprocessor.features(),
                self.featurizer.feat_in()
            );
        }
        self.eval_preprocessor = Some(preprocessor);
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn setup_dataloaders(&mut self, loaders: DataLoaders) {
        tracing::info!(
            "Dataloaders: {} train / {} val / {} id_val batches",
            loaders.train.num_batches(),
            loaders.val.num_batches(),
            loaders.id_val.num_batches()
        );
        self.loaders = Some(loaders);
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    /// Embedding of one waveform, without augmentation
    pub fn extract_embedding(&mut self, audio: &[f32]) -> Result<Array1<f32>> {
        let preprocessor = self
            .eval_preprocessor
            .as_deref()
            .unwrap_or(self.preprocessor.as_ref());
        embed_utterance(preprocessor, None, self.featurizer.as_ref(), audio, &mut self.rng)
    }

    /// Embeddings and labels of every utterance in `source`
    fn collect_embeddings(
        &mut self,
        source: &dyn BatchSource,
    ) -> Result<(Vec<Array1<f32>>, Vec<usize>)> {
        let mut embeddings = Vec::new();
        let mut labels = Vec::new();
        for index in 0..source.num_batches() {
            let batch = source.batch(0, index)?;
            for (audio, &label) in batch.audio.iter().zip(&batch.labels) {
                embeddings.push(self.extract_embedding(audio)?);
                labels.push(label);
            }
        }
        Ok((embeddings, labels))
    }

    /// Classification loss and accuracy over labels known to the classifier
    fn in_vocabulary_scores(
        &self,
        embeddings: &[Array1<f32>],
        labels: &[usize],
    ) -> Result<Option<(f64, f64)>> {
        let Some(classifier) = &self.classifier else {
            return Ok(None);
        };
        let (rows, known): (Vec<Array1<f32>>, Vec<usize>) = embeddings
            .iter()
            .zip(labels)
            .filter(|(_, &l)| l < classifier.num_classes())
            .map(|(e, &l)| (e.clone(), l))
            .unzip();
        if rows.is_empty() {
            return Ok(None);
        }

        let logits = classifier.forward(&stack_rows(&rows)?);
        let loss = self.loss.forward(&logits, &known)?;
        Ok(Some((loss.value as f64, accuracy(&logits, &known))))
    }
}

impl TrainingModule for SpeakerEmbeddingModel {
    fn configure_optimizers(&mut self, total_steps: usize, start_step: usize) -> Result<()> {
        self.optimizer = Sgd::from_config(&self.optim_config);
        self.scheduler = build_scheduler(
            self.optim_config.sched.as_ref(),
            self.optim_config.lr,
            total_steps,
        );
        self.scheduler.set_step(start_step);
        tracing::info!(
            "Optimizer: SGD lr={} momentum={} weight_decay={} over {} steps (start {})",
            self.optim_config.lr,
            self.optim_config.momentum,
            self.optim_config.weight_decay,
            total_steps,
            start_step
        );
        Ok(())
    }

    fn num_train_batches(&self) -> usize {
        self.loaders.as_ref().map_or(0, |l| l.train.num_batches())
    }

    fn training_step(&mut self, state: &LoopState, batch_idx: usize) -> Result<Metrics> {
        let loaders = self.loaders.as_ref().context("Dataloaders are not set up")?;
        let classifier = self
            .classifier
            .as_mut()
            .context("Model has no classifier head, nothing to train")?;

        let batch = loaders.train.batch(state.current_epoch, batch_idx)?;
        if batch.is_empty() {
            anyhow::bail!("Training batch {} is empty", batch_idx);
        }

        let embeddings = batch
            .audio
            .iter()
            .map(|audio| {
                embed_utterance(
                    self.preprocessor.as_ref(),
                    Some(&self.spec_augmentor),
                    self.featurizer.as_ref(),
                    audio,
                    &mut self.rng,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let embeddings = stack_rows(&embeddings)?;

        let logits = classifier.forward(&embeddings);
        let loss = self.loss.forward(&logits, &batch.labels)?;
        let grads = classifier.gradients(&embeddings, &loss.grad);

        let lr = self.scheduler.get_lr();
        self.optimizer.step(classifier.parameters_mut(), grads, lr)?;
        self.scheduler.step();

        let mut metrics = Metrics::new();
        metrics.insert("train_loss".to_string(), loss.value as f64);
        metrics.insert("train_acc".to_string(), accuracy(&logits, &batch.labels));
        metrics.insert("lr".to_string(), lr as f64);
        Ok(metrics)
    }

    fn validation_epoch(&mut self, state: &LoopState) -> Result<Metrics> {
        let loaders = self.loaders.take().context("Dataloaders are not set up")?;
        let result = (|| -> Result<Metrics> {
            let mut metrics = Metrics::new();
            for (prefix, source) in [("val", &loaders.val), ("id_val", &loaders.id_val)] {
                let (embeddings, labels) = self.collect_embeddings(source.as_ref())?;
                match pairwise_eer(&embeddings, &labels) {
                    Some(eer) => {
                        metrics.insert(format!("{}_eer", prefix), eer);
                    }
                    None => tracing::warn!(
                        "{}: need both same- and different-speaker pairs for EER",
                        prefix
                    ),
                }
                if prefix == "id_val" {
                    if let Some((loss, acc)) = self.in_vocabulary_scores(&embeddings, &labels)? {
                        metrics.insert("id_val_loss".to_string(), loss);
                        metrics.insert("id_val_acc".to_string(), acc);
                    }
                }
            }
            tracing::info!("Validation at epoch {}: {:?}", state.current_epoch, metrics);
            Ok(metrics)
        })();
        self.loaders = Some(loaders);
        result
    }

    fn current_lr(&self) -> f32 {
        self.scheduler.get_lr()
    }

    fn state_dict(&self) -> serde_json::Value {
        let classifier = self.classifier.as_ref().map(|c| {
            let parameters: Vec<Vec<Vec<f32>>> = c
                .parameters()
                .iter()
                .map(|p| p.rows().into_iter().map(|r| r.to_vec()).collect())
                .collect();
            serde_json::json!({
                "name": c.name(),
                "num_classes": c.num_classes(),
                "parameters": parameters,
            })
        });
        serde_json::json!({
            "preprocessor": self.preprocessor.name(),
            "featurizer": self.featurizer.name(),
            "classifier": classifier,
            "lr": self.scheduler.get_lr(),
            "scheduler_step": self.scheduler.current_step(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{LinearClassifier, LinearClassifierParams};
    use crate::featurizer::StatsPoolingFeaturizer;
    use crate::loss::{CrossEntropyLoss, CrossEntropyParams};
    use crate::traits::Batch;
    use shifts_audio::AudioToMelSpectrogramPreprocessor;
    use shifts_types::FromParams;

    /// Two synthetic speakers: low and high tones
    struct ToneSource {
        batches: usize,
    }

    fn tone(freq: f32, phase: f32) -> Vec<f32> {
        (0..4000)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / 16000.0 + phase).sin())
            .collect()
    }

    impl BatchSource for ToneSource {
        fn num_batches(&self) -> usize {
            self.batches
        }

        fn batch(&self, _epoch: usize, index: usize) -> Result<Batch> {
            let phase = index as f32 * 0.3;
            Ok(Batch {
                audio: vec![tone(300.0, phase), tone(2500.0, phase)],
                labels: vec![0, 1],
            })
        }
    }

    fn model(with_classifier: bool) -> SpeakerEmbeddingModel {
        let preprocessor = AudioToMelSpectrogramPreprocessor::from_params(
            serde_yaml::from_str("features: 16\ndither: 0.0\nnormalize: none").unwrap(),
        )
        .unwrap();
        let featurizer = StatsPoolingFeaturizer::from_params(
            serde_yaml::from_str("feat_in: 16\nchannels: 32\nemb_dim: 8").unwrap(),
        )
        .unwrap();
        let classifier = with_classifier.then(|| {
            Box::new(
                LinearClassifier::from_params(LinearClassifierParams {
                    feat_in: 8,
                    num_classes: 2,
                    bias: true,
                    seed: 0,
                })
                .unwrap(),
            ) as Box<dyn Classifier>
        });
        let loss = CrossEntropyLoss::from_params(CrossEntropyParams::default()).unwrap();
        let optim: OptimizerConfig =
            serde_yaml::from_str("lr: 0.01\nmomentum: 0.0\nweight_decay: 0.0").unwrap();

        SpeakerEmbeddingModel::new(
            Box::new(preprocessor),
            Compose::default(),
            Box::new(featurizer),
            classifier,
            Box::new(loss),
            optim,
        )
        .unwrap()
        .with_seed(0)
    }

    fn loaders() -> DataLoaders {
        DataLoaders {
            train: Box::new(ToneSource { batches: 4 }),
            val: Box::new(ToneSource { batches: 2 }),
            id_val: Box::new(ToneSource { batches: 2 }),
        }
    }

    #[test]
    fn test_training_separates_speakers() {
        let mut model = model(true);
        model.setup_dataloaders(loaders());
        model.configure_optimizers(40, 0).unwrap();

        let mut state = LoopState::default();
        let mut last = Metrics::new();
        for step in 0..40 {
            state.global_step = step;
            last = model.training_step(&state, step % 4).unwrap();
        }
        assert!(last["train_loss"] < 0.1, "final loss {}", last["train_loss"]);
        assert_eq!(last["train_acc"], 1.0);
        assert!((last["lr"] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_validation_metrics() {
        let mut model = model(true);
        model.setup_dataloaders(loaders());
        let metrics = model.validation_epoch(&LoopState::default()).unwrap();
        for key in ["val_eer", "id_val_eer", "id_val_loss", "id_val_acc"] {
            assert!(metrics.contains_key(key), "missing {}", key);
        }
        // Loaders are restored after validation
        assert_eq!(model.num_train_batches(), 4);
    }

    #[test]
    fn test_featurizer_only_model() {
        let mut model = model(false);
        assert!(!model.has_classifier());
        model.setup_dataloaders(loaders());
        assert!(model.training_step(&LoopState::default(), 0).is_err());

        let emb = model.extract_embedding(&tone(440.0, 0.0)).unwrap();
        assert_eq!(emb.len(), 8);
        let metrics = model.validation_epoch(&LoopState::default()).unwrap();
        assert!(!metrics.contains_key("id_val_loss"));
    }

    #[test]
    fn test_state_dict_contains_parameters() {
        let model = model(true);
        let state = model.state_dict();
        assert_eq!(state["classifier"]["name"], "linear");
        assert_eq!(state["classifier"]["parameters"][0].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_feature_mismatch_rejected() {
        let preprocessor = AudioToMelSpectrogramPreprocessor::from_params(
            serde_yaml::from_str("features: 20").unwrap(),
        )
        .unwrap();
        let featurizer = StatsPoolingFeaturizer::from_params(
            serde_yaml::from_str("feat_in: 16").unwrap(),
        )
        .unwrap();
        let loss = CrossEntropyLoss::from_params(CrossEntropyParams::default()).unwrap();
        let result = SpeakerEmbeddingModel::new(
            Box::new(preprocessor),
            Compose::default(),
            Box::new(featurizer),
            None,
            Box::new(loss),
            OptimizerConfig::default(),
        );
        assert!(result.is_err());
    }
}
