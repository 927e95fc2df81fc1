//! Built-in component registries
//!
//! Populated once on first use and never mutated afterwards.

use shifts_audio::{
    AudioToMFCCPreprocessor, AudioToMelSpectrogramPreprocessor, FrequencyMasking,
    GainPerturbation, Perturbation, Preprocessor, ShiftPerturbation, SpectrogramPerturbation,
    SpeedPerturbation, TimeMasking, WhiteNoisePerturbation,
};
use shifts_ml::{
    AamSoftmaxLoss, Callback, Classifier, CosineClassifier, CrossEntropyLoss, EarlyStopping,
    Featurizer, LearningRateMonitor, LinearClassifier, Loss, ModelCheckpoint,
    StatsPoolingFeaturizer,
};
use std::sync::OnceLock;

use crate::registry::Registry;

/// Callback type that receives the checkpoint directory as `dirpath`
pub const MODEL_CHECKPOINT: &str = "ModelCheckpoint";

/// One registry per component domain
pub struct Registries {
    pub audio_augmentations: Registry<dyn Perturbation>,
    pub spec_augmentations: Registry<dyn SpectrogramPerturbation>,
    pub preprocessors: Registry<dyn Preprocessor>,
    pub losses: Registry<dyn Loss>,
    pub featurizers: Registry<dyn Featurizer>,
    pub classifiers: Registry<dyn Classifier>,
    pub callbacks: Registry<dyn Callback>,
}

static STANDARD: OnceLock<Registries> = OnceLock::new();

impl Registries {
    /// Process-wide registries with every built-in component
    pub fn standard() -> &'static Registries {
        STANDARD.get_or_init(Registries::build)
    }

    fn build() -> Self {
        Self {
            audio_augmentations: Registry::<dyn Perturbation>::new("Audio augmentation")
                .with::<GainPerturbation>("gain", |c| Box::new(c))
                .with::<WhiteNoisePerturbation>("white_noise", |c| Box::new(c))
                .with::<ShiftPerturbation>("shift", |c| Box::new(c))
                .with::<SpeedPerturbation>("speed", |c| Box::new(c)),
            spec_augmentations: Registry::<dyn SpectrogramPerturbation>::new("Spectrogram augmentation")
                .with::<FrequencyMasking>("freq_mask", |c| Box::new(c))
                .with::<TimeMasking>("time_mask", |c| Box::new(c)),
            preprocessors: Registry::<dyn Preprocessor>::new("Preprocessor")
                .with::<AudioToMelSpectrogramPreprocessor>("mel", |c| Box::new(c))
                .with::<AudioToMFCCPreprocessor>("mfcc", |c| Box::new(c)),
            losses: Registry::<dyn Loss>::new("Loss function")
                .with::<CrossEntropyLoss>("cross_entropy", |c| Box::new(c))
                .with::<AamSoftmaxLoss>("aam_softmax", |c| Box::new(c)),
            featurizers: Registry::<dyn Featurizer>::new("Featurizer")
                .with::<StatsPoolingFeaturizer>("stats_pool", |c| Box::new(c)),
            classifiers: Registry::<dyn Classifier>::new("Classifier")
                .with::<LinearClassifier>("linear", |c| Box::new(c))
                .with::<CosineClassifier>("cosine", |c| Box::new(c)),
            callbacks: Registry::<dyn Callback>::new("Callback")
                .with::<ModelCheckpoint>(MODEL_CHECKPOINT, |c| Box::new(c))
                .with::<EarlyStopping>("EarlyStopping", |c| Box::new(c))
                .with::<LearningRateMonitor>("LearningRateMonitor", |c| Box::new(c)),
        }
    }
}
