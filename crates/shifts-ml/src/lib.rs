//! Training components for speech-shifts
//!
//! Provides featurizers, classifiers, losses, the SGD optimizer and LR schedules,
//! verification metrics, callbacks, metric logging, the speaker embedding model
//! and the training loop.

pub mod callbacks;
pub mod classifier;
pub mod featurizer;
pub mod logger;
pub mod loss;
pub mod lr_scheduler;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod trainer;
pub mod traits;

pub use callbacks::{
    read_checkpoint_counters, CheckpointRecord, EarlyStopping, LearningRateMonitor,
    ModelCheckpoint, Mode,
};
pub use classifier::{CosineClassifier, LinearClassifier};
pub use featurizer::{Pooling, StatsPoolingFeaturizer};
pub use logger::JsonlLogger;
pub use loss::{AamSoftmaxLoss, CrossEntropyLoss};
pub use lr_scheduler::{build_scheduler, CosineScheduler, LRScheduler, WarmupScheduler};
pub use metrics::{compute_eer, cosine_similarity, pairwise_eer};
pub use model::{DataLoaders, SpeakerEmbeddingModel};
pub use optim::Sgd;
pub use trainer::{Trainer, TrainingLoop};
pub use traits::{
    Batch, BatchSource, Callback, Classifier, Featurizer, LoopState, Loss, LossOutput, Metrics,
    MetricsLogger, TrainingModule,
};
