//! Training component traits

use anyhow::Result;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Named scalar metrics, ordered by name
pub type Metrics = BTreeMap<String, f64>;

/// Loop counters owned by the trainer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    pub global_step: usize,
    pub current_epoch: usize,
}

/// One batch of decoded utterances
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub audio: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.audio.len()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
    }
}

/// Indexed source of batches
pub trait BatchSource: Send + Sync {
    /// Number of batches per epoch
    fn num_batches(&self) -> usize;

    /// Decode batch `index` of `epoch`
    fn batch(&self, epoch: usize, index: usize) -> Result<Batch>;
}

/// Trait for utterance-level embedding extractors
pub trait Featurizer: Send + Sync {
    /// Featurizer name
    fn name(&self) -> &'static str;

    /// Expected feature dimension of the input spectrogram
    fn feat_in(&self) -> usize;

    /// Embedding dimension
    fn embedding_dim(&self) -> usize;

    /// Map a `(features, frames)` spectrogram to one embedding
    fn embed(&self, features: &Array2<f32>) -> Result<Array1<f32>>;
}

/// Trait for trainable classification heads
pub trait Classifier: Send + Sync {
    /// Classifier name
    fn name(&self) -> &'static str;

    /// Expected embedding dimension
    fn feat_in(&self) -> usize;

    fn num_classes(&self) -> usize;

    /// `(batch, emb_dim)` embeddings to `(batch, num_classes)` logits
    fn forward(&self, embeddings: &Array2<f32>) -> Array2<f32>;

    /// Gradients w.r.t. each parameter, in `parameters()` order
    fn gradients(&self, embeddings: &Array2<f32>, grad_logits: &Array2<f32>) -> Vec<Array2<f32>>;

    fn parameters(&self) -> Vec<&Array2<f32>>;

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>>;
}

/// Loss value and its gradient w.r.t. the logits
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub value: f32,
    pub grad: Array2<f32>,
}

/// Trait for classification losses
pub trait Loss: Send + Sync {
    /// Loss name
    fn name(&self) -> &'static str;

    /// Mean loss over the batch
    fn forward(&self, logits: &Array2<f32>, labels: &[usize]) -> Result<LossOutput>;
}

/// Trait for metric sinks
pub trait MetricsLogger: Send + Sync {
    fn name(&self) -> &'static str;

    fn save_dir(&self) -> &Path;

    fn log_hyperparams(&self, params: &serde_yaml::Value) -> Result<()>;

    fn log_metrics(&self, metrics: &Metrics, step: usize) -> Result<()>;

    fn finalize(&self) -> Result<()> {
        Ok(())
    }
}

/// The model side of the training loop
pub trait TrainingModule {
    /// Build optimizer state and LR schedule for `total_steps`, starting at `start_step`
    fn configure_optimizers(&mut self, total_steps: usize, start_step: usize) -> Result<()>;

    fn num_train_batches(&self) -> usize;

    fn training_step(&mut self, state: &LoopState, batch_idx: usize) -> Result<Metrics>;

    fn validation_epoch(&mut self, state: &LoopState) -> Result<Metrics>;

    /// Learning rate of the next step
    fn current_lr(&self) -> f32;

    /// Serializable trainable state
    fn state_dict(&self) -> serde_json::Value;
}

/// Hooks invoked by the training loop
pub trait Callback: Send {
    fn name(&self) -> &'static str;

    fn on_fit_start(&mut self, _state: &LoopState, _logger: &dyn MetricsLogger) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _state: &LoopState,
        _metrics: &Metrics,
        _module: &dyn TrainingModule,
        _logger: &dyn MetricsLogger,
    ) -> Result<()> {
        Ok(())
    }

    fn on_train_epoch_end(
        &mut self,
        _state: &LoopState,
        _module: &dyn TrainingModule,
        _logger: &dyn MetricsLogger,
    ) -> Result<()> {
        Ok(())
    }

    fn on_validation_end(
        &mut self,
        _state: &LoopState,
        _metrics: &Metrics,
        _module: &dyn TrainingModule,
    ) -> Result<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _state: &LoopState, _module: &dyn TrainingModule) -> Result<()> {
        Ok(())
    }

    /// Request the loop to stop after the current epoch
    fn should_stop(&self) -> bool {
        false
    }
}
