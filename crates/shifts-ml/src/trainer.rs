//! Epoch/step training loop controller

use anyhow::Result;
use shifts_types::TrainerConfig;

use crate::traits::{Callback, LoopState, Metrics, MetricsLogger, TrainingModule};

/// Something that can drive a `TrainingModule` to completion
pub trait TrainingLoop {
    fn fit(&mut self, module: &mut dyn TrainingModule) -> Result<()>;

    fn state(&self) -> LoopState;
}

pub struct Trainer {
    config: TrainerConfig,
    logger: Box<dyn MetricsLogger>,
    callbacks: Vec<Box<dyn Callback>>,
    state: LoopState,
}

impl Trainer {
    pub fn new(
        config: TrainerConfig,
        logger: Box<dyn MetricsLogger>,
        callbacks: Vec<Box<dyn Callback>>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            "Trainer: max_epochs={} max_steps={} callbacks={:?}",
            config.max_epochs,
            config.max_steps,
            callbacks.iter().map(|c| c.name()).collect::<Vec<_>>()
        );
        Ok(Self {
            config,
            logger,
            callbacks,
            state: LoopState::default(),
        })
    }

    /// Overwrite the loop counters, e.g. from a checkpoint
    pub fn resume_from_counters(&mut self, counters: LoopState) {
        tracing::info!(
            "Resuming from global_step={} epoch={}",
            counters.global_step,
            counters.current_epoch
        );
        self.state = counters;
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn logger(&self) -> &dyn MetricsLogger {
        self.logger.as_ref()
    }

    pub fn callback_names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }

    fn steps_exhausted(&self) -> bool {
        self.config.max_steps > 0 && self.state.global_step >= self.config.max_steps
    }

    fn epochs_exhausted(&self) -> bool {
        self.config.max_epochs > 0 && self.state.current_epoch >= self.config.max_epochs
    }

    fn run_validation(&mut self, module: &mut dyn TrainingModule) -> Result<bool> {
        let metrics = module.validation_epoch(&self.state)?;
        self.logger.log_metrics(&metrics, self.state.global_step)?;
        for callback in self.callbacks.iter_mut() {
            callback.on_validation_end(&self.state, &metrics, &*module)?;
        }
        Ok(self.callbacks.iter().any(|c| c.should_stop()))
    }
}

impl TrainingLoop for Trainer {
    fn fit(&mut self, module: &mut dyn TrainingModule) -> Result<()> {
        let available = module.num_train_batches();
        let batches_per_epoch = match self.config.limit_train_batches {
            0 => available,
            limit => limit.min(available),
        };
        if batches_per_epoch == 0 {
            anyhow::bail!("Training loader is empty");
        }

        let total_steps = if self.config.max_steps > 0 {
            self.config.max_steps
        } else {
            self.config.max_epochs * batches_per_epoch
        };
        module.configure_optimizers(total_steps, self.state.global_step)?;

        for callback in self.callbacks.iter_mut() {
            callback.on_fit_start(&self.state, self.logger.as_ref())?;
        }
        tracing::info!(
            "Starting training: {} batches/epoch, {} total steps, from step {} epoch {}",
            batches_per_epoch,
            total_steps,
            self.state.global_step,
            self.state.current_epoch
        );

        let mut stop = false;
        while !stop && !self.epochs_exhausted() && !self.steps_exhausted() {
            let mut epoch_loss = 0.0;
            let mut epoch_batches = 0usize;

            for batch_idx in 0..batches_per_epoch {
                let mut metrics = module.training_step(&self.state, batch_idx)?;
                self.state.global_step += 1;
                epoch_loss += metrics.get("train_loss").copied().unwrap_or(0.0);
                epoch_batches += 1;

                if self.state.global_step % self.config.log_every_n_steps == 0 {
                    metrics.insert("epoch".to_string(), self.state.current_epoch as f64);
                    self.logger.log_metrics(&metrics, self.state.global_step)?;
                    tracing::info!(
                        "Epoch {} step {}: loss={:.4}",
                        self.state.current_epoch,
                        self.state.global_step,
                        metrics.get("train_loss").copied().unwrap_or(f64::NAN)
                    );
                }
                for callback in self.callbacks.iter_mut() {
                    callback.on_train_batch_end(
                        &self.state,
                        &metrics,
                        &*module,
                        self.logger.as_ref(),
                    )?;
                }
                if self.steps_exhausted() {
                    break;
                }
            }

            for callback in self.callbacks.iter_mut() {
                callback.on_train_epoch_end(&self.state, &*module, self.logger.as_ref())?;
            }
            let mut epoch_metrics = Metrics::new();
            epoch_metrics.insert(
                "train_loss_epoch".to_string(),
                epoch_loss / epoch_batches.max(1) as f64,
            );
            self.logger.log_metrics(&epoch_metrics, self.state.global_step)?;

            if (self.state.current_epoch + 1) % self.config.check_val_every_n_epoch == 0 {
                stop = self.run_validation(module)?;
            }
            self.state.current_epoch += 1;
        }

        if stop {
            tracing::info!("Training stopped early by callback");
        }
        for callback in self.callbacks.iter_mut() {
            callback.on_fit_end(&self.state, &*module)?;
        }
        self.logger.finalize()?;
        tracing::info!(
            "Training finished at step {} epoch {}",
            self.state.global_step,
            self.state.current_epoch
        );
        Ok(())
    }

    fn state(&self) -> LoopState {
        self.state
    }
}
