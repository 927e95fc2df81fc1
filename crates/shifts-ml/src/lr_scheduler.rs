//! Learning rate schedulers

use shifts_types::SchedulerConfig;
use std::f32::consts::PI;

/// Trait for learning rate schedulers
pub trait LRScheduler: Send + Sync {
    /// Get current learning rate
    fn get_lr(&self) -> f32;

    /// Step the scheduler (call after each optimization step)
    fn step(&mut self);

    /// Get current step number
    fn current_step(&self) -> usize;

    /// Jump to `step` (used when resuming)
    fn set_step(&mut self, step: usize);
}

/// Cosine annealing scheduler with optional warmup
#[derive(Debug, Clone)]
pub struct CosineScheduler {
    base_lr: f32,
    min_lr: f32,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl CosineScheduler {
    pub fn new(base_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            min_lr: 0.0,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Set minimum learning rate
    pub fn with_min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }
}

impl LRScheduler for CosineScheduler {
    fn get_lr(&self) -> f32 {
        if self.current_step < self.warmup_steps {
            // Linear warmup
            let warmup_ratio = (self.current_step + 1) as f32 / self.warmup_steps as f32;
            self.base_lr * warmup_ratio
        } else {
            let progress = (self.current_step - self.warmup_steps) as f32
                / self.total_steps.saturating_sub(self.warmup_steps).max(1) as f32;
            let progress = progress.min(1.0);

            let decay = 0.5 * (1.0 + (PI * progress).cos());
            self.min_lr + (self.base_lr - self.min_lr) * decay
        }
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }
}

/// Linear warmup scheduler (constant LR after warmup)
#[derive(Debug, Clone)]
pub struct WarmupScheduler {
    base_lr: f32,
    warmup_steps: usize,
    current_step: usize,
}

impl WarmupScheduler {
    pub fn new(base_lr: f32, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            current_step: 0,
        }
    }
}

impl LRScheduler for WarmupScheduler {
    fn get_lr(&self) -> f32 {
        if self.current_step < self.warmup_steps {
            let warmup_ratio = (self.current_step + 1) as f32 / self.warmup_steps as f32;
            self.base_lr * warmup_ratio
        } else {
            self.base_lr
        }
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }
}

#[derive(Debug, Clone)]
pub struct ConstantScheduler {
    lr: f32,
    current_step: usize,
}

impl ConstantScheduler {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            current_step: 0,
        }
    }
}

impl LRScheduler for ConstantScheduler {
    fn get_lr(&self) -> f32 {
        self.lr
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }
}

/// Build the scheduler described by `config` (constant when absent)
pub fn build_scheduler(
    config: Option<&SchedulerConfig>,
    base_lr: f32,
    total_steps: usize,
) -> Box<dyn LRScheduler> {
    match config {
        Some(SchedulerConfig::Cosine {
            warmup_steps,
            min_lr,
        }) => Box::new(CosineScheduler::new(base_lr, *warmup_steps, total_steps).with_min_lr(*min_lr)),
        Some(SchedulerConfig::Warmup { warmup_steps }) => {
            Box::new(WarmupScheduler::new(base_lr, *warmup_steps))
        }
        Some(SchedulerConfig::Constant) | None => Box::new(ConstantScheduler::new(base_lr)),
    }
}
