//! SGD with momentum and decoupled weight decay

use anyhow::Result;
use ndarray::Array2;
use shifts_types::OptimizerConfig;

#[derive(Debug, Clone)]
pub struct Sgd {
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<Array2<f32>>,
}

impl Sgd {
    pub fn new(momentum: f32, weight_decay: f32) -> Self {
        Self {
            momentum,
            weight_decay,
            velocity: Vec::new(),
        }
    }

    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self::new(config.momentum, config.weight_decay)
    }

    /// Apply one update; `grads` must match `params` in order and shape
    pub fn step(
        &mut self,
        params: Vec<&mut Array2<f32>>,
        grads: Vec<Array2<f32>>,
        lr: f32,
    ) -> Result<()> {
        if params.len() != grads.len() {
            anyhow::bail!(
                "Optimizer got {} parameters but {} gradients",
                params.len(),
                grads.len()
            );
        }
        if self.velocity.is_empty() {
            self.velocity = params.iter().map(|p| Array2::zeros(p.dim())).collect();
        }

        let momentum = self.momentum;
        let weight_decay = self.weight_decay;
        for ((param, grad), velocity) in params.into_iter().zip(grads).zip(&mut self.velocity) {
            if param.dim() != grad.dim() || velocity.dim() != grad.dim() {
                anyhow::bail!(
                    "Gradient shape {:?} does not match parameter {:?}",
                    grad.dim(),
                    param.dim()
                );
            }
            if weight_decay > 0.0 {
                let decay = 1.0 - lr * weight_decay;
                param.mapv_inplace(|w| w * decay);
            }
            velocity.zip_mut_with(&grad, |v, &g| *v = momentum * *v + g);
            param.scaled_add(-lr, &*velocity);
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.velocity.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_plain_step() {
        let mut sgd = Sgd::new(0.0, 0.0);
        let mut w = array![[1.0f32, 2.0]];
        sgd.step(vec![&mut w], vec![array![[0.5, -1.0]]], 0.1).unwrap();
        assert!((w[[0, 0]] - 0.95).abs() < 1e-6);
        assert!((w[[0, 1]] - 2.1).abs() < 1e-6);
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut sgd = Sgd::new(0.9, 0.0);
        let mut w = array![[0.0f32]];
        sgd.step(vec![&mut w], vec![array![[1.0]]], 1.0).unwrap();
        sgd.step(vec![&mut w], vec![array![[1.0]]], 1.0).unwrap();
        // -1 then -(0.9 + 1)
        assert!((w[[0, 0]] + 2.9).abs() < 1e-6);
    }

    #[test]
    fn test_weight_decay_shrinks() {
        let mut sgd = Sgd::new(0.0, 0.5);
        let mut w = array![[2.0f32]];
        sgd.step(vec![&mut w], vec![array![[0.0]]], 0.1).unwrap();
        assert!((w[[0, 0]] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch() {
        let mut sgd = Sgd::new(0.9, 0.0);
        let mut w = array![[0.0f32, 1.0]];
        assert!(sgd.step(vec![&mut w], vec![array![[1.0]]], 0.1).is_err());
    }
}
