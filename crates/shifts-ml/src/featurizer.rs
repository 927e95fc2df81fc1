//! Statistics-pooling featurizer
//!
//! Spliced frames are lifted through a fixed random projection with ReLU,
//! pooled over time and projected to the embedding size. Weights are drawn
//! from a seeded RNG, so the same params always give the same featurizer.

use anyhow::{anyhow, Result};
use ndarray::{concatenate, s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use shifts_types::{ConfigError, FromParams};

use crate::traits::Featurizer;

/// Statistics computed over the time axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    Mean,
    #[default]
    MeanStd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsPoolingParams {
    pub feat_in: usize,
    #[serde(default = "StatsPoolingParams::default_channels")]
    pub channels: usize,
    #[serde(default = "StatsPoolingParams::default_context")]
    pub context: usize,
    #[serde(default = "StatsPoolingParams::default_emb_dim")]
    pub emb_dim: usize,
    #[serde(default)]
    pub pooling: Pooling,
    #[serde(default)]
    pub seed: u64,
}

impl StatsPoolingParams {
    fn default_channels() -> usize {
        512
    }

    fn default_context() -> usize {
        3
    }

    fn default_emb_dim() -> usize {
        192
    }
}

pub struct StatsPoolingFeaturizer {
    feat_in: usize,
    context: usize,
    pooling: Pooling,
    /// (channels, context * feat_in)
    frame_proj: Array2<f32>,
    /// (emb_dim, pooled_dim)
    emb_proj: Array2<f32>,
}

/// Uniform weights with unit variance, scaled by `1/sqrt(cols)`
pub(crate) fn random_matrix(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f32> {
    let scale = 3f32.sqrt() / (cols.max(1) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0f32..1.0) * scale)
}

impl FromParams for StatsPoolingFeaturizer {
    type Params = StatsPoolingParams;

    fn from_params(p: StatsPoolingParams) -> Result<Self, ConfigError> {
        if p.feat_in == 0 || p.channels == 0 || p.emb_dim == 0 {
            return Err(ConfigError::invalid(
                "stats_pool",
                "feat_in, channels and emb_dim must be positive",
            ));
        }
        if p.context % 2 == 0 {
            return Err(ConfigError::invalid(
                "stats_pool.context",
                format!("context must be odd, got {}", p.context),
            ));
        }

        let mut rng = StdRng::seed_from_u64(p.seed);
        let frame_proj = random_matrix(p.channels, p.context * p.feat_in, &mut rng);
        let pooled_dim = match p.pooling {
            Pooling::Mean => p.channels,
            Pooling::MeanStd => 2 * p.channels,
        };
        let emb_proj = random_matrix(p.emb_dim, pooled_dim, &mut rng);

        Ok(Self {
            feat_in: p.feat_in,
            context: p.context,
            pooling: p.pooling,
            frame_proj,
            emb_proj,
        })
    }
}

impl StatsPoolingFeaturizer {
    /// Stack `context` neighbouring frames, clamping at the edges
    fn splice(&self, features: &Array2<f32>) -> Array2<f32> {
        let frames = features.ncols();
        let half = (self.context / 2) as isize;
        let mut spliced = Array2::<f32>::zeros((self.context * self.feat_in, frames));
        for c in 0..self.context {
            let offset = c as isize - half;
            let rows = c * self.feat_in..(c + 1) * self.feat_in;
            for t in 0..frames {
                let src = (t as isize + offset).clamp(0, frames as isize - 1) as usize;
                spliced
                    .slice_mut(s![rows.clone(), t])
                    .assign(&features.column(src));
            }
        }
        spliced
    }
}

impl Featurizer for StatsPoolingFeaturizer {
    fn name(&self) -> &'static str {
        "stats_pool"
    }

    fn feat_in(&self) -> usize {
        self.feat_in
    }

    fn embedding_dim(&self) -> usize {
        self.emb_proj.nrows()
    }

    fn embed(&self, features: &Array2<f32>) -> Result<Array1<f32>> {
        if features.nrows() != self.feat_in {
            anyhow::bail!(
                "Expected {} input features, got {}",
                self.feat_in,
                features.nrows()
            );
        }
        if features.ncols() == 0 {
            anyhow::bail!("Cannot embed an empty spectrogram");
        }

        let hidden = self.frame_proj.dot(&self.splice(features)).mapv(|v| v.max(0.0));
        let mean = hidden
            .mean_axis(Axis(1))
            .ok_or_else(|| anyhow!("Empty hidden activations"))?;
        let pooled = match self.pooling {
            Pooling::Mean => mean,
            Pooling::MeanStd => {
                let std = hidden.std_axis(Axis(1), 0.0);
                concatenate(Axis(0), &[mean.view(), std.view()])?
            }
        };

        Ok(self.emb_proj.dot(&pooled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(yaml: &str) -> StatsPoolingParams {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_embedding_shape() {
        let f = StatsPoolingFeaturizer::from_params(params("feat_in: 8\nchannels: 16\nemb_dim: 4"))
            .unwrap();
        let spec = Array2::from_shape_fn((8, 30), |(i, j)| ((i * j) as f32 * 0.1).sin());
        let emb = f.embed(&spec).unwrap();
        assert_eq!(emb.len(), 4);
        assert_eq!(f.embedding_dim(), 4);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = StatsPoolingFeaturizer::from_params(params("feat_in: 4\nchannels: 8\nseed: 7"))
            .unwrap();
        let b = StatsPoolingFeaturizer::from_params(params("feat_in: 4\nchannels: 8\nseed: 7"))
            .unwrap();
        let spec = Array2::from_shape_fn((4, 10), |(i, j)| (i + j) as f32);
        assert_eq!(a.embed(&spec).unwrap(), b.embed(&spec).unwrap());
    }

    #[test]
    fn test_distinguishes_inputs() {
        let f = StatsPoolingFeaturizer::from_params(params("feat_in: 4\nchannels: 32\nemb_dim: 8"))
            .unwrap();
        let low = Array2::from_shape_fn((4, 20), |(i, _)| i as f32);
        let high = Array2::from_shape_fn((4, 20), |(i, j)| ((i + 3 * j) as f32).cos());
        assert_ne!(f.embed(&low).unwrap(), f.embed(&high).unwrap());
    }

    #[test]
    fn test_rejects_wrong_feature_count() {
        let f = StatsPoolingFeaturizer::from_params(params("feat_in: 4")).unwrap();
        assert!(f.embed(&Array2::zeros((5, 10))).is_err());
        assert!(f.embed(&Array2::zeros((4, 0))).is_err());
    }

    #[test]
    fn test_even_context_rejected() {
        assert!(StatsPoolingFeaturizer::from_params(params("feat_in: 4\ncontext: 2")).is_err());
        assert!(serde_yaml::from_str::<StatsPoolingParams>("feat_in: 4\nhidden: 3").is_err());
    }
}
