//! Classification heads over speaker embeddings

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use shifts_types::{ConfigError, FromParams};

use crate::featurizer::random_matrix;
use crate::traits::Classifier;

const NORM_EPS: f32 = 1e-8;

fn check_dims(kind: &str, feat_in: usize, num_classes: usize) -> Result<(), ConfigError> {
    if feat_in == 0 {
        return Err(ConfigError::invalid(
            format!("{}.feat_in", kind),
            "must be positive",
        ));
    }
    if num_classes < 2 {
        return Err(ConfigError::invalid(
            format!("{}.num_classes", kind),
            format!("need at least 2 classes, got {}", num_classes),
        ));
    }
    Ok(())
}

/// Row-wise L2 norms of a 2D array
fn row_norms(a: &Array2<f32>) -> Array1<f32> {
    a.map_axis(Axis(1), |row| row.dot(&row).sqrt().max(NORM_EPS))
}

// ============================================================================
// Linear
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinearClassifierParams {
    pub feat_in: usize,
    pub num_classes: usize,
    #[serde(default = "default_true")]
    pub bias: bool,
    #[serde(default)]
    pub seed: u64,
}

fn default_true() -> bool {
    true
}

/// Affine head: `logits = E W^T + b`
pub struct LinearClassifier {
    /// (num_classes, feat_in)
    weight: Array2<f32>,
    /// (1, num_classes)
    bias: Option<Array2<f32>>,
}

impl FromParams for LinearClassifier {
    type Params = LinearClassifierParams;

    fn from_params(p: LinearClassifierParams) -> Result<Self, ConfigError> {
        check_dims("linear", p.feat_in, p.num_classes)?;
        let mut rng = StdRng::seed_from_u64(p.seed);
        Ok(Self {
            weight: random_matrix(p.num_classes, p.feat_in, &mut rng),
            bias: p.bias.then(|| Array2::zeros((1, p.num_classes))),
        })
    }
}

impl Classifier for LinearClassifier {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn feat_in(&self) -> usize {
        self.weight.ncols()
    }

    fn num_classes(&self) -> usize {
        self.weight.nrows()
    }

    fn forward(&self, embeddings: &Array2<f32>) -> Array2<f32> {
        let logits = embeddings.dot(&self.weight.t());
        match &self.bias {
            Some(b) => logits + b,
            None => logits,
        }
    }

    fn gradients(&self, embeddings: &Array2<f32>, grad_logits: &Array2<f32>) -> Vec<Array2<f32>> {
        let mut grads = vec![grad_logits.t().dot(embeddings)];
        if self.bias.is_some() {
            grads.push(grad_logits.sum_axis(Axis(0)).insert_axis(Axis(0)));
        }
        grads
    }

    fn parameters(&self) -> Vec<&Array2<f32>> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}

// ============================================================================
// Cosine
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CosineClassifierParams {
    pub feat_in: usize,
    pub num_classes: usize,
    #[serde(default)]
    pub seed: u64,
}

/// Cosine head: logits are cosines between normalised embeddings and class weights
pub struct CosineClassifier {
    /// (num_classes, feat_in)
    weight: Array2<f32>,
}

impl FromParams for CosineClassifier {
    type Params = CosineClassifierParams;

    fn from_params(p: CosineClassifierParams) -> Result<Self, ConfigError> {
        check_dims("cosine", p.feat_in, p.num_classes)?;
        let mut rng = StdRng::seed_from_u64(p.seed);
        Ok(Self {
            weight: random_matrix(p.num_classes, p.feat_in, &mut rng),
        })
    }
}

impl CosineClassifier {
    fn normalized(a: &Array2<f32>) -> (Array2<f32>, Array1<f32>) {
        let norms = row_norms(a);
        let unit = a / &norms.view().insert_axis(Axis(1));
        (unit, norms)
    }
}

impl Classifier for CosineClassifier {
    fn name(&self) -> &'static str {
        "cosine"
    }

    fn feat_in(&self) -> usize {
        self.weight.ncols()
    }

    fn num_classes(&self) -> usize {
        self.weight.nrows()
    }

    fn forward(&self, embeddings: &Array2<f32>) -> Array2<f32> {
        let (e, _) = Self::normalized(embeddings);
        let (w, _) = Self::normalized(&self.weight);
        e.dot(&w.t())
    }

    fn gradients(&self, embeddings: &Array2<f32>, grad_logits: &Array2<f32>) -> Vec<Array2<f32>> {
        // d cos(e, w_j) / d w_j = (ê - cos * ŵ_j) / |w_j|
        let (e, _) = Self::normalized(embeddings);
        let (w, norms) = Self::normalized(&self.weight);
        let cos = e.dot(&w.t());
        let weighted = (grad_logits * &cos).sum_axis(Axis(0));
        let grad = grad_logits.t().dot(&e) - &(&w * &weighted.view().insert_axis(Axis(1)));
        vec![grad / &norms.view().insert_axis(Axis(1))]
    }

    fn parameters(&self) -> Vec<&Array2<f32>> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        vec![&mut self.weight]
    }
}
