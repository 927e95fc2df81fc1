//! Classification losses with analytic gradients

use anyhow::Result;
use ndarray::{Array2, ArrayView1, Axis};
use serde::Deserialize;
use shifts_types::{ConfigError, FromParams};

use crate::traits::{Loss, LossOutput};

/// Clamp for cosines before `acos`
const COS_EPS: f32 = 1e-6;

fn check_labels(logits: &Array2<f32>, labels: &[usize]) -> Result<()> {
    if logits.nrows() != labels.len() {
        anyhow::bail!(
            "Batch size mismatch: {} logits rows, {} labels",
            logits.nrows(),
            labels.len()
        );
    }
    if labels.is_empty() {
        anyhow::bail!("Empty batch");
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= logits.ncols()) {
        anyhow::bail!("Label {} out of range for {} classes", bad, logits.ncols());
    }
    Ok(())
}

/// Log-probabilities of one row via log-sum-exp
///
/// The largest logit contributes exactly `exp(0) = 1` to the normaliser, so
/// `ln_1p` over the remaining terms keeps near-zero losses from rounding to 0.
fn log_softmax(row: ArrayView1<f32>) -> Vec<f32> {
    let (argmax, max) = row
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (j, v)| if v > best.1 { (j, v) } else { best });
    let rest: f32 = row
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != argmax)
        .map(|(_, &v)| (v - max).exp())
        .sum();
    let log_norm = rest.ln_1p();
    row.iter().map(|&v| (v - max) - log_norm).collect()
}

/// Smoothed cross entropy over `logits`; gradient is w.r.t. `logits`
fn smoothed_cross_entropy(logits: &Array2<f32>, labels: &[usize], smoothing: f32) -> LossOutput {
    let (batch, classes) = logits.dim();
    let off = smoothing / classes as f32;
    let on = 1.0 - smoothing + off;

    let mut grad = Array2::<f32>::zeros((batch, classes));
    let mut total = 0.0f32;
    for (i, (row, &label)) in logits.axis_iter(Axis(0)).zip(labels).enumerate() {
        for (j, log_p) in log_softmax(row).into_iter().enumerate() {
            let target = if j == label { on } else { off };
            if target > 0.0 {
                total -= target * log_p;
            }
            grad[[i, j]] = (log_p.exp() - target) / batch as f32;
        }
    }

    LossOutput {
        value: total / batch as f32,
        grad,
    }
}

// ============================================================================
// Cross entropy
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrossEntropyParams {
    #[serde(default)]
    pub label_smoothing: f32,
}

pub struct CrossEntropyLoss {
    label_smoothing: f32,
}

impl FromParams for CrossEntropyLoss {
    type Params = CrossEntropyParams;

    fn from_params(p: CrossEntropyParams) -> Result<Self, ConfigError> {
        if !(0.0..1.0).contains(&p.label_smoothing) {
            return Err(ConfigError::invalid(
                "cross_entropy.label_smoothing",
                "must be in [0, 1)",
            ));
        }
        Ok(Self {
            label_smoothing: p.label_smoothing,
        })
    }
}

impl Loss for CrossEntropyLoss {
    fn name(&self) -> &'static str {
        "cross_entropy"
    }

    fn forward(&self, logits: &Array2<f32>, labels: &[usize]) -> Result<LossOutput> {
        check_labels(logits, labels)?;
        Ok(smoothed_cross_entropy(logits, labels, self.label_smoothing))
    }
}

// ============================================================================
// Additive angular margin
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AamSoftmaxParams {
    #[serde(default = "AamSoftmaxParams::default_scale")]
    pub scale: f32,
    #[serde(default = "AamSoftmaxParams::default_margin")]
    pub margin: f32,
}

impl AamSoftmaxParams {
    fn default_scale() -> f32 {
        30.0
    }

    fn default_margin() -> f32 {
        0.2
    }
}

/// ArcFace loss over cosine logits: the target logit becomes `s * cos(θ + m)`
pub struct AamSoftmaxLoss {
    scale: f32,
    margin: f32,
}

impl FromParams for AamSoftmaxLoss {
    type Params = AamSoftmaxParams;

    fn from_params(p: AamSoftmaxParams) -> Result<Self, ConfigError> {
        if p.scale <= 0.0 {
            return Err(ConfigError::invalid("aam_softmax.scale", "must be positive"));
        }
        if !(0.0..std::f32::consts::FRAC_PI_2).contains(&p.margin) {
            return Err(ConfigError::invalid(
                "aam_softmax.margin",
                "must be in [0, pi/2)",
            ));
        }
        Ok(Self {
            scale: p.scale,
            margin: p.margin,
        })
    }
}

impl Loss for AamSoftmaxLoss {
    fn name(&self) -> &'static str {
        "aam_softmax"
    }

    fn forward(&self, logits: &Array2<f32>, labels: &[usize]) -> Result<LossOutput> {
        check_labels(logits, labels)?;

        let cos = logits.mapv(|c| c.clamp(-1.0 + COS_EPS, 1.0 - COS_EPS));
        let mut scaled = cos.mapv(|c| c * self.scale);
        // d z / d cos: s everywhere, s * sin(θ + m) / sin(θ) on the target
        let mut dz = Array2::from_elem(cos.dim(), self.scale);
        for (i, &label) in labels.iter().enumerate() {
            let theta = cos[[i, label]].acos();
            scaled[[i, label]] = self.scale * (theta + self.margin).cos();
            dz[[i, label]] = self.scale * (theta + self.margin).sin() / theta.sin();
        }

        let mut out = smoothed_cross_entropy(&scaled, labels, 0.0);
        out.grad = out.grad * &dz;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let loss = CrossEntropyLoss::from_params(CrossEntropyParams::default()).unwrap();
        let logits = Array2::zeros((2, 4));
        let out = loss.forward(&logits, &[0, 3]).unwrap();
        assert!((out.value - 4f32.ln()).abs() < 1e-5);
        // Gradient rows sum to zero
        for row in out.grad.rows() {
            assert!(row.sum().abs() < 1e-6);
        }
        assert!((out.grad[[0, 0]] - (0.25 - 1.0) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_label_smoothing_raises_confident_loss() {
        let logits = array![[10.0f32, 0.0, 0.0]];
        let plain = CrossEntropyLoss::from_params(CrossEntropyParams::default())
            .unwrap()
            .forward(&logits, &[0])
            .unwrap();
        let smooth = CrossEntropyLoss::from_params(CrossEntropyParams {
            label_smoothing: 0.1,
        })
        .unwrap()
        .forward(&logits, &[0])
        .unwrap();
        assert!(smooth.value > plain.value);
    }

    #[test]
    fn test_aam_margin_penalises_target() {
        let logits = array![[0.8f32, 0.1, -0.2]];
        let ce_scaled = CrossEntropyLoss::from_params(CrossEntropyParams::default())
            .unwrap()
            .forward(&logits.mapv(|c| c * 30.0), &[0])
            .unwrap();
        let aam = AamSoftmaxLoss::from_params(AamSoftmaxParams {
            scale: 30.0,
            margin: 0.2,
        })
        .unwrap()
        .forward(&logits, &[0])
        .unwrap();
        assert!(aam.value > ce_scaled.value);
    }

    #[test]
    fn test_confident_prediction_keeps_positive_loss() {
        let loss = CrossEntropyLoss::from_params(CrossEntropyParams::default()).unwrap();
        let out = loss.forward(&array![[24.0f32, 3.0, -6.0]], &[0]).unwrap();
        // ln(1 + e^-21 + e^-30)
        let expected = ((-21.0f64).exp() + (-30.0f64).exp()).ln_1p() as f32;
        assert!(out.value > 0.0);
        assert!((out.value - expected).abs() < expected * 1e-3);

        let wrong = loss.forward(&array![[24.0f32, 3.0, -6.0]], &[2]).unwrap();
        assert!((wrong.value - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_aam_gradient_matches_finite_difference() {
        let loss = AamSoftmaxLoss::from_params(AamSoftmaxParams {
            scale: 4.0,
            margin: 0.3,
        })
        .unwrap();
        let logits = array![[0.3f32, 0.1, -0.4], [0.2, 0.5, 0.0]];
        let labels = [0, 1];
        let analytic = loss.forward(&logits, &labels).unwrap().grad;

        let eps = 1e-3;
        for &(i, j) in &[(0, 0), (0, 2), (1, 1)] {
            let mut plus = logits.clone();
            plus[[i, j]] += eps;
            let mut minus = logits.clone();
            minus[[i, j]] -= eps;
            let numeric = (loss.forward(&plus, &labels).unwrap().value
                - loss.forward(&minus, &labels).unwrap().value)
                / (2.0 * eps);
            assert!((numeric - analytic[[i, j]]).abs() < 1e-2);
        }
    }

    #[test]
    fn test_label_out_of_range() {
        let loss = CrossEntropyLoss::from_params(CrossEntropyParams::default()).unwrap();
        assert!(loss.forward(&Array2::zeros((1, 3)), &[3]).is_err());
        assert!(loss.forward(&Array2::zeros((2, 3)), &[0]).is_err());
    }
}
