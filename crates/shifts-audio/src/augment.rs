//! Waveform perturbations
//!
//! Each perturbation is built from a typed params block through
//! [`FromParams`] and applied in place to a mono waveform. An
//! [`AudioAugmentor`] applies an ordered list of perturbations, each with its
//! own probability.

use crate::resampling::{resample_ratio, ResampleQuality};
use anyhow::Result;
use rand::{Rng, RngCore};
use serde::Deserialize;
use shifts_types::{ConfigError, FromParams};

/// A transform applied to raw audio samples
pub trait Perturbation: Send + Sync {
    /// Perturbation name
    fn name(&self) -> &'static str;

    /// Perturb `samples` in place
    fn perturb(&self, samples: &mut Vec<f32>, sample_rate: u32, rng: &mut dyn RngCore)
        -> Result<()>;
}

fn check_range(field: &str, min: f32, max: f32) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::invalid(
            field,
            format!("min ({}) must not exceed max ({})", min, max),
        ));
    }
    Ok(())
}

fn uniform(rng: &mut dyn RngCore, min: f32, max: f32) -> f32 {
    if min < max {
        rng.gen_range(min..=max)
    } else {
        min
    }
}

// ============================================================================
// Gain
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GainParams {
    #[serde(default = "GainParams::default_min")]
    pub min_gain_dbfs: f32,
    #[serde(default = "GainParams::default_max")]
    pub max_gain_dbfs: f32,
}

impl GainParams {
    fn default_min() -> f32 {
        -10.0
    }

    fn default_max() -> f32 {
        10.0
    }
}

/// Random gain in dB
#[derive(Debug, Clone)]
pub struct GainPerturbation {
    min_gain_dbfs: f32,
    max_gain_dbfs: f32,
}

impl FromParams for GainPerturbation {
    type Params = GainParams;

    fn from_params(p: GainParams) -> Result<Self, ConfigError> {
        check_range("gain", p.min_gain_dbfs, p.max_gain_dbfs)?;
        Ok(Self {
            min_gain_dbfs: p.min_gain_dbfs,
            max_gain_dbfs: p.max_gain_dbfs,
        })
    }
}

impl Perturbation for GainPerturbation {
    fn name(&self) -> &'static str {
        "gain"
    }

    fn perturb(&self, samples: &mut Vec<f32>, _sample_rate: u32, rng: &mut dyn RngCore) -> Result<()> {
        let gain_db = uniform(rng, self.min_gain_dbfs, self.max_gain_dbfs);
        let factor = 10f32.powf(gain_db / 20.0);
        samples.iter_mut().for_each(|s| *s *= factor);
        Ok(())
    }
}

// ============================================================================
// White noise
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhiteNoiseParams {
    #[serde(default = "WhiteNoiseParams::default_min")]
    pub min_level: f32,
    #[serde(default = "WhiteNoiseParams::default_max")]
    pub max_level: f32,
}

impl WhiteNoiseParams {
    fn default_min() -> f32 {
        -90.0
    }

    fn default_max() -> f32 {
        -46.0
    }
}

/// Additive gaussian noise at a random dBFS level
#[derive(Debug, Clone)]
pub struct WhiteNoisePerturbation {
    min_level: f32,
    max_level: f32,
}

impl FromParams for WhiteNoisePerturbation {
    type Params = WhiteNoiseParams;

    fn from_params(p: WhiteNoiseParams) -> Result<Self, ConfigError> {
        check_range("white_noise", p.min_level, p.max_level)?;
        if p.max_level > 0.0 {
            return Err(ConfigError::invalid("white_noise.max_level", "dBFS must be <= 0"));
        }
        Ok(Self {
            min_level: p.min_level,
            max_level: p.max_level,
        })
    }
}

impl Perturbation for WhiteNoisePerturbation {
    fn name(&self) -> &'static str {
        "white_noise"
    }

    fn perturb(&self, samples: &mut Vec<f32>, _sample_rate: u32, rng: &mut dyn RngCore) -> Result<()> {
        let level = uniform(rng, self.min_level, self.max_level);
        let amplitude = 10f32.powf(level / 20.0);
        for s in samples.iter_mut() {
            *s += amplitude * crate::gaussian(rng);
        }
        Ok(())
    }
}

// ============================================================================
// Time shift
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShiftParams {
    #[serde(default = "ShiftParams::default_min")]
    pub min_shift_ms: f32,
    #[serde(default = "ShiftParams::default_max")]
    pub max_shift_ms: f32,
}

impl ShiftParams {
    fn default_min() -> f32 {
        -5.0
    }

    fn default_max() -> f32 {
        5.0
    }
}

/// Shift the signal in time, zero-filling the vacated region
#[derive(Debug, Clone)]
pub struct ShiftPerturbation {
    min_shift_ms: f32,
    max_shift_ms: f32,
}

impl FromParams for ShiftPerturbation {
    type Params = ShiftParams;

    fn from_params(p: ShiftParams) -> Result<Self, ConfigError> {
        check_range("shift", p.min_shift_ms, p.max_shift_ms)?;
        Ok(Self {
            min_shift_ms: p.min_shift_ms,
            max_shift_ms: p.max_shift_ms,
        })
    }
}

impl Perturbation for ShiftPerturbation {
    fn name(&self) -> &'static str {
        "shift"
    }

    fn perturb(&self, samples: &mut Vec<f32>, sample_rate: u32, rng: &mut dyn RngCore) -> Result<()> {
        let shift_ms = uniform(rng, self.min_shift_ms, self.max_shift_ms);
        let shift = (shift_ms.abs() / 1000.0 * sample_rate as f32) as usize;
        if shift == 0 || shift >= samples.len() {
            // Shift longer than the signal would leave silence only
            return Ok(());
        }
        if shift_ms > 0.0 {
            samples.rotate_right(shift);
            samples[..shift].fill(0.0);
        } else {
            samples.rotate_left(shift);
            let len = samples.len();
            samples[len - shift..].fill(0.0);
        }
        Ok(())
    }
}

// ============================================================================
// Speed
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpeedParams {
    #[serde(default = "SpeedParams::default_min")]
    pub min_speed_rate: f32,
    #[serde(default = "SpeedParams::default_max")]
    pub max_speed_rate: f32,
    /// Number of discrete rates between min and max; 0 samples uniformly
    #[serde(default = "SpeedParams::default_num_rates")]
    pub num_rates: usize,
    #[serde(default)]
    pub resample_type: ResampleQuality,
}

impl SpeedParams {
    fn default_min() -> f32 {
        0.9
    }

    fn default_max() -> f32 {
        1.1
    }

    fn default_num_rates() -> usize {
        5
    }
}

/// Speed change by resampling (changes duration and pitch)
#[derive(Debug, Clone)]
pub struct SpeedPerturbation {
    min_speed_rate: f32,
    max_speed_rate: f32,
    rates: Vec<f32>,
    quality: ResampleQuality,
}

impl FromParams for SpeedPerturbation {
    type Params = SpeedParams;

    fn from_params(p: SpeedParams) -> Result<Self, ConfigError> {
        check_range("speed", p.min_speed_rate, p.max_speed_rate)?;
        if p.min_speed_rate <= 0.0 {
            return Err(ConfigError::invalid("speed.min_speed_rate", "must be positive"));
        }
        let rates = match p.num_rates {
            0 => Vec::new(),
            1 => vec![p.min_speed_rate],
            n => (0..n)
                .map(|i| {
                    p.min_speed_rate
                        + (p.max_speed_rate - p.min_speed_rate) * i as f32 / (n - 1) as f32
                })
                .collect(),
        };
        Ok(Self {
            min_speed_rate: p.min_speed_rate,
            max_speed_rate: p.max_speed_rate,
            rates,
            quality: p.resample_type,
        })
    }
}

impl Perturbation for SpeedPerturbation {
    fn name(&self) -> &'static str {
        "speed"
    }

    fn perturb(&self, samples: &mut Vec<f32>, _sample_rate: u32, rng: &mut dyn RngCore) -> Result<()> {
        let rate = if self.rates.is_empty() {
            uniform(rng, self.min_speed_rate, self.max_speed_rate)
        } else {
            self.rates[rng.gen_range(0..self.rates.len())]
        };
        if (rate - 1.0).abs() < 1e-6 {
            return Ok(());
        }
        *samples = resample_ratio(samples, 1.0 / rate as f64, self.quality)?;
        Ok(())
    }
}

// ============================================================================
// Augmentor
// ============================================================================

/// Ordered list of `(probability, perturbation)` pairs
#[derive(Default)]
pub struct AudioAugmentor {
    perturbations: Vec<(f32, Box<dyn Perturbation>)>,
}

impl AudioAugmentor {
    pub fn new(perturbations: Vec<(f32, Box<dyn Perturbation>)>) -> Self {
        Self { perturbations }
    }

    /// Apply each perturbation with its probability, in order
    pub fn perturb(&self, samples: &mut Vec<f32>, sample_rate: u32, rng: &mut dyn RngCore) -> Result<()> {
        for (p, perturbation) in &self.perturbations {
            if rng.gen::<f32>() < *p {
                perturbation.perturb(samples, sample_rate, rng)?;
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.perturbations.iter().map(|(_, p)| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.perturbations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perturbations.is_empty()
    }
}

impl std::fmt::Debug for AudioAugmentor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.perturbations.iter().map(|(p, pert)| (p, pert.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_gain_fixed() {
        let gain = GainPerturbation::from_params(GainParams {
            min_gain_dbfs: 20.0,
            max_gain_dbfs: 20.0,
        })
        .unwrap();
        let mut samples = vec![0.01f32; 10];
        gain.perturb(&mut samples, 16000, &mut StdRng::seed_from_u64(0)).unwrap();
        assert!((samples[0] - 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_invalid_range() {
        let result = GainPerturbation::from_params(GainParams {
            min_gain_dbfs: 5.0,
            max_gain_dbfs: -5.0,
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_shift_positive_delays() {
        let shift = ShiftPerturbation::from_params(ShiftParams {
            min_shift_ms: 1.0,
            max_shift_ms: 1.0,
        })
        .unwrap();
        let mut samples: Vec<f32> = (1..=32).map(|i| i as f32).collect();
        shift.perturb(&mut samples, 16000, &mut StdRng::seed_from_u64(0)).unwrap();
        // 1 ms at 16 kHz = 16 samples
        assert!(samples[..16].iter().all(|&s| s == 0.0));
        assert_eq!(samples[16], 1.0);
    }

    #[test]
    fn test_speed_changes_length() {
        let speed = SpeedPerturbation::from_params(SpeedParams {
            min_speed_rate: 2.0,
            max_speed_rate: 2.0,
            num_rates: 1,
            resample_type: ResampleQuality::Fast,
        })
        .unwrap();
        let mut samples = vec![0.0f32; 1600];
        speed.perturb(&mut samples, 16000, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(samples.len(), 800);
    }

    #[test]
    fn test_augmentor_probability_zero_is_noop() {
        let noise = WhiteNoisePerturbation::from_params(WhiteNoiseParams {
            min_level: -20.0,
            max_level: -20.0,
        })
        .unwrap();
        let augmentor = AudioAugmentor::new(vec![(0.0, Box::new(noise) as Box<dyn Perturbation>)]);
        let mut samples = vec![0.0f32; 100];
        augmentor
            .perturb(&mut samples, 16000, &mut StdRng::seed_from_u64(1))
            .unwrap();
        assert!(samples.iter().all(|&s| s == 0.0));
        assert_eq!(augmentor.names(), vec!["white_noise"]);
    }
}
