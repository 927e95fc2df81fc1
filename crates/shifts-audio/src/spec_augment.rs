//! SpecAugment-style spectrogram masking
//!
//! Spectrograms are `(features, frames)` arrays as produced by
//! [`crate::preprocess`].

use ndarray::{s, Array2};
use rand::{Rng, RngCore};
use serde::Deserialize;
use shifts_types::{ConfigError, FromParams};

/// A transform applied to a spectrogram in place
pub trait SpectrogramPerturbation: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, spec: &mut Array2<f32>, rng: &mut dyn RngCore);
}

// ============================================================================
// Frequency masking
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrequencyMaskingParams {
    #[serde(default = "FrequencyMaskingParams::default_masks")]
    pub freq_masks: usize,
    #[serde(default = "FrequencyMaskingParams::default_width")]
    pub freq_width: usize,
    #[serde(default)]
    pub mask_value: f32,
}

impl FrequencyMaskingParams {
    fn default_masks() -> usize {
        2
    }

    fn default_width() -> usize {
        10
    }
}

/// Zero out `freq_masks` random bands of up to `freq_width` features
#[derive(Debug, Clone)]
pub struct FrequencyMasking {
    freq_masks: usize,
    freq_width: usize,
    mask_value: f32,
}

impl FromParams for FrequencyMasking {
    type Params = FrequencyMaskingParams;

    fn from_params(p: FrequencyMaskingParams) -> Result<Self, ConfigError> {
        Ok(Self {
            freq_masks: p.freq_masks,
            freq_width: p.freq_width,
            mask_value: p.mask_value,
        })
    }
}

impl SpectrogramPerturbation for FrequencyMasking {
    fn name(&self) -> &'static str {
        "freq_mask"
    }

    fn apply(&self, spec: &mut Array2<f32>, rng: &mut dyn RngCore) {
        let num_features = spec.nrows();
        if num_features == 0 || self.freq_width == 0 {
            return;
        }
        for _ in 0..self.freq_masks {
            let width = rng.gen_range(0..=self.freq_width.min(num_features));
            if width == 0 {
                continue;
            }
            let start = rng.gen_range(0..=num_features - width);
            spec.slice_mut(s![start..start + width, ..]).fill(self.mask_value);
        }
    }
}

// ============================================================================
// Time masking
// ============================================================================

/// Mask width in frames, or as a fraction of the utterance length
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum TimeWidth {
    Frames(usize),
    Fraction(f32),
}

impl TimeWidth {
    fn frames(self, total: usize) -> usize {
        match self {
            TimeWidth::Frames(n) => n,
            TimeWidth::Fraction(f) => (f * total as f32) as usize,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeMaskingParams {
    #[serde(default = "TimeMaskingParams::default_masks")]
    pub time_masks: usize,
    #[serde(default = "TimeMaskingParams::default_width")]
    pub time_width: TimeWidth,
    #[serde(default)]
    pub mask_value: f32,
}

impl TimeMaskingParams {
    fn default_masks() -> usize {
        2
    }

    fn default_width() -> TimeWidth {
        TimeWidth::Fraction(0.05)
    }
}

/// Zero out `time_masks` random spans of frames
#[derive(Debug, Clone)]
pub struct TimeMasking {
    time_masks: usize,
    time_width: TimeWidth,
    mask_value: f32,
}

impl FromParams for TimeMasking {
    type Params = TimeMaskingParams;

    fn from_params(p: TimeMaskingParams) -> Result<Self, ConfigError> {
        if let TimeWidth::Fraction(f) = p.time_width {
            if !(0.0..=1.0).contains(&f) {
                return Err(ConfigError::invalid(
                    "time_mask.time_width",
                    "fractional width must be in [0, 1]",
                ));
            }
        }
        Ok(Self {
            time_masks: p.time_masks,
            time_width: p.time_width,
            mask_value: p.mask_value,
        })
    }
}

impl SpectrogramPerturbation for TimeMasking {
    fn name(&self) -> &'static str {
        "time_mask"
    }

    fn apply(&self, spec: &mut Array2<f32>, rng: &mut dyn RngCore) {
        let num_frames = spec.ncols();
        let max_width = self.time_width.frames(num_frames).min(num_frames);
        if max_width == 0 {
            return;
        }
        for _ in 0..self.time_masks {
            let width = rng.gen_range(0..=max_width);
            if width == 0 {
                continue;
            }
            let start = rng.gen_range(0..=num_frames - width);
            spec.slice_mut(s![.., start..start + width]).fill(self.mask_value);
        }
    }
}

// ============================================================================
// Composition
// ============================================================================

/// Ordered `(probability, perturbation)` list applied to training spectrograms
#[derive(Default)]
pub struct Compose {
    perturbations: Vec<(f32, Box<dyn SpectrogramPerturbation>)>,
}

impl Compose {
    pub fn new(perturbations: Vec<(f32, Box<dyn SpectrogramPerturbation>)>) -> Self {
        Self { perturbations }
    }

    pub fn apply(&self, spec: &mut Array2<f32>, rng: &mut dyn RngCore) {
        for (p, perturbation) in &self.perturbations {
            if rng.gen::<f32>() < *p {
                perturbation.apply(spec, rng);
            }
        }
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
