//! Audio resampling using rubato

use anyhow::{Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::Deserialize;

/// Interpolation quality, named after the librosa resample types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleQuality {
    #[serde(alias = "kaiser_fast")]
    Fast,
    #[default]
    #[serde(alias = "kaiser_best")]
    Best,
}

impl ResampleQuality {
    fn parameters(self) -> SincInterpolationParameters {
        match self {
            ResampleQuality::Fast => SincInterpolationParameters {
                sinc_len: 64,
                f_cutoff: 0.91,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 64,
                window: WindowFunction::Hann2,
            },
            ResampleQuality::Best => SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            },
        }
    }
}

/// Resample audio from source_rate to target_rate
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if source_rate == target_rate {
        return Ok(samples.to_vec());
    }
    resample_ratio(
        samples,
        target_rate as f64 / source_rate as f64,
        ResampleQuality::Best,
    )
}

/// Resample by an arbitrary output/input ratio
///
/// The whole signal is processed as one chunk, so the output length is
/// `round(len * ratio)`.
pub fn resample_ratio(samples: &[f32], ratio: f64, quality: ResampleQuality) -> Result<Vec<f32>> {
    if samples.is_empty() || (ratio - 1.0).abs() < f64::EPSILON {
        return Ok(samples.to_vec());
    }

    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        1.0,
        quality.parameters(),
        samples.len(),
        1, // mono
    )
    .context("Failed to create resampler")?;

    let input = vec![samples.to_vec()];
    let output = resampler
        .process(&input, None)
        .context("Resampling failed")?;

    let mut out = output.into_iter().next().unwrap_or_default();
    let expected = (samples.len() as f64 * ratio).round() as usize;
    out.resize(expected, 0.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_is_identity() {
        let samples = vec![0.1f32, -0.2, 0.3];
        assert_eq!(resample(&samples, 16000, 16000).unwrap(), samples);
    }

    #[test]
    fn test_downsample_length() {
        let samples = vec![0.0f32; 32000];
        let out = resample(&samples, 32000, 16000).unwrap();
        assert_eq!(out.len(), 16000);
    }

    #[test]
    fn test_ratio_length() {
        let samples: Vec<f32> = (0..1600).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample_ratio(&samples, 1.0 / 1.1, ResampleQuality::Fast).unwrap();
        assert_eq!(out.len(), (1600.0f64 / 1.1).round() as usize);
    }
}
