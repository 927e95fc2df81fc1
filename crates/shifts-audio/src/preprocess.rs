//! Spectral preprocessors: waveform → `(features, frames)` feature matrix
//!
//! Both preprocessors share the same front end: optional dither,
//! pre-emphasis, a centered STFT with a Hann window computed with realfft,
//! and a triangular HTK mel filterbank. MFCC adds an orthonormal DCT-II on
//! top of the log-mel energies.

use anyhow::Result;
use ndarray::Array2;
use rand::RngCore;
use realfft::{RealFftPlanner, RealToComplex};
use serde::Deserialize;
use shifts_types::{ConfigError, FromParams};
use std::sync::Arc;

/// Converts raw audio to model input features
pub trait Preprocessor: Send + Sync {
    /// Preprocessor name
    fn name(&self) -> &'static str;

    /// Number of feature rows produced
    fn features(&self) -> usize;

    /// Dither amplitude added to the waveform before analysis
    fn dither(&self) -> f32;

    /// Compute features for one waveform
    fn process(&self, samples: &[f32], rng: &mut dyn RngCore) -> Result<Array2<f32>>;
}

/// Feature normalization applied per utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalize {
    /// Zero mean, unit variance for every feature row
    #[default]
    PerFeature,
    None,
}

const LOG_GUARD: f32 = 5.960_464_5e-8; // 2^-24

// ============================================================================
// Shared STFT + mel front end
// ============================================================================

struct MelFrontEnd {
    sample_rate: u32,
    win_length: usize,
    hop_length: usize,
    n_fft: usize,
    n_mels: usize,
    preemph: Option<f32>,
    dither: f32,
    window: Vec<f32>,
    filterbank: Vec<Vec<f32>>,
    fft: Arc<dyn RealToComplex<f32>>,
}

#[allow(clippy::too_many_arguments)]
impl MelFrontEnd {
    fn new(
        sample_rate: u32,
        window_size: f32,
        window_stride: f32,
        n_fft: Option<usize>,
        n_mels: usize,
        lowfreq: f32,
        highfreq: Option<f32>,
        preemph: Option<f32>,
        dither: f32,
    ) -> Result<Self, ConfigError> {
        if sample_rate == 0 {
            return Err(ConfigError::invalid("sample_rate", "must be positive"));
        }
        if dither < 0.0 {
            return Err(ConfigError::invalid("dither", "must be >= 0"));
        }
        if n_mels == 0 {
            return Err(ConfigError::invalid("features", "must be at least 1"));
        }

        let win_length = (window_size * sample_rate as f32).round() as usize;
        let hop_length = (window_stride * sample_rate as f32).round() as usize;
        if win_length == 0 || hop_length == 0 {
            return Err(ConfigError::invalid(
                "window_size",
                "window and stride must cover at least one sample",
            ));
        }
        let n_fft = n_fft.unwrap_or_else(|| win_length.next_power_of_two());
        if n_fft < win_length {
            return Err(ConfigError::invalid(
                "n_fft",
                format!("{} is shorter than the window ({})", n_fft, win_length),
            ));
        }

        let nyquist = sample_rate as f32 / 2.0;
        let highfreq = highfreq.unwrap_or(nyquist).min(nyquist);
        if lowfreq < 0.0 || lowfreq >= highfreq {
            return Err(ConfigError::invalid("lowfreq", "must be in [0, highfreq)"));
        }

        // Symmetric Hann window
        let window: Vec<f32> = (0..win_length)
            .map(|i| {
                let n = (win_length.max(2) - 1) as f32;
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n).cos())
            })
            .collect();

        let filterbank = create_mel_filterbank(sample_rate, n_fft, n_mels, lowfreq, highfreq);
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(n_fft);

        Ok(Self {
            sample_rate,
            win_length,
            hop_length,
            n_fft,
            n_mels,
            preemph,
            dither,
            window,
            filterbank,
            fft,
        })
    }

    /// Log-mel energies, shape `(n_mels, frames)`
    fn log_mel(&self, samples: &[f32], rng: &mut dyn RngCore) -> Result<Array2<f32>> {
        let mut signal = samples.to_vec();

        if self.dither > 0.0 {
            for s in signal.iter_mut() {
                *s += self.dither * crate::gaussian(rng);
            }
        }

        if let Some(coeff) = self.preemph {
            for i in (1..signal.len()).rev() {
                signal[i] -= coeff * signal[i - 1];
            }
        }

        // Center frames: pad n_fft/2 on both sides
        let pad = self.n_fft / 2;
        let mut padded = vec![0.0f32; pad];
        padded.extend_from_slice(&signal);
        padded.resize(padded.len() + pad, 0.0);
        if padded.len() < self.win_length {
            padded.resize(self.win_length, 0.0);
        }

        let num_frames = (padded.len() - self.win_length) / self.hop_length + 1;
        let mut out = Array2::<f32>::zeros((self.n_mels, num_frames));

        let mut input = self.fft.make_input_vec();
        let mut spectrum = self.fft.make_output_vec();
        let offset = (self.n_fft - self.win_length) / 2;

        for frame in 0..num_frames {
            let start = frame * self.hop_length;
            input.fill(0.0);
            for (i, (&s, &w)) in padded[start..start + self.win_length]
                .iter()
                .zip(&self.window)
                .enumerate()
            {
                input[offset + i] = s * w;
            }

            self.fft
                .process(&mut input, &mut spectrum)
                .map_err(|e| anyhow::anyhow!("FFT failed: {}", e))?;

            for (m, filter) in self.filterbank.iter().enumerate() {
                let energy: f32 = filter
                    .iter()
                    .zip(spectrum.iter())
                    .map(|(w, c)| w * c.norm_sqr())
                    .sum();
                out[[m, frame]] = (energy + LOG_GUARD).ln();
            }
        }

        Ok(out)
    }
}

/// Create mel filterbank (HTK mel scale, torchaudio-style triangles)
fn create_mel_filterbank(
    sample_rate: u32,
    n_fft: usize,
    n_mels: usize,
    lowfreq: f32,
    highfreq: f32,
) -> Vec<Vec<f32>> {
    let num_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f32 / 2.0;

    let hz_to_mel = |hz: f32| -> f32 { 2595.0 * (1.0 + hz / 700.0).log10() };
    let mel_to_hz = |mel: f32| -> f32 { 700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0) };

    let bin_freqs: Vec<f32> = (0..num_bins)
        .map(|i| i as f32 * nyquist / (num_bins - 1).max(1) as f32)
        .collect();

    let mel_min = hz_to_mel(lowfreq);
    let mel_max = hz_to_mel(highfreq);
    let f_pts: Vec<f32> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(mel_min + i as f32 * (mel_max - mel_min) / (n_mels + 1) as f32))
        .collect();

    (0..n_mels)
        .map(|m| {
            let lower_width = f_pts[m + 1] - f_pts[m];
            let upper_width = f_pts[m + 2] - f_pts[m + 1];
            bin_freqs
                .iter()
                .map(|&freq| {
                    let lower = (freq - f_pts[m]) / lower_width;
                    let upper = (f_pts[m + 2] - freq) / upper_width;
                    lower.min(upper).max(0.0)
                })
                .collect()
        })
        .collect()
}

fn normalize_per_feature(features: &mut Array2<f32>) {
    let frames = features.ncols();
    if frames < 2 {
        return;
    }
    for mut row in features.rows_mut() {
        let mean = row.sum() / frames as f32;
        let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (frames - 1) as f32;
        let std = var.sqrt() + 1e-5;
        row.mapv_inplace(|v| (v - mean) / std);
    }
}

fn default_sample_rate() -> u32 {
    crate::TARGET_SAMPLE_RATE
}

fn default_window_size() -> f32 {
    0.025
}

fn default_window_stride() -> f32 {
    0.01
}

fn default_features() -> usize {
    64
}

fn default_dither() -> f32 {
    1e-5
}

fn default_preemph() -> Option<f32> {
    Some(0.97)
}

// ============================================================================
// Mel spectrogram
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MelSpectrogramParams {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_window_size")]
    pub window_size: f32,
    #[serde(default = "default_window_stride")]
    pub window_stride: f32,
    #[serde(default)]
    pub n_fft: Option<usize>,
    #[serde(default = "default_features")]
    pub features: usize,
    #[serde(default)]
    pub lowfreq: f32,
    #[serde(default)]
    pub highfreq: Option<f32>,
    #[serde(default = "default_preemph")]
    pub preemph: Option<f32>,
    #[serde(default = "default_dither")]
    pub dither: f32,
    #[serde(default)]
    pub normalize: Normalize,
}

/// Log-mel spectrogram features
pub struct AudioToMelSpectrogramPreprocessor {
    front: MelFrontEnd,
    normalize: Normalize,
}

impl AudioToMelSpectrogramPreprocessor {
    pub fn sample_rate(&self) -> u32 {
        self.front.sample_rate
    }
}

impl FromParams for AudioToMelSpectrogramPreprocessor {
    type Params = MelSpectrogramParams;

    fn from_params(p: MelSpectrogramParams) -> Result<Self, ConfigError> {
        let front = MelFrontEnd::new(
            p.sample_rate,
            p.window_size,
            p.window_stride,
            p.n_fft,
            p.features,
            p.lowfreq,
            p.highfreq,
            p.preemph,
            p.dither,
        )?;
        tracing::debug!(
            "Mel preprocessor: {} features, dither={}, normalize={:?}",
            p.features,
            p.dither,
            p.normalize
        );
        Ok(Self {
            front,
            normalize: p.normalize,
        })
    }
}

impl Preprocessor for AudioToMelSpectrogramPreprocessor {
    fn name(&self) -> &'static str {
        "AudioToMelSpectrogramPreprocessor"
    }

    fn features(&self) -> usize {
        self.front.n_mels
    }

    fn dither(&self) -> f32 {
        self.front.dither
    }

    fn process(&self, samples: &[f32], rng: &mut dyn RngCore) -> Result<Array2<f32>> {
        let mut mel = self.front.log_mel(samples, rng)?;
        if self.normalize == Normalize::PerFeature {
            normalize_per_feature(&mut mel);
        }
        Ok(mel)
    }
}

// ============================================================================
// MFCC
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MfccParams {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_window_size")]
    pub window_size: f32,
    #[serde(default = "default_window_stride")]
    pub window_stride: f32,
    #[serde(default)]
    pub n_fft: Option<usize>,
    #[serde(default = "default_features")]
    pub n_mels: usize,
    #[serde(default = "MfccParams::default_n_mfcc")]
    pub n_mfcc: usize,
    #[serde(default)]
    pub lowfreq: f32,
    #[serde(default)]
    pub highfreq: Option<f32>,
    #[serde(default)]
    pub preemph: Option<f32>,
    #[serde(default = "default_dither")]
    pub dither: f32,
    #[serde(default)]
    pub normalize: Normalize,
}

impl MfccParams {
    fn default_n_mfcc() -> usize {
        40
    }
}

/// Mel-frequency cepstral coefficients
pub struct AudioToMFCCPreprocessor {
    front: MelFrontEnd,
    /// Orthonormal DCT-II basis, shape `(n_mfcc, n_mels)`
    dct: Array2<f32>,
    normalize: Normalize,
}

impl FromParams for AudioToMFCCPreprocessor {
    type Params = MfccParams;

    fn from_params(p: MfccParams) -> Result<Self, ConfigError> {
        if p.n_mfcc == 0 || p.n_mfcc > p.n_mels {
            return Err(ConfigError::invalid(
                "n_mfcc",
                format!("must be in [1, n_mels={}]", p.n_mels),
            ));
        }
        let front = MelFrontEnd::new(
            p.sample_rate,
            p.window_size,
            p.window_stride,
            p.n_fft,
            p.n_mels,
            p.lowfreq,
            p.highfreq,
            p.preemph,
            p.dither,
        )?;
        Ok(Self {
            dct: dct_matrix(p.n_mfcc, p.n_mels),
            front,
            normalize: p.normalize,
        })
    }
}

fn dct_matrix(n_out: usize, n_in: usize) -> Array2<f32> {
    let n = n_in as f32;
    Array2::from_shape_fn((n_out, n_in), |(k, i)| {
        let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        scale * (std::f32::consts::PI * k as f32 * (i as f32 + 0.5) / n).cos()
    })
}

impl Preprocessor for AudioToMFCCPreprocessor {
    fn name(&self) -> &'static str {
        "AudioToMFCCPreprocessor"
    }

    fn features(&self) -> usize {
        self.dct.nrows()
    }

    fn dither(&self) -> f32 {
        self.front.dither
    }

    fn process(&self, samples: &[f32], rng: &mut dyn RngCore) -> Result<Array2<f32>> {
        let mel = self.front.log_mel(samples, rng)?;
        let mut mfcc = self.dct.dot(&mel);
        if self.normalize == Normalize::PerFeature {
            normalize_per_feature(&mut mfcc);
        }
        Ok(mfcc)
    }
}
