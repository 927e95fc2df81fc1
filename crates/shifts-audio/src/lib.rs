//! Audio processing crate for speech-shifts
//!
//! Provides audio file I/O, resampling, waveform and spectrogram
//! augmentation, and the spectral preprocessors that turn waveforms into
//! model features.
//!
//! # Features
//! - **File I/O** via hound (wav) and symphonia (flac, mp3, ogg, m4a)
//! - **Waveform perturbations** composed into an [`AudioAugmentor`]
//! - **SpecAugment** masks composed into a [`Compose`]
//! - **Preprocessors**: log-mel spectrogram and MFCC on top of realfft

pub mod augment;
pub mod file_io;
pub mod preprocess;
pub mod resampling;
pub mod spec_augment;

pub use augment::{
    AudioAugmentor, GainPerturbation, Perturbation, ShiftPerturbation, SpeedPerturbation,
    WhiteNoisePerturbation,
};
pub use preprocess::{
    AudioToMFCCPreprocessor, AudioToMelSpectrogramPreprocessor, Normalize, Preprocessor,
};
pub use spec_augment::{Compose, FrequencyMasking, SpectrogramPerturbation, TimeMasking};

/// Sample rate every loaded waveform is converted to
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Load audio from a file and return mono samples at `sample_rate`
pub fn load_audio_file(path: &std::path::Path, sample_rate: u32) -> anyhow::Result<Vec<f32>> {
    file_io::load_audio_file(path, sample_rate)
}

/// Resample audio to target rate
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> anyhow::Result<Vec<f32>> {
    resampling::resample(samples, source_rate, target_rate)
}

/// Standard-normal sample via Box-Muller
pub(crate) fn gaussian(rng: &mut dyn rand::RngCore) -> f32 {
    use rand::Rng;
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}
