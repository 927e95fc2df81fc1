//! Audio file I/O

use anyhow::{Context, Result};
use hound::WavReader;
use std::path::Path;

/// Load an audio file as mono samples at `sample_rate`
pub fn load_audio_file(path: &Path, sample_rate: u32) -> Result<Vec<f32>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let (mono, source_rate) = match ext.as_str() {
        "wav" => load_wav(path),
        "mp3" | "m4a" | "ogg" | "flac" => load_with_symphonia(path),
        _ => anyhow::bail!("Unsupported audio format: {}", ext),
    }
    .with_context(|| format!("Failed to load {}", path.display()))?;

    if source_rate != sample_rate {
        tracing::debug!(
            "Resampling {} from {} Hz to {} Hz",
            path.display(),
            source_rate,
            sample_rate
        );
    }
    crate::resampling::resample(&mono, source_rate, sample_rate)
}

/// Load `duration` seconds starting at `offset` (whole file when `duration` is None)
pub fn load_segment(
    path: &Path,
    sample_rate: u32,
    offset: f64,
    duration: Option<f64>,
) -> Result<Vec<f32>> {
    let samples = load_audio_file(path, sample_rate)?;
    let start = ((offset.max(0.0)) * sample_rate as f64) as usize;
    if start >= samples.len() {
        return Ok(Vec::new());
    }
    let end = match duration {
        Some(d) if d > 0.0 => (start + (d * sample_rate as f64) as usize).min(samples.len()),
        _ => samples.len(),
    };
    Ok(samples[start..end].to_vec())
}

/// Write mono f32 samples as a 16-bit PCM wav file
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for &sample in samples {
        // Convert f32 (-1.0 to 1.0) to i16
        let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer.write_sample(sample_i16)?;
    }
    writer.finalize()?;
    Ok(())
}

fn downmix(samples: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels > 1 {
        samples
            .chunks(channels)
            .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    }
}

/// Load WAV file using hound
fn load_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let reader = WavReader::open(path).context("Failed to open WAV file")?;

    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|s| s as f32 / max_val))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    Ok((downmix(samples, spec.channels as usize), spec.sample_rate))
}

/// Load audio file using symphonia (supports mp3, m4a, ogg, flac)
fn load_with_symphonia(path: &Path) -> Result<(Vec<f32>, u32)> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format.default_track().context("No audio track found")?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .context("Unknown sample rate")?;
    let channels = track
        .codec_params
        .channels
        .context("Unknown channel count")?
        .count();

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet)?;
        let spec = *decoded.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    Ok((downmix(samples, channels), sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wav_roundtrip_and_segment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..16000).map(|i| 0.5 * (i as f32 * 0.05).sin()).collect();
        write_wav(&path, &samples, 16000).unwrap();

        let loaded = load_audio_file(&path, 16000).unwrap();
        assert_eq!(loaded.len(), 16000);
        assert!((loaded[100] - samples[100]).abs() < 1e-3);

        let segment = load_segment(&path, 16000, 0.25, Some(0.5)).unwrap();
        assert_eq!(segment.len(), 8000);

        let past_end = load_segment(&path, 16000, 2.0, None).unwrap();
        assert!(past_end.is_empty());
    }

    #[test]
    fn test_unsupported_extension() {
        let err = load_audio_file(Path::new("clip.xyz"), 16000).unwrap_err();
        assert!(err.to_string().contains("Unsupported audio format"));
    }
}
