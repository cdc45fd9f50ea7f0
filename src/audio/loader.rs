use super::{resample, to_mono};
use anyhow::Context;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;
use tracing::debug;

/// Loads a wav file as mono audio, returning the samples and the file's sample rate. Integer
/// formats are scaled into [-1, 1] and channels are averaged.
pub fn load_wav(path: impl AsRef<Path>) -> anyhow::Result<(Vec<f32>, u32)> {
    let path = path.as_ref();
    let reader = WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    debug!("Loading {}: {:?}", path.display(), spec);

    let interleaved = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("reading samples from {}", path.display()))?,
        SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("reading samples from {}", path.display()))?
        }
    };

    let audio = to_mono(&interleaved, spec.channels as usize);
    Ok((audio, spec.sample_rate))
}

/// Loads a wav file and resamples it to `sample_rate`, what you want almost everywhere as the
/// models are trained on one fixed rate.
pub fn load_wav_resampled(path: impl AsRef<Path>, sample_rate: u32) -> anyhow::Result<Vec<f32>> {
    let (audio, sr) = load_wav(path)?;
    Ok(resample(&audio, sr, sample_rate))
}

/// Writes mono 16-bit PCM, anything outside [-1, 1] is clipped.
pub fn write_wav(path: impl AsRef<Path>, audio: &[f32], sample_rate: u32) -> anyhow::Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer =
        WavWriter::create(path, spec).with_context(|| format!("creating {}", path.display()))?;
    for sample in audio {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer
        .finalize()
        .with_context(|| format!("finalising {}", path.display()))?;
    Ok(())
}
