//! Final preprocessing stage, computes the features training needs for each recording. The content
//! features are the raw encoder output at its own frame rate, the f0 is at the model hop size.
//! Training lines the two up the same way inference does.
use super::{f0_path, soft_path, speaker_dirs, wav_files};
use crate::audio::{load_wav_resampled, resample};
use crate::f0::{compute_f0, HUBERT_SAMPLING_RATE};
use crate::hparams::HParams;
use crate::inference::ContentEncoder;
use anyhow::Context;
use ndarray::Array1;
use ndarray_npy::write_npy;
use std::path::Path;
use tracing::{debug, info};

/// Writes `<wav>.soft.npy` and `<wav>.f0.npy` for one recording.
pub fn extract_features(
    wav: &Path,
    hps: &HParams,
    encoder: &dyn ContentEncoder,
) -> anyhow::Result<()> {
    let sr = hps.data.sampling_rate;
    let audio = load_wav_resampled(wav, sr)?;

    let f0 = compute_f0(&audio, sr, hps.data.hop_length);
    let f0_file = f0_path(wav);
    write_npy(&f0_file, &Array1::from_vec(f0))
        .with_context(|| format!("writing {}", f0_file.display()))?;

    let wav16k = resample(&audio, sr, HUBERT_SAMPLING_RATE);
    let content = encoder
        .encode(&wav16k)
        .with_context(|| format!("encoding {}", wav.display()))?;
    let soft_file = soft_path(wav);
    write_npy(&soft_file, &content).with_context(|| format!("writing {}", soft_file.display()))?;
    Ok(())
}

/// Extracts features for every wav in the dataset. Recordings that already have both feature
/// files are skipped unless `force` is set. Returns the number of recordings processed.
pub fn preprocess_hubert_f0(
    input_dir: impl AsRef<Path>,
    config_path: impl AsRef<Path>,
    encoder: &dyn ContentEncoder,
    force: bool,
) -> anyhow::Result<usize> {
    let hps = HParams::load(config_path)?;
    let mut processed = 0;
    for (speaker, dir) in speaker_dirs(input_dir)? {
        let wavs = wav_files(&dir)?;
        info!("Extracting features for {} ({} files)", speaker, wavs.len());
        for wav in wavs {
            if !force && soft_path(&wav).exists() && f0_path(&wav).exists() {
                debug!("Skipping {}, features exist", wav.display());
                continue;
            }
            extract_features(&wav, &hps, encoder)?;
            processed += 1;
        }
    }
    info!("Extracted features for {} files", processed);
    Ok(processed)
}
