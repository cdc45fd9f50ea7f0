//! Splits the resampled dataset into train/validation/test file lists and writes the model config
//! with the speaker table filled in.
use super::{speaker_dirs, wav_files};
use crate::hparams::HParams;
use anyhow::Context;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Files held out per speaker for validation.
const VAL_PER_SPEAKER: usize = 2;
/// Files held out per speaker for testing.
const TEST_PER_SPEAKER: usize = 2;
/// Fixed so regenerating the lists for the same dataset gives the same split.
const SPLIT_SEED: u64 = 1234;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileLists {
    pub train: Vec<PathBuf>,
    pub val: Vec<PathBuf>,
    pub test: Vec<PathBuf>,
}

/// Shuffles one speaker's files and deals them out, validation from the front, test from the
/// back, training gets whatever's in between. Small speakers fill validation first, then test.
fn split_speaker(mut wavs: Vec<PathBuf>, rng: &mut StdRng, lists: &mut FileLists) {
    wavs.shuffle(rng);
    let val = VAL_PER_SPEAKER.min(wavs.len());
    let test = TEST_PER_SPEAKER.min(wavs.len() - val);
    let train_end = wavs.len() - test;
    lists.val.extend_from_slice(&wavs[..val]);
    lists.train.extend_from_slice(&wavs[val..train_end]);
    lists.test.extend_from_slice(&wavs[train_end..]);
}

fn write_list(path: &Path, files: &[PathBuf]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut text = String::new();
    for file in files {
        text.push_str(&file.to_string_lossy());
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote {} entries to {}", files.len(), path.display());
    Ok(())
}

/// Builds the file lists and config for the dataset in `input_dir`, speaker IDs follow the sorted
/// directory names.
pub fn preprocess_config(
    input_dir: impl AsRef<Path>,
    train_list: impl AsRef<Path>,
    val_list: impl AsRef<Path>,
    test_list: impl AsRef<Path>,
    config_path: impl AsRef<Path>,
) -> anyhow::Result<HParams> {
    let mut rng = StdRng::seed_from_u64(SPLIT_SEED);
    let mut lists = FileLists::default();
    let mut hps = HParams::template();

    for (speaker, dir) in speaker_dirs(input_dir)? {
        let wavs = wav_files(&dir)?;
        if wavs.is_empty() {
            warn!("Speaker {} has no wav files, skipping", speaker);
            continue;
        }
        if wavs.len() <= VAL_PER_SPEAKER + TEST_PER_SPEAKER {
            warn!(
                "Speaker {} only has {} files, none will be used for training",
                speaker,
                wavs.len()
            );
        }
        let id = hps.spk.len();
        info!("Speaker {}: id {}, {} files", speaker, id, wavs.len());
        hps.spk.insert(speaker, id);
        split_speaker(wavs, &mut rng, &mut lists);
    }
    if hps.spk.is_empty() {
        anyhow::bail!("no speakers with audio found");
    }

    write_list(train_list.as_ref(), &lists.train)?;
    write_list(val_list.as_ref(), &lists.val)?;
    write_list(test_list.as_ref(), &lists.test)?;

    hps.data.training_files = train_list.as_ref().to_path_buf();
    hps.data.validation_files = val_list.as_ref().to_path_buf();
    hps.model.n_speakers = hps.model.n_speakers.max(hps.spk.len());
    hps.save(config_path.as_ref())?;
    info!("Wrote config to {}", config_path.as_ref().display());

    Ok(hps)
}
