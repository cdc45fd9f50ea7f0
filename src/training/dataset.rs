use crate::f0::{HUBERT_HOP, HUBERT_SAMPLING_RATE};
use crate::hparams::HParams;
use crate::preprocessing::{f0_path, soft_path};
use anyhow::Context;
use ndarray::{Array1, Array2};
use ndarray_npy::read_npy;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Encoders trim a little at the edges depending on their padding, so the content frame count
/// only has to be close to the audio length.
const CONTENT_FRAME_TOLERANCE: usize = 2;

/// The recordings listed in a file list, one wav path per line.
pub struct Dataset {
    pub entries: Vec<PathBuf>,
}

impl Dataset {
    pub fn load(p: impl AsRef<Path>) -> anyhow::Result<Self> {
        let p = p.as_ref();
        let text = fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let entries = text
            .lines()
            .map(|x| x.trim())
            .filter(|x| !x.is_empty())
            .map(PathBuf::from)
            .collect();
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn validate_entry(wav: &Path, hps: &HParams) -> anyhow::Result<()> {
        let reader = hound::WavReader::open(wav)?;
        let spec = reader.spec();
        if spec.sample_rate != hps.data.sampling_rate {
            anyhow::bail!(
                "sample rate {} doesn't match config {}",
                spec.sample_rate,
                hps.data.sampling_rate
            );
        }
        let samples = reader.duration() as usize;
        let expected_frames = samples / hps.data.hop_length;
        let sr = spec.sample_rate as usize;
        let samples_16k = (samples * HUBERT_SAMPLING_RATE as usize + sr - 1) / sr;
        let expected_content = samples_16k / HUBERT_HOP;

        let f0: Array1<f32> = read_npy(f0_path(wav)).context("reading f0")?;
        if f0.len() != expected_frames {
            anyhow::bail!(
                "f0 has {} frames, expected {} from the audio length",
                f0.len(),
                expected_frames
            );
        }
        let soft: Array2<f32> = read_npy(soft_path(wav)).context("reading content features")?;
        if soft.nrows() != hps.model.ssl_dim {
            anyhow::bail!(
                "content features have dim {}, config expects {}",
                soft.nrows(),
                hps.model.ssl_dim
            );
        }
        if soft.ncols() == 0 {
            anyhow::bail!("content features are empty");
        }
        if soft.ncols().abs_diff(expected_content) > CONTENT_FRAME_TOLERANCE {
            anyhow::bail!(
                "content features have {} frames, expected about {} from the audio length",
                soft.ncols(),
                expected_content
            );
        }
        Ok(())
    }

    /// Validates there's nothing wrong with the dataset. Will log any errors it finds and return
    /// false
    pub fn validate(&self, hps: &HParams) -> bool {
        info!("Validating dataset");
        let mut seen = HashSet::new();
        let mut success = true;
        for wav in &self.entries {
            if !seen.insert(wav.as_path()) {
                error!("Duplicate entry: {}", wav.display());
                success = false;
                continue;
            }
            if !wav.is_file() {
                error!("{} doesn't exist", wav.display());
                success = false;
                continue;
            }
            if let Err(e) = Self::validate_entry(wav, hps) {
                error!("{}: {:#}", wav.display(), e);
                success = false;
            }
        }
        info!("Validation complete");
        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::write_wav;
    use ndarray_npy::write_npy;

    /// One second of audio with features matching the default config.
    fn write_entry(dir: &Path, name: &str, f0_frames: usize) -> PathBuf {
        write_entry_with_content(dir, name, f0_frames, 50)
    }

    fn write_entry_with_content(
        dir: &Path,
        name: &str,
        f0_frames: usize,
        content_frames: usize,
    ) -> PathBuf {
        let wav = dir.join(name);
        write_wav(&wav, &vec![0.1; 44100], 44100).unwrap();
        write_npy(f0_path(&wav), &Array1::<f32>::zeros(f0_frames)).unwrap();
        write_npy(soft_path(&wav), &Array2::<f32>::ones((256, content_frames))).unwrap();
        wav
    }

    #[test]
    fn load_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("train.txt");
        fs::write(&list, "a.wav\n\n  b.wav  \n").unwrap();
        let dataset = Dataset::load(&list).unwrap();
        assert_eq!(dataset.entries, vec![PathBuf::from("a.wav"), PathBuf::from("b.wav")]);
        assert!(Dataset::load(dir.path().join("missing.txt")).is_err());
    }

    #[test]
    fn validates_complete_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let hps = HParams::template();
        let a = write_entry(dir.path(), "a.wav", 44100 / 512);
        let b = write_entry(dir.path(), "b.wav", 44100 / 512);
        // Encoders that drop a frame at the edge are fine
        let c = write_entry_with_content(dir.path(), "c.wav", 44100 / 512, 49);
        let dataset = Dataset {
            entries: vec![a, b, c],
        };
        assert!(dataset.validate(&hps));
    }

    #[test]
    fn flags_broken_entries() {
        let dir = tempfile::tempdir().unwrap();
        let hps = HParams::template();
        let good = write_entry(dir.path(), "good.wav", 44100 / 512);

        let duplicate = Dataset {
            entries: vec![good.clone(), good.clone()],
        };
        assert!(!duplicate.validate(&hps));

        let missing = Dataset {
            entries: vec![dir.path().join("nope.wav")],
        };
        assert!(!missing.validate(&hps));

        let short_f0 = write_entry(dir.path(), "short.wav", 10);
        assert!(!Dataset { entries: vec![short_f0] }.validate(&hps));

        let short_content = write_entry_with_content(dir.path(), "content.wav", 44100 / 512, 10);
        assert!(!Dataset {
            entries: vec![short_content]
        }
        .validate(&hps));

        let no_features = dir.path().join("bare.wav");
        write_wav(&no_features, &vec![0.1; 44100], 44100).unwrap();
        assert!(!Dataset { entries: vec![no_features] }.validate(&hps));

        let mut wrong_rate = hps.clone();
        wrong_rate.data.sampling_rate = 22050;
        assert!(!Dataset { entries: vec![good] }.validate(&wrong_rate));
    }
}
