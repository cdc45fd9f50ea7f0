//! Dataset preparation. Datasets are laid out one directory per speaker:
//!
//! ```text
//! dataset_raw/44k/
//! ├── speaker_a/
//! │   ├── 0001.wav
//! │   └── 0002.wav
//! └── speaker_b/
//!     └── ...
//! ```
//!
//! and the stages are ran in order: resample into `dataset/44k`, generate the file lists and
//! config, then extract the content and pitch features next to each wav.
use anyhow::Context;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub mod flist_config;
pub mod hubert_f0;
pub mod resample;

pub use flist_config::*;
pub use hubert_f0::*;
pub use resample::*;

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

/// Speaker directories in the dataset as `(name, path)`, sorted by name so speaker IDs are
/// stable between runs.
pub fn speaker_dirs(input_dir: impl AsRef<Path>) -> anyhow::Result<Vec<(String, PathBuf)>> {
    let input_dir = input_dir.as_ref();
    let mut res = vec![];
    for entry in
        fs::read_dir(input_dir).with_context(|| format!("reading {}", input_dir.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if !name.starts_with('.') => res.push((name.to_string(), path.clone())),
            _ => {}
        }
    }
    res.sort();
    Ok(res)
}

/// Wav files directly inside `dir`, sorted. Anything else gets a warning unless it's one of our
/// own feature files.
pub fn wav_files(dir: impl AsRef<Path>) -> anyhow::Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut res = vec![];
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if is_wav(&path) {
            res.push(path);
        } else if path.extension().map(|e| e != "npy").unwrap_or(true) {
            warn!("Skipping non-wav file {}", path.display());
        }
    }
    res.sort();
    Ok(res)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Content feature file for a wav, `x.wav` -> `x.wav.soft.npy`.
pub fn soft_path(wav: &Path) -> PathBuf {
    with_suffix(wav, ".soft.npy")
}

/// Pitch file for a wav, `x.wav` -> `x.wav.f0.npy`.
pub fn f0_path(wav: &Path) -> PathBuf {
    with_suffix(wav, ".f0.npy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_paths() {
        let wav = Path::new("dataset/44k/a/1.wav");
        assert_eq!(soft_path(wav), PathBuf::from("dataset/44k/a/1.wav.soft.npy"));
        assert_eq!(f0_path(wav), PathBuf::from("dataset/44k/a/1.wav.f0.npy"));
    }

    #[test]
    fn listing() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join("readme.txt"), "").unwrap();
        fs::write(dir.path().join("a/2.WAV"), "").unwrap();
        fs::write(dir.path().join("a/1.wav"), "").unwrap();
        fs::write(dir.path().join("a/1.wav.f0.npy"), "").unwrap();
        fs::write(dir.path().join("a/notes.txt"), "").unwrap();

        let speakers = speaker_dirs(dir.path()).unwrap();
        let names: Vec<_> = speakers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let wavs = wav_files(dir.path().join("a")).unwrap();
        assert_eq!(wavs.len(), 2);
        assert!(wavs[0].ends_with("1.wav"));
        assert!(wavs[1].ends_with("2.WAV"));
    }
}
