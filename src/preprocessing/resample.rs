//! First preprocessing stage: bring every recording to the training sample rate as mono 16-bit
//! PCM, with silence trimmed from the ends and any clipping headroom restored.
use super::{speaker_dirs, wav_files};
use crate::audio::{load_wav, peak, resample, trim, write_wav};
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{error, info};

/// Anything quieter than this relative to the loudest frame is trimmed from the ends.
const TRIM_TOP_DB: f32 = 20.0;
/// Peak level audio is scaled down to if it exceeds full scale.
const PEAK_LEVEL: f32 = 0.98;

fn process_file(input: &Path, output: &Path, sampling_rate: u32) -> anyhow::Result<()> {
    let (audio, sr) = load_wav(input)?;
    let audio = trim(&audio, TRIM_TOP_DB);
    let max = peak(audio);
    let audio = if max > 1.0 {
        audio.iter().map(|x| x * PEAK_LEVEL / max).collect()
    } else {
        audio.to_vec()
    };
    let audio = resample(&audio, sr, sampling_rate);
    write_wav(output, &audio, sampling_rate)
}

/// Resamples `input_dir/<speaker>/*.wav` into `output_dir/<speaker>/*.wav` using `jobs` worker
/// threads. Failures are logged per file and reported together at the end so one bad recording
/// doesn't stop the rest being processed. Returns the number of files written.
pub fn preprocess_resample(
    input_dir: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    sampling_rate: u32,
    jobs: usize,
) -> anyhow::Result<usize> {
    let input_dir = input_dir.as_ref();
    let output_dir = output_dir.as_ref();

    let mut work: Vec<(PathBuf, PathBuf)> = vec![];
    for (speaker, dir) in speaker_dirs(input_dir)? {
        let out_dir = output_dir.join(&speaker);
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("creating {}", out_dir.display()))?;
        for wav in wav_files(&dir)? {
            if let Some(name) = wav.file_name() {
                let mut out = out_dir.join(name);
                out.set_extension("wav");
                work.push((wav, out));
            }
        }
    }
    info!(
        "Resampling {} files from {} to {}Hz with {} jobs",
        work.len(),
        input_dir.display(),
        sampling_rate,
        jobs
    );
    if work.is_empty() {
        return Ok(0);
    }

    let jobs = jobs.clamp(1, work.len());
    let per_job = (work.len() + jobs - 1) / jobs;
    let failures: Vec<(PathBuf, anyhow::Error)> = thread::scope(|s| {
        let handles: Vec<_> = work
            .chunks(per_job)
            .map(|batch| {
                s.spawn(move || {
                    let mut failed = vec![];
                    for (input, output) in batch {
                        match process_file(input, output, sampling_rate) {
                            Ok(()) => info!("{} -> {}", input.display(), output.display()),
                            Err(e) => {
                                error!("Failed to process {}: {:#}", input.display(), e);
                                failed.push((input.clone(), e));
                            }
                        }
                    }
                    failed
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(failed) => failed,
                Err(_) => vec![(PathBuf::new(), anyhow::anyhow!("resampling worker panicked"))],
            })
            .collect()
    });

    if !failures.is_empty() {
        anyhow::bail!(
            "{} of {} files failed to resample, first failure {}: {:#}",
            failures.len(),
            work.len(),
            failures[0].0.display(),
            failures[0].1
        );
    }
    Ok(work.len())
}
