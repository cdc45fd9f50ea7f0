//! There is no training code implemented in this project, the model numerics live in whatever
//! framework the networks were written in. What is here is everything around it: checking the
//! dataset is complete and consistent before hours of GPU time get spent on it, preparing the
//! model directory, working out where to resume from, keeping the checkpoint count in check and
//! driving the external trainer. The one model fitted here is the k-means in [`cluster`], it's
//! small enough to not need a framework.
use crate::checkpoint::{checkpoint_step, clean_checkpoints, latest_checkpoint_path};
use crate::hparams::HParams;
use anyhow::Context;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{info, warn};

pub mod cluster;
pub mod dataset;

pub use cluster::*;
pub use dataset::*;

/// What `train` found and did.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub train_len: usize,
    pub val_len: usize,
    /// Generator checkpoint training resumes from, if any
    pub resume_from: Option<PathBuf>,
    pub resume_step: Option<u64>,
}

fn forward_lines(reader: impl Read, stderr: bool) {
    for line in BufReader::new(reader).lines().map_while(Result::ok) {
        if stderr {
            warn!(target: "trainer", "{}", line);
        } else {
            info!(target: "trainer", "{}", line);
        }
    }
}

/// Runs the trainer as `<command...> <config.json> <model_dir>`, streaming its output into the
/// log.
fn run_trainer(command: &str, config: &Path, model_dir: &Path) -> anyhow::Result<()> {
    let mut parts = command.split_whitespace();
    let program = parts.next().context("trainer command is empty")?;
    info!("Starting trainer: {}", command);
    let mut child = Command::new(program)
        .args(parts)
        .arg(config)
        .arg(model_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning trainer '{}'", command))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    thread::scope(|s| {
        if let Some(out) = stdout {
            s.spawn(move || forward_lines(out, false));
        }
        if let Some(err) = stderr {
            s.spawn(move || forward_lines(err, true));
        }
    });

    let status = child.wait().context("waiting for trainer")?;
    if !status.success() {
        anyhow::bail!("trainer exited with {}", status);
    }
    Ok(())
}

/// Prepares `model_dir` for training on the dataset described by `config_path` and, if a trainer
/// command is given, runs it.
pub fn train(
    config_path: impl AsRef<Path>,
    model_dir: impl AsRef<Path>,
    trainer: Option<&str>,
) -> anyhow::Result<TrainSummary> {
    let config_path = config_path.as_ref();
    let model_dir = model_dir.as_ref();
    let hps = HParams::load(config_path)?;

    fs::create_dir_all(model_dir).with_context(|| format!("creating {}", model_dir.display()))?;
    let model_config = model_dir.join("config.json");
    hps.save(&model_config)?;

    let train_set = Dataset::load(&hps.data.training_files)?;
    let val_set = Dataset::load(&hps.data.validation_files)?;
    info!(
        "Training on {} files, validating on {}",
        train_set.len(),
        val_set.len()
    );
    if train_set.is_empty() {
        anyhow::bail!("{} is empty", hps.data.training_files.display());
    }
    let train_ok = train_set.validate(&hps);
    let val_ok = val_set.validate(&hps);
    if !(train_ok && val_ok) {
        anyhow::bail!("dataset failed validation, run pre-hubert or regenerate the file lists");
    }

    let resume_from = latest_checkpoint_path(model_dir, "G")?;
    let resume_step = resume_from.as_ref().and_then(checkpoint_step);
    match (&resume_from, latest_checkpoint_path(model_dir, "D")?) {
        (Some(g), Some(d)) => info!("Resuming from {} and {}", g.display(), d.display()),
        (Some(g), None) => warn!(
            "Found {} but no discriminator, it will be reinitialised",
            g.display()
        ),
        _ => info!("No checkpoints in {}, starting from scratch", model_dir.display()),
    }

    clean_checkpoints(model_dir, hps.train.keep_ckpts, false)?;

    match trainer {
        Some(command) => {
            run_trainer(command, &model_config, model_dir)?;
            clean_checkpoints(model_dir, hps.train.keep_ckpts, false)?;
        }
        None => info!(
            "{} is ready, pass --trainer to run a training backend",
            model_dir.display()
        ),
    }

    Ok(TrainSummary {
        train_len: train_set.len(),
        val_len: val_set.len(),
        resume_from,
        resume_step,
    })
}
