//! Checkpoint bookkeeping for a model directory.
//!
//! Training writes generator and discriminator snapshots as `G_<step>.pth` and `D_<step>.pth`.
//! The `.pth` files are what the trainer resumes from, inference can't run them directly and
//! instead uses an ONNX export of the generator saved alongside as `G_<step>.onnx`.
use anyhow::Context;
use once_cell::sync::OnceCell;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Parses `<prefix>_<step>.<ext>` file names.
fn parse_name(path: &Path) -> Option<(String, u64, String)> {
    static CHECKPOINT_REGEX: OnceCell<Regex> = OnceCell::new();
    let checkpoint_regex = CHECKPOINT_REGEX
        .get_or_init(|| Regex::new(r"^([A-Za-z]+)_(\d+)\.(pth|onnx)$").unwrap());
    let name = path.file_name()?.to_str()?;
    let caps = checkpoint_regex.captures(name)?;
    let step = caps[2].parse().ok()?;
    Some((caps[1].to_string(), step, caps[3].to_string()))
}

/// Training step encoded in a checkpoint's file name.
pub fn checkpoint_step(path: impl AsRef<Path>) -> Option<u64> {
    parse_name(path.as_ref()).map(|(_, step, _)| step)
}

fn list_checkpoints(
    dir: &Path,
    prefix: &str,
    extension: &str,
) -> anyhow::Result<Vec<(u64, PathBuf)>> {
    let mut res = vec![];
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some((p, step, ext)) = parse_name(&path) {
            if p == prefix && ext == extension {
                res.push((step, path));
            }
        }
    }
    Ok(res)
}

/// Finds the `<prefix>_<step>.pth` with the highest step, ordering numerically so `G_800` comes
/// after `G_9`.
pub fn latest_checkpoint_path(
    dir: impl AsRef<Path>,
    prefix: &str,
) -> anyhow::Result<Option<PathBuf>> {
    let latest = list_checkpoints(dir.as_ref(), prefix, "pth")?
        .into_iter()
        .max_by_key(|(step, _)| *step)
        .map(|(_, path)| path);
    debug!("Latest {} checkpoint: {:?}", prefix, latest);
    Ok(latest)
}

/// Deletes all but the newest `keep` generator and discriminator checkpoints. The initial `_0`
/// checkpoints are never removed and `keep == 0` disables cleaning. Newest is judged by step, or
/// by modification time when `sort_by_time` is set. Returns the removed files.
pub fn clean_checkpoints(
    dir: impl AsRef<Path>,
    keep: usize,
    sort_by_time: bool,
) -> anyhow::Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut removed = vec![];
    if keep == 0 {
        return Ok(removed);
    }
    for prefix in ["G", "D"] {
        let mut ckpts = vec![];
        for (step, path) in list_checkpoints(dir, prefix, "pth")? {
            if step == 0 {
                continue;
            }
            let mtime = if sort_by_time {
                fs::metadata(&path)?.modified()?
            } else {
                SystemTime::UNIX_EPOCH
            };
            ckpts.push((mtime, step, path));
        }
        ckpts.sort();
        let excess = ckpts.len().saturating_sub(keep);
        for (_, _, path) in ckpts.into_iter().take(excess) {
            info!("Removing old checkpoint {}", path.display());
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            removed.push(path);
        }
    }
    Ok(removed)
}

/// Works out which ONNX graph to run for a generator.
///
/// * A directory resolves to its newest generator, `.pth` or `.onnx`
/// * A `.pth` checkpoint resolves to its `.onnx` export next to it
/// * Anything else is taken as the graph itself
pub fn resolve_generator(path: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
    let path = path.as_ref();
    let candidate = if path.is_dir() {
        let mut ckpts = list_checkpoints(path, "G", "pth")?;
        ckpts.extend(list_checkpoints(path, "G", "onnx")?);
        ckpts
            .into_iter()
            .max_by_key(|(step, _)| *step)
            .map(|(_, p)| p)
            .with_context(|| format!("no G_*.pth or G_*.onnx found in {}", path.display()))?
    } else {
        path.to_path_buf()
    };

    let onnx = if candidate.extension().map(|e| e == "pth").unwrap_or(false) {
        candidate.with_extension("onnx")
    } else {
        candidate
    };
    if !onnx.is_file() {
        anyhow::bail!(
            "generator graph {} not found, export the checkpoint to ONNX first",
            onnx.display()
        );
    }
    info!("Using generator {}", onnx.display());
    Ok(onnx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn step_parsing() {
        assert_eq!(checkpoint_step("logs/44k/G_800.pth"), Some(800));
        assert_eq!(checkpoint_step("D_0.pth"), Some(0));
        assert_eq!(checkpoint_step("G_latest.pth"), None);
        assert_eq!(checkpoint_step("config.json"), None);
    }

    #[test]
    fn latest_is_numeric() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["G_0.pth", "G_9.pth", "G_800.pth", "G_80.pth", "D_1600.pth", "G_5000.onnx"] {
            touch(dir.path(), name);
        }
        let latest = latest_checkpoint_path(dir.path(), "G").unwrap().unwrap();
        assert_eq!(latest.file_name().unwrap(), "G_800.pth");
        let latest = latest_checkpoint_path(dir.path(), "D").unwrap().unwrap();
        assert_eq!(latest.file_name().unwrap(), "D_1600.pth");

        let empty = tempfile::tempdir().unwrap();
        assert!(latest_checkpoint_path(empty.path(), "G").unwrap().is_none());
    }

    #[test]
    fn cleaning_keeps_newest_and_initial() {
        let dir = tempfile::tempdir().unwrap();
        for step in [0, 800, 1600, 2400, 3200] {
            touch(dir.path(), &format!("G_{}.pth", step));
            touch(dir.path(), &format!("D_{}.pth", step));
        }
        let removed = clean_checkpoints(dir.path(), 2, false).unwrap();
        assert_eq!(removed.len(), 4);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec!["D_0.pth", "D_2400.pth", "D_3200.pth", "G_0.pth", "G_2400.pth", "G_3200.pth"]
        );

        assert!(clean_checkpoints(dir.path(), 0, false).unwrap().is_empty());
    }

    #[test]
    fn generator_resolution() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "G_100.pth");
        assert!(resolve_generator(dir.path()).is_err());

        touch(dir.path(), "G_100.onnx");
        let resolved = resolve_generator(dir.path()).unwrap();
        assert_eq!(resolved.file_name().unwrap(), "G_100.onnx");
        let resolved = resolve_generator(dir.path().join("G_100.pth")).unwrap();
        assert_eq!(resolved.file_name().unwrap(), "G_100.onnx");

        touch(dir.path(), "G_200.onnx");
        let resolved = resolve_generator(dir.path()).unwrap();
        assert_eq!(resolved.file_name().unwrap(), "G_200.onnx");
    }
}
