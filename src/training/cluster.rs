//! Trains the per-speaker cluster centres used to pull converted content towards the target
//! speaker. Each speaker's content features are pooled frame by frame and reduced to `k` centres
//! with k-means, seeded with k-means++ so the result only depends on the data and the seed.
use crate::preprocessing::{soft_path, speaker_dirs, wav_files};
use anyhow::Context;
use ndarray::{concatenate, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_npy::{read_npy, write_npy};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

pub const DEFAULT_CLUSTERS: usize = 100;
const MAX_ITERATIONS: usize = 300;
const CLUSTER_SEED: u64 = 1234;

fn squared_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(point: ArrayView1<f32>, centres: &Array2<f32>) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (i, centre) in centres.rows().into_iter().enumerate() {
        let dist = squared_distance(point, centre);
        if dist < best.1 {
            best = (i, dist);
        }
    }
    best
}

/// k-means++: each new centre is drawn with probability proportional to its squared distance
/// from the closest centre picked so far.
fn initial_centres(data: ArrayView2<f32>, k: usize, rng: &mut StdRng) -> Array2<f32> {
    let n = data.nrows();
    let mut centres = Array2::zeros((k, data.ncols()));
    let first = rng.gen_range(0..n);
    centres.row_mut(0).assign(&data.row(first));
    let mut dists: Vec<f32> = data
        .rows()
        .into_iter()
        .map(|row| squared_distance(row, data.row(first)))
        .collect();

    for c in 1..k {
        // All weights zero means every point sits on a centre already
        let pick = match WeightedIndex::new(&dists) {
            Ok(weights) => weights.sample(rng),
            Err(_) => rng.gen_range(0..n),
        };
        centres.row_mut(c).assign(&data.row(pick));
        for (dist, row) in dists.iter_mut().zip(data.rows()) {
            *dist = dist.min(squared_distance(row, centres.row(c)));
        }
    }
    centres
}

/// Clusters the rows of `data` (`[points, dim]`) into at most `k` centres shaped `[k, dim]`.
/// If there are fewer points than `k` you get one centre per point.
pub fn kmeans(data: ArrayView2<f32>, k: usize, rng: &mut StdRng) -> Array2<f32> {
    let n = data.nrows();
    let k = k.min(n);
    if k == 0 {
        return Array2::zeros((0, data.ncols()));
    }

    let mut centres = initial_centres(data, k, rng);
    let mut assignments = vec![usize::MAX; n];
    for iteration in 0..MAX_ITERATIONS {
        let mut changed = false;
        for (assignment, row) in assignments.iter_mut().zip(data.rows()) {
            let (best, _) = nearest(row, &centres);
            if *assignment != best {
                *assignment = best;
                changed = true;
            }
        }
        if !changed {
            debug!("k-means converged after {} iterations", iteration);
            break;
        }

        let mut sums = Array2::<f32>::zeros(centres.raw_dim());
        let mut counts = vec![0usize; k];
        for (assignment, row) in assignments.iter().zip(data.rows()) {
            let mut sum = sums.row_mut(*assignment);
            sum += &row;
            counts[*assignment] += 1;
        }
        // Empty clusters keep their previous centre
        for (i, count) in counts.iter().enumerate() {
            if *count > 0 {
                let mean = sums.row(i).mapv(|x| x / *count as f32);
                centres.row_mut(i).assign(&mean);
            }
        }
    }
    centres
}

/// Every content frame for a speaker as rows, `[frames, dim]`.
fn speaker_features(dir: &Path) -> anyhow::Result<Option<Array2<f32>>> {
    let mut features = vec![];
    for wav in wav_files(dir)? {
        let soft = soft_path(&wav);
        if !soft.exists() {
            warn!("{} has no content features, run pre-hubert", wav.display());
            continue;
        }
        let content: Array2<f32> =
            read_npy(&soft).with_context(|| format!("reading {}", soft.display()))?;
        features.push(content.reversed_axes());
    }
    if features.is_empty() {
        return Ok(None);
    }
    let views: Vec<_> = features.iter().map(|x| x.view()).collect();
    let stacked = concatenate(Axis(0), &views).context("content features differ in dim")?;
    Ok(Some(stacked))
}

/// Writes `<output_dir>/<speaker>.npy` cluster centres for every speaker in the dataset. Returns
/// the number of speakers clustered.
pub fn train_cluster(
    input_dir: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    n_clusters: usize,
) -> anyhow::Result<usize> {
    let output_dir = output_dir.as_ref();
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let mut rng = StdRng::seed_from_u64(CLUSTER_SEED);
    let mut trained = 0;
    for (speaker, dir) in speaker_dirs(input_dir)? {
        let features = match speaker_features(&dir)? {
            Some(f) => f,
            None => {
                warn!("Speaker {} has no content features, skipping", speaker);
                continue;
            }
        };
        info!(
            "Clustering {} frames of {} into {} centres",
            features.nrows(),
            speaker,
            n_clusters.min(features.nrows())
        );
        let centres = kmeans(features.view(), n_clusters, &mut rng);
        let path = output_dir.join(format!("{}.npy", speaker));
        write_npy(&path, &centres).with_context(|| format!("writing {}", path.display()))?;
        trained += 1;
    }
    info!("Wrote cluster centres for {} speakers", trained);
    Ok(trained)
}
