//! K-means cluster centres of each speaker's content features. Replacing content frames with the
//! nearest centre of the target speaker reduces timbre leakage from the source, at the cost of
//! some articulation, which is why it's blended by a ratio rather than applied outright.
use anyhow::Context;
use ndarray::{Array2, ArrayView2};
use ndarray_npy::read_npy;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ClusterModel {
    /// Speaker name to centres shaped `[k, dim]`
    centres: BTreeMap<String, Array2<f32>>,
}

impl ClusterModel {
    pub fn new(centres: BTreeMap<String, Array2<f32>>) -> Self {
        Self { centres }
    }

    /// Loads every `<speaker>.npy` in the directory.
    pub fn load(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut centres = BTreeMap::new();
        for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().map(|e| e != "npy").unwrap_or(true) {
                continue;
            }
            let speaker = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s.to_string(),
                None => continue,
            };
            let array: Array2<f32> =
                read_npy(&path).with_context(|| format!("reading centres {}", path.display()))?;
            info!("Loaded {} cluster centres for {}", array.nrows(), speaker);
            centres.insert(speaker, array);
        }
        Ok(Self { centres })
    }

    pub fn contains(&self, speaker: &str) -> bool {
        self.centres.contains_key(speaker)
    }

    pub fn speakers(&self) -> impl Iterator<Item = &str> {
        self.centres.keys().map(|s| s.as_str())
    }

    /// Replaces every frame of `content` (`[dim, frames]`) with the closest of the speaker's
    /// centres by euclidean distance.
    pub fn nearest_centres(
        &self,
        speaker: &str,
        content: ArrayView2<f32>,
    ) -> anyhow::Result<Array2<f32>> {
        let centres = self.centres.get(speaker).with_context(|| {
            format!(
                "no cluster centres for speaker {}, available: {:?}",
                speaker,
                self.speakers().collect::<Vec<_>>()
            )
        })?;
        if centres.ncols() != content.nrows() {
            anyhow::bail!(
                "cluster dim {} doesn't match content dim {}",
                centres.ncols(),
                content.nrows()
            );
        }
        if centres.nrows() == 0 {
            anyhow::bail!("speaker {} has no cluster centres", speaker);
        }

        let mut result = Array2::zeros(content.raw_dim());
        for (frame, mut out) in content.columns().into_iter().zip(result.columns_mut()) {
            let mut best = 0;
            let mut best_dist = f32::INFINITY;
            for (i, centre) in centres.rows().into_iter().enumerate() {
                let dist: f32 = centre
                    .iter()
                    .zip(frame.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                if dist < best_dist {
                    best_dist = dist;
                    best = i;
                }
            }
            out.assign(&centres.row(best));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_npy::write_npy;

    #[test]
    fn snaps_to_nearest() {
        let mut centres = BTreeMap::new();
        centres.insert("a".to_string(), array![[0.0, 0.0], [10.0, 10.0]]);
        let model = ClusterModel::new(centres);

        // Two frames, columns are frames
        let content = array![[1.0, 9.0], [-1.0, 8.0]];
        let snapped = model.nearest_centres("a", content.view()).unwrap();
        assert_eq!(snapped, array![[0.0, 10.0], [0.0, 10.0]]);

        assert!(model.nearest_centres("b", content.view()).is_err());
        let wrong_dim = array![[1.0], [2.0], [3.0]];
        assert!(model.nearest_centres("a", wrong_dim.view()).is_err());
    }

    #[test]
    fn loads_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_npy(dir.path().join("alice.npy"), &array![[1.0f32, 2.0], [3.0, 4.0]]).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let model = ClusterModel::load(dir.path()).unwrap();
        assert_eq!(model.speakers().collect::<Vec<_>>(), vec!["alice"]);
    }
}
