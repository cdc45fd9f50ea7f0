//! The `config.json` that travels with a model. It's produced by `pre-config`, consumed by every
//! later stage and copied next to the checkpoints when training so a model directory is self
//! describing.
//!
//! Only the values this crate acts on are typed. Everything else (mostly the network architecture)
//! is kept as raw JSON and written back untouched, so configs produced by other tooling survive a
//! load/save round trip.
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainParams {
    pub log_interval: u64,
    pub eval_interval: u64,
    pub seed: u64,
    pub epochs: u64,
    pub learning_rate: f64,
    pub betas: [f64; 2],
    pub eps: f64,
    pub batch_size: usize,
    pub fp16_run: bool,
    pub lr_decay: f64,
    pub segment_size: usize,
    pub init_lr_ratio: f64,
    pub warmup_epochs: u64,
    pub c_mel: f64,
    pub c_kl: f64,
    pub use_sr: bool,
    pub max_speclen: usize,
    pub port: String,
    /// Number of generator/discriminator checkpoint pairs kept on disk, 0 keeps everything
    pub keep_ckpts: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            log_interval: 200,
            eval_interval: 800,
            seed: 1234,
            epochs: 10000,
            learning_rate: 0.0001,
            betas: [0.8, 0.99],
            eps: 1e-9,
            batch_size: 6,
            fp16_run: false,
            lr_decay: 0.999875,
            segment_size: 10240,
            init_lr_ratio: 1.0,
            warmup_epochs: 0,
            c_mel: 45.0,
            c_kl: 1.0,
            use_sr: true,
            max_speclen: 512,
            port: "8001".to_string(),
            keep_ckpts: 3,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataParams {
    pub training_files: PathBuf,
    pub validation_files: PathBuf,
    pub max_wav_value: f64,
    pub sampling_rate: u32,
    pub filter_length: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub n_mel_channels: usize,
    pub mel_fmin: f64,
    pub mel_fmax: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DataParams {
    fn default() -> Self {
        Self {
            training_files: PathBuf::from("filelists/44k/train.txt"),
            validation_files: PathBuf::from("filelists/44k/val.txt"),
            max_wav_value: 32768.0,
            sampling_rate: 44100,
            filter_length: 2048,
            hop_length: 512,
            win_length: 2048,
            n_mel_channels: 80,
            mel_fmin: 0.0,
            mel_fmax: Some(22050.0),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Dimension of the content features
    pub ssl_dim: usize,
    /// Size of the speaker embedding table, can be larger than the number of trained speakers
    pub n_speakers: usize,
    pub gin_channels: usize,
    #[serde(flatten)]
    pub architecture: Map<String, Value>,
}

impl Default for ModelParams {
    fn default() -> Self {
        let architecture = json!({
            "inter_channels": 192,
            "hidden_channels": 192,
            "filter_channels": 768,
            "n_heads": 2,
            "n_layers": 6,
            "kernel_size": 3,
            "p_dropout": 0.1,
            "resblock": "1",
            "resblock_kernel_sizes": [3, 7, 11],
            "resblock_dilation_sizes": [[1, 3, 5], [1, 3, 5], [1, 3, 5]],
            "upsample_rates": [8, 8, 2, 2, 2],
            "upsample_initial_channel": 512,
            "upsample_kernel_sizes": [16, 16, 4, 4, 4],
            "n_layers_q": 3,
            "use_spectral_norm": false
        });
        let architecture = match architecture {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            ssl_dim: 256,
            n_speakers: 200,
            gin_channels: 256,
            architecture,
        }
    }
}

/// Hyperparameters for a model, the in-memory form of `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    pub train: TrainParams,
    pub data: DataParams,
    pub model: ModelParams,
    /// Speaker name to speaker embedding ID
    pub spk: BTreeMap<String, usize>,
}

/// A target speaker, either picked by name or directly by embedding ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Speaker {
    Id(usize),
    Name(String),
}

impl FromStr for Speaker {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Speaker::Name(s.to_string()))
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Speaker::Id(id) => write!(f, "#{}", id),
            Speaker::Name(name) => write!(f, "{}", name),
        }
    }
}

impl HParams {
    /// The default 44.1kHz configuration with no speakers.
    pub fn template() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let hps = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(hps)
    }

    /// Writes the config as pretty JSON, creating any missing parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Resolves a speaker to its embedding ID.
    ///
    /// IDs must be below the number of speakers in the map. Names are looked up in the map, a
    /// numeric string that isn't a known name is treated as an ID, and anything else falls back
    /// to speaker 0 with a warning so a typo doesn't throw away a long conversion.
    pub fn speaker_id(&self, speaker: &Speaker) -> anyhow::Result<usize> {
        match speaker {
            Speaker::Id(id) => {
                if *id < self.spk.len() {
                    Ok(*id)
                } else {
                    anyhow::bail!(
                        "Speaker id {} >= number of speakers {}",
                        id,
                        self.spk.len()
                    )
                }
            }
            Speaker::Name(name) => {
                if let Some(id) = self.spk.get(name) {
                    Ok(*id)
                } else if let Ok(id) = name.parse::<usize>() {
                    self.speaker_id(&Speaker::Id(id))
                } else {
                    warn!("Speaker {} is not found. Use speaker 0 instead.", name);
                    Ok(0)
                }
            }
        }
    }

    /// The speaker with the lowest ID, used when no speaker is requested.
    pub fn default_speaker(&self) -> Option<&str> {
        self.spk
            .iter()
            .min_by_key(|(_, id)| **id)
            .map(|(name, _)| name.as_str())
    }

    /// Speakers ordered by embedding ID.
    pub fn speakers(&self) -> Vec<&str> {
        let mut speakers: Vec<_> = self.spk.iter().collect();
        speakers.sort_by_key(|(_, id)| **id);
        speakers.into_iter().map(|(name, _)| name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_speakers() -> HParams {
        let mut hps = HParams::template();
        hps.spk.insert("nen".to_string(), 0);
        hps.spk.insert("alice".to_string(), 1);
        hps
    }

    #[test]
    fn speaker_lookup() {
        let hps = with_speakers();
        assert_eq!(hps.speaker_id(&Speaker::Name("alice".into())).unwrap(), 1);
        assert_eq!(hps.speaker_id(&Speaker::Name("nen".into())).unwrap(), 0);
        assert_eq!(hps.speaker_id(&Speaker::Name("bob".into())).unwrap(), 0);
        assert_eq!(hps.speaker_id(&Speaker::Name("1".into())).unwrap(), 1);
        assert_eq!(hps.speaker_id(&Speaker::Id(1)).unwrap(), 1);
        assert!(hps.speaker_id(&Speaker::Id(2)).is_err());
        assert!(hps.speaker_id(&Speaker::Name("7".into())).is_err());
    }

    #[test]
    fn default_speaker_is_lowest_id() {
        let hps = with_speakers();
        assert_eq!(hps.default_speaker(), Some("nen"));
        assert_eq!(hps.speakers(), vec!["nen", "alice"]);
        assert_eq!(HParams::template().default_speaker(), None);
    }

    #[test]
    fn unknown_keys_survive() {
        let text = r#"{
            "train": {"epochs": 5, "custom_flag": true},
            "data": {"sampling_rate": 22050, "hop_length": 256, "contentvec_final_proj": false},
            "model": {"ssl_dim": 768, "n_speakers": 4, "n_heads": 4},
            "spk": {"someone": 0}
        }"#;
        let hps: HParams = serde_json::from_str(text).unwrap();
        assert_eq!(hps.train.epochs, 5);
        assert_eq!(hps.train.batch_size, 6);
        assert_eq!(hps.data.sampling_rate, 22050);
        assert_eq!(hps.model.ssl_dim, 768);
        assert_eq!(hps.model.architecture["n_heads"], json!(4));

        let value = serde_json::to_value(&hps).unwrap();
        assert_eq!(value["train"]["custom_flag"], json!(true));
        assert_eq!(value["data"]["contentvec_final_proj"], json!(false));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs/44k/config.json");
        let hps = with_speakers();
        hps.save(&path).unwrap();
        assert_eq!(HParams::load(&path).unwrap(), hps);
    }
}
