use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use xd_svc::inference::*;
use xd_svc::preprocessing::*;
use xd_svc::training::{train, train_cluster, DEFAULT_CLUSTERS};

#[derive(Parser, Debug)]
#[clap(name = "svc", version, about = "Singing voice conversion")]
pub struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resample the raw dataset to the training sample rate
    PreResample {
        /// Directory with one sub-directory of wavs per speaker
        #[clap(short, long, default_value = "./dataset_raw/44k")]
        input_dir: PathBuf,
        #[clap(short, long, default_value = "./dataset/44k")]
        output_dir: PathBuf,
        #[clap(short, long, default_value_t = 44100)]
        sampling_rate: u32,
        /// Worker threads, defaults to the number of cores
        #[clap(short = 'j', long)]
        jobs: Option<usize>,
    },
    /// Split the dataset into file lists and generate config.json
    PreConfig {
        #[clap(short, long, default_value = "./dataset/44k")]
        input_dir: PathBuf,
        /// Directory the train/val/test lists are written to
        #[clap(short, long, default_value = "./filelists/44k")]
        filelist_path: PathBuf,
        #[clap(short, long, default_value = "./configs/44k/config.json")]
        config_path: PathBuf,
    },
    /// Extract content features and f0 for every file in the dataset
    PreHubert {
        #[clap(short, long, default_value = "./dataset/44k")]
        input_dir: PathBuf,
        #[clap(short, long, default_value = "./configs/44k/config.json")]
        config_path: PathBuf,
        /// Content encoder ONNX graph
        #[clap(short, long, default_value = "./models/hubert.onnx")]
        encoder: PathBuf,
        #[clap(short, long, default_value = "cpu")]
        device: Device,
        /// Recompute features that already exist
        #[clap(long)]
        force: bool,
    },
    /// Validate the dataset, prepare the model directory and run a trainer
    Train {
        #[clap(short, long, default_value = "./configs/44k/config.json")]
        config_path: PathBuf,
        /// Directory checkpoints are kept in
        #[clap(short, long, default_value = "./logs/44k")]
        model_path: PathBuf,
        /// Trainer command, called with the config and model directory appended
        #[clap(long)]
        trainer: Option<String>,
    },
    /// Fit per speaker k-means centres on the content features for cluster inference
    TrainCluster {
        #[clap(short, long, default_value = "./dataset/44k")]
        input_dir: PathBuf,
        /// Directory the <speaker>.npy centres are written to
        #[clap(short, long, default_value = "./logs/44k/kmeans")]
        output_path: PathBuf,
        #[clap(short, long, default_value_t = DEFAULT_CLUSTERS)]
        n_clusters: usize,
    },
    /// Convert a wav file
    Infer {
        input_path: PathBuf,
        /// Defaults to <input>.out.wav
        #[clap(short, long)]
        output_path: Option<PathBuf>,
        #[clap(flatten)]
        model: ModelArgs,
        #[clap(flatten)]
        convert: ConvertArgs,
        /// Zero padding either side of each speech region, in seconds
        #[clap(short, long, default_value_t = 0.5)]
        pad_seconds: f32,
        /// Detect silence relative to full scale instead of the loudest part
        #[clap(long)]
        absolute_thresh: bool,
    },
    /// Convert live from an audio device, or a wav file block by block like a live stream
    Vc {
        /// Stream this file instead of an audio device
        input_path: Option<PathBuf>,
        /// Defaults to <input>.out.wav
        #[clap(short, long)]
        output_path: Option<PathBuf>,
        /// Input device index or name, defaults to the system default
        #[clap(long)]
        input_device: Option<String>,
        /// Output device index or name, defaults to the system default
        #[clap(long)]
        output_device: Option<String>,
        /// Log the available audio devices and exit
        #[clap(long)]
        list_devices: bool,
        /// Stop live conversion after this many seconds
        #[clap(long)]
        duration_seconds: Option<f32>,
        #[clap(flatten)]
        model: ModelArgs,
        #[clap(flatten)]
        convert: ConvertArgs,
        /// Zero padding either side of each speech region, in seconds (version 1 only)
        #[clap(short, long, default_value_t = 0.5)]
        pad_seconds: f32,
        /// Overlap between blocks (version 1 only)
        #[clap(long, default_value_t = 0.05)]
        crossfade_seconds: f32,
        #[clap(short, long, default_value_t = 0.5)]
        block_seconds: f32,
        /// 1 crossfades blocks, 2 converts whole utterances
        #[clap(short, long, default_value_t = 2)]
        version: u8,
        /// Version 1: convert blocks whole, gated by RMS, instead of splitting on silence
        #[clap(long)]
        no_split: bool,
    },
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Model directory, G_*.pth checkpoint or generator .onnx
    #[clap(short, long, default_value = "./logs/44k")]
    model_path: PathBuf,
    #[clap(short, long, default_value = "./configs/44k/config.json")]
    config_path: PathBuf,
    /// Content encoder ONNX graph
    #[clap(short, long, default_value = "./models/hubert.onnx")]
    encoder: PathBuf,
    /// Directory of per speaker cluster centres
    #[clap(short = 'k', long, default_value = "./logs/44k/kmeans")]
    cluster_model_path: PathBuf,
    #[clap(long, default_value = "cpu")]
    device: Device,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Target speaker, defaults to the first speaker in the config
    #[clap(short, long)]
    speaker: Option<String>,
    /// Pitch shift in semitones
    #[clap(short, long, default_value_t = 0, allow_hyphen_values = true)]
    transpose: i32,
    /// Let the model predict f0, better for speech, makes singing go off key
    #[clap(short, long)]
    auto_predict_f0: bool,
    #[clap(short = 'r', long, default_value_t = 0.0)]
    cluster_infer_ratio: f32,
    #[clap(short, long, default_value_t = 0.4)]
    noise_scale: f32,
    /// Silence threshold in dB
    #[clap(short, long, default_value_t = -40, allow_hyphen_values = true)]
    db_thresh: i32,
    #[clap(long, default_value_t = 0.5)]
    chunk_seconds: f32,
}

impl ModelArgs {
    fn load(&self) -> anyhow::Result<Svc> {
        Svc::load(
            &self.model_path,
            &self.config_path,
            &self.encoder,
            Some(self.cluster_model_path.as_path()),
            self.device,
        )
    }
}

impl ConvertArgs {
    fn speaker(&self, svc: &Svc) -> anyhow::Result<Speaker> {
        match &self.speaker {
            Some(s) => Ok(Speaker::Name(s.clone())),
            None => match svc.hparams().default_speaker() {
                Some(s) => Ok(Speaker::Name(s.to_string())),
                None => anyhow::bail!("config has no speakers, pass --speaker"),
            },
        }
    }

    fn infer_options(&self) -> InferOptions {
        InferOptions {
            transpose: self.transpose,
            auto_predict_f0: self.auto_predict_f0,
            cluster_infer_ratio: self.cluster_infer_ratio,
            noise_scale: self.noise_scale,
        }
    }

    fn slice_options(&self, pad_seconds: f32, absolute_thresh: bool) -> SliceOptions {
        SliceOptions {
            db_thresh: self.db_thresh,
            pad_seconds,
            chunk_seconds: self.chunk_seconds,
            absolute_thresh,
        }
    }
}

fn output_or_default(output: Option<PathBuf>, input: &Path) -> PathBuf {
    output.unwrap_or_else(|| default_output_path(input))
}

struct DeviceArgs {
    input_device: Option<String>,
    output_device: Option<String>,
    block_seconds: f32,
    duration_seconds: Option<f32>,
}

#[cfg(feature = "live")]
fn stream_devices(
    converter: &mut dyn RealtimeConverter,
    sample_rate: u32,
    args: DeviceArgs,
) -> anyhow::Result<()> {
    let opts = xd_svc::inference::live::LiveOptions {
        input_device: args.input_device,
        output_device: args.output_device,
        block_seconds: args.block_seconds,
        duration: args
            .duration_seconds
            .map(|s| std::time::Duration::from_secs_f32(s.max(0.0))),
    };
    xd_svc::inference::live::realtime_devices(converter, sample_rate, &opts)
}

#[cfg(not(feature = "live"))]
fn stream_devices(
    _converter: &mut dyn RealtimeConverter,
    _sample_rate: u32,
    _args: DeviceArgs,
) -> anyhow::Result<()> {
    anyhow::bail!(
        "built without audio device support, pass an input file or rebuild with --features live"
    )
}

#[cfg(feature = "live")]
fn list_audio_devices() -> anyhow::Result<()> {
    xd_svc::inference::live::list_devices()
}

#[cfg(not(feature = "live"))]
fn list_audio_devices() -> anyhow::Result<()> {
    anyhow::bail!("built without audio device support, rebuild with --features live")
}

fn main() -> anyhow::Result<()> {
    xd_svc::setup_logging();
    let args = Cli::parse();

    match args.command {
        Command::PreResample {
            input_dir,
            output_dir,
            sampling_rate,
            jobs,
        } => {
            let jobs = jobs.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });
            preprocess_resample(&input_dir, &output_dir, sampling_rate, jobs)?;
        }
        Command::PreConfig {
            input_dir,
            filelist_path,
            config_path,
        } => {
            preprocess_config(
                &input_dir,
                filelist_path.join("train.txt"),
                filelist_path.join("val.txt"),
                filelist_path.join("test.txt"),
                &config_path,
            )?;
        }
        Command::PreHubert {
            input_dir,
            config_path,
            encoder,
            device,
            force,
        } => {
            init_runtime(device)?;
            let encoder = OrtContentEncoder::load(&encoder)?;
            preprocess_hubert_f0(&input_dir, &config_path, &encoder, force)?;
        }
        Command::Train {
            config_path,
            model_path,
            trainer,
        } => {
            let summary = train(&config_path, &model_path, trainer.as_deref())?;
            info!("{:?}", summary);
        }
        Command::TrainCluster {
            input_dir,
            output_path,
            n_clusters,
        } => {
            train_cluster(&input_dir, &output_path, n_clusters)?;
        }
        Command::Infer {
            input_path,
            output_path,
            model,
            convert,
            pad_seconds,
            absolute_thresh,
        } => {
            let svc = model.load()?;
            let speaker = convert.speaker(&svc)?;
            let output = output_or_default(output_path, &input_path);
            infer_file(
                &svc,
                &input_path,
                &output,
                &speaker,
                &convert.infer_options(),
                &convert.slice_options(pad_seconds, absolute_thresh),
            )?;
        }
        Command::Vc {
            input_path,
            output_path,
            input_device,
            output_device,
            list_devices,
            duration_seconds,
            model,
            convert,
            pad_seconds,
            crossfade_seconds,
            block_seconds,
            version,
            no_split,
        } => {
            if list_devices {
                return list_audio_devices();
            }
            let svc = model.load()?;
            let speaker = convert.speaker(&svc)?;
            let sr = svc.target_sample();
            let opts = convert.infer_options();
            let slice = convert.slice_options(pad_seconds, true);
            let mut converter: Box<dyn RealtimeConverter + '_> = match version {
                1 => Box::new(RealtimeVc::new(
                    &svc,
                    (crossfade_seconds * sr as f32) as usize,
                    !no_split,
                    speaker,
                    opts,
                    slice,
                )),
                2 => Box::new(RealtimeVc2::new(&svc, speaker, opts, slice)),
                v => anyhow::bail!("unknown realtime version {}, expected 1 or 2", v),
            };

            match input_path {
                Some(input_path) => {
                    let output = output_or_default(output_path, &input_path);
                    realtime_file(converter.as_mut(), &input_path, &output, sr, block_seconds)?;
                }
                None => {
                    let devices = DeviceArgs {
                        input_device,
                        output_device,
                        block_seconds,
                        duration_seconds,
                    };
                    stream_devices(converter.as_mut(), sr, devices)?;
                }
            }
        }
    }
    Ok(())
}
