//! Voice conversion inference.
//!
//! The conversion model is two networks. A content encoder (HuBERT/ContentVec style) turns 16kHz
//! audio into speaker independent content features, and a synthesizer renders those features in
//! the target speaker's voice, conditioned on the pitch contour of the source. Both are opaque
//! graphs to this crate, they're hidden behind the [`ContentEncoder`] and [`Synthesizer`] traits so
//! the pipeline around them doesn't care whether they're ONNX sessions or something in a test.
//!
//! The pipeline for one piece of audio is:
//!
//! 1. Extract f0 at the model's hop size, fill unvoiced gaps and apply the transpose
//! 2. Resample to 16kHz and run the content encoder
//! 3. Stretch the content features to the f0 frame count
//! 4. Optionally pull the features towards the target speaker's cluster centres
//! 5. Synthesize
//!
//! Long inputs go through [`Svc::infer_silence`] which only converts the non-silent regions. Each
//! region is zero padded before inference so the model has some context at the edges, and the
//! padding is cut back off afterwards.
use crate::audio::{load_wav_resampled, pad_array, split_silence, write_wav, Reference};
use crate::checkpoint::resolve_generator;
use crate::f0::*;
use crate::hparams::HParams;
use ndarray::{Array2, ArrayView2};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

pub mod cluster;
#[cfg(feature = "live")]
pub mod live;
pub mod onnx;
pub mod realtime;

pub use crate::hparams::Speaker;
pub use cluster::ClusterModel;
pub use onnx::{init_runtime, Device, OrtContentEncoder, OrtSynthesizer};
pub use realtime::*;

/// Turns 16kHz mono audio into content features shaped `[dim, frames]`.
pub trait ContentEncoder {
    fn encode(&self, audio: &[f32]) -> anyhow::Result<Array2<f32>>;
}

/// Everything the synthesizer is conditioned on. Kept in a struct rather than a long parameter
/// list, most of the values are the same type and easy to mix up.
#[derive(Debug, Clone)]
pub struct SynthesisInput<'a> {
    /// Content features `[dim, frames]`
    pub content: ArrayView2<'a, f32>,
    /// Pitch contour in Hz, one value per frame
    pub f0: &'a [f32],
    /// Voiced mask, one value per frame
    pub uv: &'a [f32],
    pub speaker_id: usize,
    pub noise_scale: f32,
    /// Let the model predict its own f0 instead of following the source, useful for speech where
    /// following the source pitch sounds off when the speakers' ranges differ.
    pub predict_f0: bool,
}

/// Renders content features as audio at the model's sample rate.
pub trait Synthesizer {
    fn synthesize(&self, input: SynthesisInput) -> anyhow::Result<Vec<f32>>;
}

/// Options for converting a piece of audio.
#[derive(Debug, Clone, PartialEq)]
pub struct InferOptions {
    /// Pitch shift in semitones
    pub transpose: i32,
    pub auto_predict_f0: bool,
    /// 0 uses the content features as is, 1 replaces them entirely with cluster centres
    pub cluster_infer_ratio: f32,
    pub noise_scale: f32,
}

impl Default for InferOptions {
    fn default() -> Self {
        Self {
            transpose: 0,
            auto_predict_f0: false,
            cluster_infer_ratio: 0.0,
            noise_scale: 0.4,
        }
    }
}

/// How the input is split up before conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceOptions {
    /// Frames quieter than this (dB) are silence
    pub db_thresh: i32,
    /// Zero padding added either side of each speech region
    pub pad_seconds: f32,
    /// Upper bound on the analysis frame used for silence detection
    pub chunk_seconds: f32,
    /// Measure against full scale rather than the loudest part of the input
    pub absolute_thresh: bool,
}

impl Default for SliceOptions {
    fn default() -> Self {
        Self {
            db_thresh: -40,
            pad_seconds: 0.5,
            chunk_seconds: 0.5,
            absolute_thresh: false,
        }
    }
}

/// Hop used for silence detection, half of the analysis frame. Long enough to hold 20 periods of
/// the lowest pitch unless the user asks for shorter chunks.
pub fn chunk_length_min(sample_rate: u32, chunk_seconds: f32) -> usize {
    let sr = sample_rate as f32;
    let len = (sr / F0_MIN * 20.0 + 1.0).min(chunk_seconds * sr) as usize;
    (len / 2).max(1)
}

/// A loaded voice conversion model.
pub struct Svc {
    hps: HParams,
    encoder: Box<dyn ContentEncoder>,
    synthesizer: Box<dyn Synthesizer>,
    cluster: Option<ClusterModel>,
}

impl Svc {
    pub fn new(
        hps: HParams,
        encoder: Box<dyn ContentEncoder>,
        synthesizer: Box<dyn Synthesizer>,
    ) -> Self {
        Self {
            hps,
            encoder,
            synthesizer,
            cluster: None,
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterModel) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Loads the ONNX graphs for a model.
    ///
    /// `model_path` is a model directory, a `G_*.pth` checkpoint or a generator `.onnx` (see
    /// [`resolve_generator`]). The cluster model is optional and silently skipped if the path
    /// doesn't exist, matching how the default path is always passed by the CLI.
    pub fn load(
        model_path: impl AsRef<Path>,
        config_path: impl AsRef<Path>,
        encoder_path: impl AsRef<Path>,
        cluster_model_path: Option<&Path>,
        device: Device,
    ) -> anyhow::Result<Self> {
        let hps = HParams::load(config_path)?;
        init_runtime(device)?;

        let generator = resolve_generator(model_path)?;
        let synthesizer = OrtSynthesizer::load(&generator)?;
        let encoder = OrtContentEncoder::load(encoder_path)?;

        let mut svc = Self::new(hps, Box::new(encoder), Box::new(synthesizer));
        if let Some(path) = cluster_model_path {
            if path.exists() {
                svc = svc.with_cluster(ClusterModel::load(path)?);
            } else {
                debug!("No cluster model at {}", path.display());
            }
        }
        Ok(svc)
    }

    pub fn hparams(&self) -> &HParams {
        &self.hps
    }

    /// Sample rate the model consumes and produces.
    pub fn target_sample(&self) -> u32 {
        self.hps.data.sampling_rate
    }

    pub fn hop_size(&self) -> usize {
        self.hps.data.hop_length
    }

    fn speaker_name(&self, speaker: &Speaker) -> Option<String> {
        match speaker {
            Speaker::Name(name) if self.hps.spk.contains_key(name) => Some(name.clone()),
            Speaker::Name(_) => None,
            Speaker::Id(id) => self
                .hps
                .spk
                .iter()
                .find(|(_, v)| *v == id)
                .map(|(k, _)| k.clone()),
        }
    }

    /// Content features, f0 and voiced mask for the audio, all with the same frame count.
    fn get_unit_f0(
        &self,
        audio: &[f32],
        speaker: &Speaker,
        opts: &InferOptions,
    ) -> anyhow::Result<(Array2<f32>, Vec<f32>, Vec<f32>)> {
        let f0 = compute_f0(audio, self.target_sample(), self.hop_size());
        let (mut f0, uv) = interpolate_f0(&f0);
        transpose(&mut f0, opts.transpose);

        let wav16k = crate::audio::resample(audio, self.target_sample(), HUBERT_SAMPLING_RATE);
        let content = self.encoder.encode(&wav16k)?;
        if content.nrows() != self.hps.model.ssl_dim {
            debug!(
                "Content dim {} differs from configured ssl_dim {}",
                content.nrows(),
                self.hps.model.ssl_dim
            );
        }
        let mut content = repeat_expand(content.view(), f0.len());

        if opts.cluster_infer_ratio != 0.0 {
            match (&self.cluster, self.speaker_name(speaker)) {
                (Some(cluster), Some(name)) if cluster.contains(&name) => {
                    let centres = cluster.nearest_centres(&name, content.view())?;
                    let ratio = opts.cluster_infer_ratio;
                    content = centres * ratio + content * (1.0 - ratio);
                }
                (None, _) => warn!("Cluster ratio set but no cluster model is loaded, ignoring"),
                _ => warn!("No cluster centres for speaker {}, ignoring", speaker),
            }
        }

        Ok((content, f0, uv))
    }

    /// Converts the whole buffer in a single pass.
    pub fn infer(
        &self,
        speaker: &Speaker,
        audio: &[f32],
        opts: &InferOptions,
    ) -> anyhow::Result<Vec<f32>> {
        let speaker_id = self.hps.speaker_id(speaker)?;
        let (content, f0, uv) = self.get_unit_f0(audio, speaker, opts)?;

        let start = Instant::now();
        let output = self.synthesizer.synthesize(SynthesisInput {
            content: content.view(),
            f0: &f0,
            uv: &uv,
            speaker_id,
            noise_scale: opts.noise_scale,
            predict_f0: opts.auto_predict_f0,
        })?;
        let elapsed = start.elapsed().as_secs_f32();
        let realtime_coef = if elapsed > 0.0 {
            output.len() as f32 / (elapsed * self.target_sample() as f32)
        } else {
            f32::INFINITY
        };
        info!(
            "Inference time: {:.2}s, Realtime coef: {:.2} Input shape: {}, Output shape: {}",
            elapsed,
            realtime_coef,
            audio.len(),
            output.len()
        );
        Ok(output)
    }

    /// Converts only the non-silent parts of the audio. Silence comes back as exact zeros and the
    /// output is always the same length as the input.
    pub fn infer_silence(
        &self,
        audio: &[f32],
        speaker: &Speaker,
        opts: &InferOptions,
        slice: &SliceOptions,
    ) -> anyhow::Result<Vec<f32>> {
        let sr = self.target_sample();
        let hop = chunk_length_min(sr, slice.chunk_seconds);
        let reference = if slice.absolute_thresh {
            Reference::Absolute(1.0)
        } else {
            Reference::Max
        };

        let mut result = Vec::with_capacity(audio.len());
        for chunk in split_silence(audio, -slice.db_thresh as f32, reference, hop * 2, hop) {
            debug!(
                "Chunk: speech={} start={} end={}",
                chunk.is_speech, chunk.start, chunk.end
            );
            if !chunk.is_speech {
                result.resize(result.len() + chunk.duration(), 0.0);
                continue;
            }
            let pad_len = (sr as f32 * slice.pad_seconds) as usize;
            let mut padded = vec![0.0; pad_len];
            padded.extend_from_slice(&chunk.audio);
            padded.resize(padded.len() + pad_len, 0.0);

            let converted = self.infer(speaker, &padded, opts)?;
            result.extend(pad_array(&converted, chunk.duration()));
        }
        result.truncate(audio.len());
        Ok(result)
    }
}

/// Where `svc infer` writes by default, `song.wav` becomes `song.out.wav`.
pub fn default_output_path(input: &Path) -> PathBuf {
    input.with_extension("out.wav")
}

/// Converts a wav file, the batch entry point.
pub fn infer_file(
    svc: &Svc,
    input: &Path,
    output: &Path,
    speaker: &Speaker,
    opts: &InferOptions,
    slice: &SliceOptions,
) -> anyhow::Result<()> {
    info!("Converting {} as {}", input.display(), speaker);
    let audio = load_wav_resampled(input, svc.target_sample())?;
    let converted = svc.infer_silence(&audio, speaker, opts, slice)?;
    write_wav(output, &converted, svc.target_sample())?;
    info!("Wrote {}", output.display());
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Emits a fixed value for every frame so tests can see which regions were converted.
    pub(crate) struct ConstantSynth {
        pub hop: usize,
        pub value: f32,
    }

    impl Synthesizer for ConstantSynth {
        fn synthesize(&self, input: SynthesisInput) -> anyhow::Result<Vec<f32>> {
            assert_eq!(input.content.ncols(), input.f0.len());
            assert_eq!(input.uv.len(), input.f0.len());
            Ok(vec![self.value; input.f0.len() * self.hop])
        }
    }

    pub(crate) struct ZeroEncoder;

    impl ContentEncoder for ZeroEncoder {
        fn encode(&self, audio: &[f32]) -> anyhow::Result<Array2<f32>> {
            Ok(Array2::zeros((256, audio.len() / 320)))
        }
    }

    pub(crate) fn test_svc() -> Svc {
        let mut hps = HParams::template();
        hps.spk.insert("speaker0".to_string(), 0);
        let hop = hps.data.hop_length;
        Svc::new(
            hps,
            Box::new(ZeroEncoder),
            Box::new(ConstantSynth { hop, value: 0.5 }),
        )
    }

    pub(crate) fn tone(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / 44100.0).sin())
            .collect()
    }

    #[test]
    fn chunk_length() {
        assert_eq!(chunk_length_min(44100, 0.5), 8820);
        assert_eq!(chunk_length_min(44100, 0.1), 2205);
    }

    #[test]
    fn output_path() {
        assert_eq!(
            default_output_path(Path::new("dir/song.wav")),
            PathBuf::from("dir/song.out.wav")
        );
    }

    #[test]
    fn infer_silence_keeps_length_and_zeros() {
        let svc = test_svc();
        let mut audio = vec![0.0; 44100];
        audio.extend(tone(44100));
        audio.extend(vec![0.0; 44100 + 123]);

        let speaker = Speaker::Name("speaker0".into());
        let out = svc
            .infer_silence(&audio, &speaker, &InferOptions::default(), &SliceOptions::default())
            .unwrap();
        assert_eq!(out.len(), audio.len());
        // Leading and trailing silence are left alone
        assert!(out[..20000].iter().all(|x| *x == 0.0));
        assert!(out[out.len() - 20000..].iter().all(|x| *x == 0.0));
        // The middle of the tone went through the synthesizer
        assert!(out[60000..80000].iter().all(|x| *x == 0.5));
    }

    #[test]
    fn infer_rejects_bad_speaker_id() {
        let svc = test_svc();
        assert!(svc
            .infer(&Speaker::Id(3), &tone(4410), &InferOptions::default())
            .is_err());
        let out = svc
            .infer(&Speaker::Id(0), &tone(4410), &InferOptions::default())
            .unwrap();
        assert_eq!(out.len(), (4410 / 512) * 512);
    }

    #[test]
    fn cluster_skipped_for_speaker_without_centres() {
        use std::collections::BTreeMap;

        let mut centres = BTreeMap::new();
        // Wrong dim on purpose, only blending with these centres can fail
        centres.insert("amy".to_string(), Array2::<f32>::ones((4, 3)));
        let mut svc = test_svc().with_cluster(ClusterModel::new(centres));
        svc.hps.spk.insert("amy".to_string(), 1);

        let opts = InferOptions {
            cluster_infer_ratio: 0.5,
            ..Default::default()
        };
        let out = svc
            .infer(&Speaker::Name("speaker0".into()), &tone(4410), &opts)
            .unwrap();
        assert_eq!(out.len(), (4410 / 512) * 512);
        assert!(svc
            .infer(&Speaker::Name("amy".into()), &tone(4410), &opts)
            .is_err());
    }
}
