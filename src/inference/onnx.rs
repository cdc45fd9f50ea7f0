//! ONNX Runtime backed networks.
//!
//! The graphs are expected to be exported with named inputs and outputs:
//!
//! * Content encoder: input `source` shaped `[1, samples]` of 16kHz audio, first output shaped
//!   `[1, frames, dim]`.
//! * Synthesizer: inputs `c` `[1, dim, frames]`, `f0` `[1, frames]`, `uv` `[1, frames]`, `g`
//!   `[1, 1]` (i64 speaker ID), `noise_scale` `[1]` and `predict_f0` `[1]` (bool). Output `audio`
//!   of any shape, it's flattened.
//!
//! Naming the tensors rather than relying on positional order makes it much harder to plug a
//! differently exported graph in and get garbage out without an error.
use super::{ContentEncoder, SynthesisInput, Synthesizer};
use anyhow::Context;
use ndarray::{Array1, Array2, Axis, Ix2};
use ort::{inputs, CPUExecutionProvider, CUDAExecutionProvider, GraphOptimizationLevel, Session};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Where the networks run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda),
            _ => anyhow::bail!("unknown device '{}', expected cpu or cuda", s),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda => write!(f, "cuda"),
        }
    }
}

/// Initialises the ONNX Runtime environment. ort calls into a C++ library with its own global
/// state, committing again just replaces it so this is fine to call once per model load.
pub fn init_runtime(device: Device) -> anyhow::Result<()> {
    let providers = match device {
        Device::Cpu => vec![CPUExecutionProvider::default().build()],
        // CPU is kept as a fallback for operators CUDA doesn't implement
        Device::Cuda => vec![
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
    };
    info!("Initialising ONNX Runtime on {}", device);
    ort::init()
        .with_name("xd_svc")
        .with_execution_providers(&providers)
        .commit()?;
    Ok(())
}

fn load_session(path: &Path, what: &str) -> anyhow::Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_model_from_file(path)
        .with_context(|| format!("converting {} ({}) to runnable model", what, path.display()))?;
    Ok(session)
}

/// HuBERT/ContentVec style content encoder.
pub struct OrtContentEncoder {
    model: Session,
}

impl OrtContentEncoder {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let model = load_session(path.as_ref(), "content encoder")?;
        Ok(Self { model })
    }
}

impl ContentEncoder for OrtContentEncoder {
    fn encode(&self, audio: &[f32]) -> anyhow::Result<Array2<f32>> {
        let source = Array2::from_shape_vec((1, audio.len()), audio.to_vec())
            .context("failed to make audio tensor")?;

        let outputs = self.model.run(inputs!["source" => source.view()]?)?;

        let units = outputs[0]
            .extract_tensor::<f32>()?
            .view()
            .clone()
            .remove_axis(Axis(0))
            .into_dimensionality::<Ix2>()?
            .t()
            .to_owned();

        Ok(units)
    }
}

/// The generator of a trained model.
pub struct OrtSynthesizer {
    model: Session,
}

impl OrtSynthesizer {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let model = load_session(path.as_ref(), "synthesizer")?;
        Ok(Self { model })
    }
}

impl Synthesizer for OrtSynthesizer {
    fn synthesize(&self, input: SynthesisInput) -> anyhow::Result<Vec<f32>> {
        let frames = input.f0.len();
        let content = input.content.to_owned().insert_axis(Axis(0));
        let f0 = Array2::from_shape_vec((1, frames), input.f0.to_vec())
            .context("failed to make f0 tensor")?;
        let uv = Array2::from_shape_vec((1, frames), input.uv.to_vec())
            .context("failed to make uv tensor")?;
        let g = Array2::from_elem((1, 1), input.speaker_id as i64);
        let noise_scale = Array1::from_vec(vec![input.noise_scale]);
        let predict_f0 = Array1::from_vec(vec![input.predict_f0]);

        let inputs = inputs![
            "c" => content.view(),
            "f0" => f0.view(),
            "uv" => uv.view(),
            "g" => g.view(),
            "noise_scale" => noise_scale.view(),
            "predict_f0" => predict_f0.view(),
        ]?;

        let outputs = self.model.run(inputs)?;

        let audio = outputs["audio"]
            .extract_tensor::<f32>()?
            .view()
            .iter()
            .cloned()
            .collect();

        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda);
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::default().to_string(), "cpu");
    }
}
