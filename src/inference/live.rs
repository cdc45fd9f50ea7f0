//! Live conversion between audio devices.
//!
//! cpal gives us separate input and output streams running on their own threads. The input
//! callback only downmixes and forwards samples, all the conversion happens on the calling thread
//! so the converter (which borrows the model) never has to cross a thread boundary. Converted
//! audio goes into a queue the output callback drains, playing silence if it runs dry.
use super::realtime::{find_device_index, BlockBuffer, RealtimeConverter};
use crate::audio::{resample, to_mono};
use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};
use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct LiveOptions {
    /// Index or name of the input device, the host default if unset
    pub input_device: Option<String>,
    /// Index or name of the output device, the host default if unset
    pub output_device: Option<String>,
    pub block_seconds: f32,
    /// Stop after this long, otherwise runs until the process is interrupted
    pub duration: Option<Duration>,
}

fn device_name(device: &Device) -> String {
    device.name().unwrap_or_else(|_| "<unknown>".to_string())
}

fn select_device(
    devices: Vec<Device>,
    default: Option<Device>,
    query: Option<&str>,
    kind: &str,
) -> anyhow::Result<Device> {
    let query = match query {
        Some(q) => q,
        None => return default.with_context(|| format!("no default {} device", kind)),
    };
    let names: Vec<String> = devices.iter().map(device_name).collect();
    match find_device_index(&names, query).and_then(|i| devices.into_iter().nth(i)) {
        Some(device) => Ok(device),
        None => {
            warn!(
                "No {} device matching '{}', using the default. Available: {:?}",
                kind, query, names
            );
            default.with_context(|| format!("no default {} device", kind))
        }
    }
}

/// Logs every device the default host can see, with the indexes `--input-device` and
/// `--output-device` accept.
pub fn list_devices() -> anyhow::Result<()> {
    let host = cpal::default_host();
    for (i, device) in host.input_devices()?.enumerate() {
        info!("Input {}: {}", i, device_name(&device));
    }
    for (i, device) in host.output_devices()?.enumerate() {
        info!("Output {}: {}", i, device_name(&device));
    }
    Ok(())
}

/// Prefers an f32 stream at the model's rate, otherwise takes the highest rate on offer and
/// resamples.
fn pick_config(
    ranges: Vec<SupportedStreamConfigRange>,
    sample_rate: u32,
) -> anyhow::Result<StreamConfig> {
    let ranges: Vec<_> = ranges
        .into_iter()
        .filter(|r| r.sample_format() == SampleFormat::F32)
        .collect();
    if let Some(range) = ranges
        .iter()
        .find(|r| r.min_sample_rate().0 <= sample_rate && sample_rate <= r.max_sample_rate().0)
    {
        return Ok(range
            .clone()
            .with_sample_rate(SampleRate(sample_rate))
            .config());
    }
    let range = ranges
        .into_iter()
        .next()
        .context("device doesn't support f32 streams")?;
    Ok(range.with_max_sample_rate().config())
}

/// Streams the input device through the converter to the output device.
pub fn realtime_devices(
    converter: &mut dyn RealtimeConverter,
    model_rate: u32,
    opts: &LiveOptions,
) -> anyhow::Result<()> {
    let host = cpal::default_host();
    let input = select_device(
        host.input_devices()?.collect(),
        host.default_input_device(),
        opts.input_device.as_deref(),
        "input",
    )?;
    let output = select_device(
        host.output_devices()?.collect(),
        host.default_output_device(),
        opts.output_device.as_deref(),
        "output",
    )?;

    let in_config = pick_config(input.supported_input_configs()?.collect(), model_rate)?;
    let out_config = pick_config(output.supported_output_configs()?.collect(), model_rate)?;
    let in_rate = in_config.sample_rate.0;
    let out_rate = out_config.sample_rate.0;
    info!(
        "Input: {} at {}Hz, output: {} at {}Hz, model at {}Hz",
        device_name(&input),
        in_rate,
        device_name(&output),
        out_rate,
        model_rate
    );

    let (tx, rx) = mpsc::channel::<Vec<f32>>();
    let in_channels = in_config.channels as usize;
    let input_stream = input
        .build_input_stream(
            &in_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // The receiver only goes away when we're shutting down
                let _ = tx.send(to_mono(data, in_channels));
            },
            |e| error!("Input stream error: {}", e),
            None,
        )
        .context("building input stream")?;

    let queue = Arc::new(Mutex::new(VecDeque::<f32>::new()));
    let out_queue = queue.clone();
    let out_channels = (out_config.channels as usize).max(1);
    let output_stream = output
        .build_output_stream(
            &out_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = match out_queue.lock() {
                    Ok(q) => q,
                    Err(poisoned) => poisoned.into_inner(),
                };
                for frame in data.chunks_mut(out_channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.iter_mut().for_each(|s| *s = sample);
                }
            },
            |e| error!("Output stream error: {}", e),
            None,
        )
        .context("building output stream")?;

    input_stream.play().context("starting input stream")?;
    output_stream.play().context("starting output stream")?;

    let block_len = (opts.block_seconds * in_rate as f32) as usize;
    let mut buffer = BlockBuffer::new(block_len);
    let start = Instant::now();
    info!("Streaming in blocks of {} samples", block_len);
    loop {
        if let Some(duration) = opts.duration {
            if start.elapsed() >= duration {
                break;
            }
        }
        let samples = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(samples) => samples,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => anyhow::bail!("input stream stopped"),
        };
        for block in buffer.push(&samples) {
            let block = resample(&block, in_rate, model_rate);
            let converted = converter.process(&block)?;
            let converted = resample(&converted, model_rate, out_rate);
            let mut queue = queue
                .lock()
                .map_err(|_| anyhow::anyhow!("output queue poisoned"))?;
            queue.extend(converted);
            let queued_seconds = queue.len() as f32 / out_rate as f32;
            debug!("Output queue: {:.2}s", queued_seconds);
            if queued_seconds > 4.0 * opts.block_seconds {
                warn!(
                    "Conversion is running ahead of playback by {:.2}s",
                    queued_seconds
                );
            }
        }
    }
    info!("Stopped after {:.1}s", start.elapsed().as_secs_f32());
    Ok(())
}
