//! Near real-time conversion. Audio arrives in fixed size blocks and each call has to hand back a
//! block of the same size, so these converters trade latency for continuity in two different ways.
//!
//! [`RealtimeVc`] converts every block together with the tail of the previous one and crossfades
//! across the overlap. Simple, but the model only ever sees a block's worth of context and words
//! get cut at block edges.
//!
//! [`RealtimeVc2`] buffers input until a speech region is complete, converts whole regions and
//! makes up the time it spent waiting by playing the following silence back shorter. This gives
//! the model whole utterances at the cost of variable latency.
use super::{chunk_length_min, InferOptions, SliceOptions, Speaker, Svc};
use crate::audio::{
    linspace, load_wav_resampled, pad_array, rms, split_silence, write_wav, Chunk, Reference,
};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, info};

/// Something that turns a block of input into an equal length block of output.
pub trait RealtimeConverter {
    fn process(&mut self, input: &[f32]) -> anyhow::Result<Vec<f32>>;
}

/// Overlap and crossfade state between consecutive blocks.
///
/// ```text
/// blocks          : ■■■■■■□□□□□□
/// add last input  :□■■■■■■
///                        ■□□□□□□
/// infer           :□■■■■■■
///                        ■□□□□□□
/// crossfade       :▲■■■■■
///                        ▲□□□□□
/// ```
///
/// The output is delayed by `crossfade_len` samples relative to the input.
#[derive(Debug, Clone)]
pub struct Crossfader {
    crossfade_len: usize,
    last_input_left: Vec<f32>,
    last_inferred_left: Vec<f32>,
    fade_in: Vec<f32>,
    fade_out: Vec<f32>,
}

impl Crossfader {
    pub fn new(crossfade_len: usize) -> Self {
        Self {
            crossfade_len,
            last_input_left: vec![0.0; crossfade_len],
            last_inferred_left: vec![0.0; crossfade_len],
            fade_in: linspace(0.0, 1.0, crossfade_len),
            fade_out: linspace(1.0, 0.0, crossfade_len),
        }
    }

    pub fn crossfade_len(&self) -> usize {
        self.crossfade_len
    }

    /// Runs `infer` over the block prefixed with the previous block's tail. The inference has to
    /// return exactly as many samples as it was given.
    pub fn process<F>(&mut self, input: &[f32], infer: F) -> anyhow::Result<Vec<f32>>
    where
        F: FnOnce(&[f32]) -> anyhow::Result<Vec<f32>>,
    {
        let cf = self.crossfade_len;
        if input.len() < cf {
            anyhow::bail!(
                "Input audio length ({}) should be at least crossfade length ({}).",
                input.len(),
                cf
            );
        }
        let mut joined = Vec::with_capacity(cf + input.len());
        joined.extend_from_slice(&self.last_input_left);
        joined.extend_from_slice(input);

        let inferred = infer(&joined)?;
        if inferred.len() != joined.len() {
            anyhow::bail!(
                "Inferred audio length ({}) should be equal to input audio length ({}).",
                inferred.len(),
                joined.len()
            );
        }

        let mut result = Vec::with_capacity(input.len());
        result.extend((0..cf).map(|i| {
            self.last_inferred_left[i] * self.fade_out[i] + inferred[i] * self.fade_in[i]
        }));
        result.extend_from_slice(&inferred[cf..inferred.len() - cf]);

        self.last_input_left = input[input.len() - cf..].to_vec();
        self.last_inferred_left = inferred[inferred.len() - cf..].to_vec();
        Ok(result)
    }
}

/// Block-wise converter with crossfading between blocks.
pub struct RealtimeVc<'a> {
    svc: &'a Svc,
    crossfader: Crossfader,
    /// Convert only the speech inside each block rather than gating the whole block
    split: bool,
    speaker: Speaker,
    opts: InferOptions,
    slice: SliceOptions,
}

impl<'a> RealtimeVc<'a> {
    pub fn new(
        svc: &'a Svc,
        crossfade_len: usize,
        split: bool,
        speaker: Speaker,
        opts: InferOptions,
        slice: SliceOptions,
    ) -> Self {
        Self {
            svc,
            crossfader: Crossfader::new(crossfade_len),
            split,
            speaker,
            opts,
            // There's no global view of a stream, so the threshold is always absolute
            slice: SliceOptions {
                absolute_thresh: true,
                ..slice
            },
        }
    }

    fn infer(&self, input: &[f32]) -> anyhow::Result<Vec<f32>> {
        if self.split {
            return self
                .svc
                .infer_silence(input, &self.speaker, &self.opts, &self.slice);
        }
        let rms = rms(input);
        let min_rms = 10.0f32.powf(self.slice.db_thresh as f32 / 20.0);
        if rms < min_rms {
            info!("Skip silence: RMS={:.2} < {:.2}", rms, min_rms);
            Ok(input.to_vec())
        } else {
            info!("Start inference: RMS={:.2} >= {:.2}", rms, min_rms);
            let converted = self.svc.infer(&self.speaker, input, &self.opts)?;
            // The synthesizer works in whole hops so the tail can be short
            Ok(pad_array(&converted, input.len()))
        }
    }
}

impl<'a> RealtimeConverter for RealtimeVc<'a> {
    fn process(&mut self, input: &[f32]) -> anyhow::Result<Vec<f32>> {
        let mut crossfader = std::mem::replace(&mut self.crossfader, Crossfader::new(0));
        let result = crossfader.process(input, |x| self.infer(x));
        self.crossfader = crossfader;
        result
    }
}

/// Utterance level converter. Holds back incomplete speech and compresses silence to catch up.
pub struct RealtimeVc2<'a> {
    svc: &'a Svc,
    input_audio_store: Vec<f32>,
    chunk_store: VecDeque<Chunk>,
    speaker: Speaker,
    opts: InferOptions,
    slice: SliceOptions,
}

impl<'a> RealtimeVc2<'a> {
    pub fn new(svc: &'a Svc, speaker: Speaker, opts: InferOptions, slice: SliceOptions) -> Self {
        Self {
            svc,
            input_audio_store: vec![],
            chunk_store: VecDeque::new(),
            speaker,
            opts,
            slice,
        }
    }

    /// Samples of converted or pending audio waiting to be played.
    pub fn pending(&self) -> usize {
        self.chunk_store.iter().map(|c| c.duration()).sum()
    }
}

impl<'a> RealtimeConverter for RealtimeVc2<'a> {
    fn process(&mut self, input: &[f32]) -> anyhow::Result<Vec<f32>> {
        self.input_audio_store.extend_from_slice(input);
        debug!("input_audio_store: {}", self.input_audio_store.len());

        let hop = chunk_length_min(self.svc.target_sample(), self.slice.chunk_seconds);
        let mut chunks = split_silence(
            &self.input_audio_store,
            -self.slice.db_thresh as f32,
            Reference::Absolute(1.0),
            hop * 2,
            hop,
        );

        // The last speech chunk may still be going, keep it for the next call
        if chunks.last().map(|c| c.is_speech).unwrap_or(false) {
            if let Some(last) = chunks.pop() {
                self.input_audio_store = last.audio;
            }
        } else {
            self.input_audio_store.clear();
        }

        for mut chunk in chunks {
            if chunk.is_speech {
                chunk.audio = self.svc.infer(&self.speaker, &chunk.audio, &self.opts)?;
            }
            self.chunk_store.push_back(chunk);
        }

        let total_speech: usize = self
            .chunk_store
            .iter()
            .filter(|c| c.is_speech)
            .map(|c| c.duration())
            .sum();
        let total_silence: usize = self
            .chunk_store
            .iter()
            .filter(|c| !c.is_speech)
            .map(|c| c.duration())
            .sum();
        let input_len = input.len();
        let available = input_len.saturating_sub(total_speech);
        debug!(
            "Total speech len: {}, silence len: {}, silence compress rate: {}",
            total_speech,
            total_silence,
            total_silence as f32 / available as f32
        );

        let mut output = Vec::with_capacity(input_len);
        while let Some(mut chunk) = self.chunk_store.pop_front() {
            let left_len = input_len.saturating_sub(output.len());
            let duration = chunk.duration();
            // Silence plays back at total_silence / available of its length, worked out in whole
            // samples so the backlog drains exactly once the speech has been played
            let (duration_output, duration_input) = if chunk.is_speech {
                let n = duration.min(left_len);
                (n, n)
            } else if available == 0 || total_silence == 0 {
                (0, duration)
            } else {
                let out = (duration * available / total_silence).min(left_len);
                let consumed = (left_len * total_silence + available - 1) / available;
                (out, consumed.min(duration))
            };
            debug!(
                "Chunk duration output: {}, input: {}, left len: {}",
                duration_output, duration_input, left_len
            );

            let mut stop = false;
            if duration > duration_input {
                let rest = chunk.audio.split_off(duration_input);
                self.chunk_store.push_front(Chunk {
                    is_speech: chunk.is_speech,
                    audio: rest,
                    start: chunk.start + duration_input,
                    end: chunk.end,
                });
                stop = true;
            }

            if chunk.is_speech {
                output.extend_from_slice(&chunk.audio);
            } else {
                output.resize(output.len() + duration_output, 0.0);
            }
            if stop {
                break;
            }
        }

        output.resize(input_len, 0.0);
        Ok(output)
    }
}

/// Regroups audio arriving in whatever sizes a device callback hands over into fixed size blocks.
#[derive(Debug, Clone)]
pub struct BlockBuffer {
    block_len: usize,
    pending: Vec<f32>,
}

impl BlockBuffer {
    pub fn new(block_len: usize) -> Self {
        Self {
            block_len: block_len.max(1),
            pending: Vec::with_capacity(block_len),
        }
    }

    /// Adds samples, returning every block that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.block_len * self.block_len;
        let rest = self.pending.split_off(complete);
        let full = std::mem::replace(&mut self.pending, rest);
        full.chunks(self.block_len).map(|x| x.to_vec()).collect()
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Finds a device from a user query, either its index in `names` or its name. An exact
/// (case-insensitive) name wins over a partial one.
pub fn find_device_index(names: &[String], query: &str) -> Option<usize> {
    if let Ok(index) = query.parse::<usize>() {
        return (index < names.len()).then_some(index);
    }
    let query = query.to_lowercase();
    names
        .iter()
        .position(|name| name.to_lowercase() == query)
        .or_else(|| names.iter().position(|name| name.to_lowercase().contains(&query)))
}

/// Pushes a whole buffer through a converter in `block_len` blocks, as an audio callback would.
/// The final partial block is zero padded and the output trimmed back to the input length.
pub fn process_blocks(
    converter: &mut dyn RealtimeConverter,
    audio: &[f32],
    block_len: usize,
) -> anyhow::Result<Vec<f32>> {
    if block_len == 0 {
        anyhow::bail!("block length must be non-zero");
    }
    let mut output = Vec::with_capacity(audio.len() + block_len);
    for block in audio.chunks(block_len) {
        if block.len() == block_len {
            output.extend(converter.process(block)?);
        } else {
            let mut padded = block.to_vec();
            padded.resize(block_len, 0.0);
            output.extend(converter.process(&padded)?);
        }
    }
    output.truncate(audio.len());
    Ok(output)
}

/// Streams a wav file through a converter in blocks of `block_seconds` and writes the result. The
/// input is resampled to the model rate first.
pub fn realtime_file(
    converter: &mut dyn RealtimeConverter,
    input: &Path,
    output: &Path,
    sample_rate: u32,
    block_seconds: f32,
) -> anyhow::Result<()> {
    let audio = load_wav_resampled(input, sample_rate)?;
    let block_len = (block_seconds * sample_rate as f32) as usize;
    info!(
        "Streaming {} in blocks of {} samples",
        input.display(),
        block_len
    );
    let converted = process_blocks(converter, &audio, block_len)?;
    write_wav(output, &converted, sample_rate)?;
    info!("Wrote {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_svc, tone, ZeroEncoder};
    use super::super::{SynthesisInput, Synthesizer};
    use super::*;
    use crate::hparams::HParams;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Like the constant synthesizer but keeps count of how much audio it has produced.
    struct CountingSynth {
        hop: usize,
        produced: Rc<Cell<usize>>,
    }

    impl Synthesizer for CountingSynth {
        fn synthesize(&self, input: SynthesisInput) -> anyhow::Result<Vec<f32>> {
            let len = input.f0.len() * self.hop;
            self.produced.set(self.produced.get() + len);
            Ok(vec![0.5; len])
        }
    }

    #[test]
    fn crossfader_identity_is_delayed_input() {
        let mut cf = Crossfader::new(100);
        let ramp: Vec<f32> = (0..2000).map(|i| i as f32).collect();

        let first = cf.process(&ramp[..1000], |x| Ok(x.to_vec())).unwrap();
        assert_eq!(first.len(), 1000);
        assert!(first[..100].iter().all(|x| *x == 0.0));
        assert_eq!(&first[100..], &ramp[..900]);

        let second = cf.process(&ramp[1000..], |x| Ok(x.to_vec())).unwrap();
        assert_eq!(second.len(), 1000);
        // Both sides of the crossfade are the same signal so it's seamless
        for (out, expected) in second.iter().zip(&ramp[900..1900]) {
            assert!((out - expected).abs() < 1e-3, "{} != {}", out, expected);
        }
    }

    #[test]
    fn crossfader_rejects_bad_lengths() {
        let mut cf = Crossfader::new(100);
        assert!(cf.process(&[0.0; 50], |x| Ok(x.to_vec())).is_err());
        assert!(cf.process(&[0.0; 500], |x| Ok(x[1..].to_vec())).is_err());
    }

    #[test]
    fn v1_blocks_keep_length() {
        let svc = test_svc();
        let opts = InferOptions::default();
        let slice = SliceOptions::default();
        for split in [true, false] {
            let mut vc = RealtimeVc::new(
                &svc,
                2205,
                split,
                Speaker::Name("speaker0".into()),
                opts.clone(),
                slice.clone(),
            );
            let block = tone(22050);
            let out = vc.process(&block).unwrap();
            assert_eq!(out.len(), block.len());
            let out = vc.process(&vec![0.0; 22050]).unwrap();
            assert_eq!(out.len(), 22050);
        }
    }

    #[test]
    fn v1_gates_quiet_blocks() {
        let svc = test_svc();
        let mut vc = RealtimeVc::new(
            &svc,
            100,
            false,
            Speaker::Name("speaker0".into()),
            InferOptions::default(),
            SliceOptions::default(),
        );
        let quiet = vec![0.001; 1000];
        let out = vc.process(&quiet).unwrap();
        // Passed through untouched, just delayed by the crossfade
        assert!(out[200..].iter().all(|x| (*x - 0.001).abs() < 1e-6));
    }

    #[test]
    fn v2_always_returns_block_length() {
        let svc = test_svc();
        let mut vc = RealtimeVc2::new(
            &svc,
            Speaker::Name("speaker0".into()),
            InferOptions::default(),
            SliceOptions::default(),
        );
        let mut signal = vec![0.0; 44100];
        signal.extend(tone(44100));
        signal.extend(vec![0.0; 88200]);

        let mut heard_speech = false;
        for block in signal.chunks(11025) {
            let out = vc.process(block).unwrap();
            assert_eq!(out.len(), block.len());
            heard_speech |= out.iter().any(|x| *x == 0.5);
        }
        assert!(heard_speech);
    }

    #[test]
    fn v2_compresses_silence_after_speech() {
        let mut hps = HParams::template();
        hps.spk.insert("speaker0".to_string(), 0);
        let produced = Rc::new(Cell::new(0));
        let synth = CountingSynth {
            hop: hps.data.hop_length,
            produced: produced.clone(),
        };
        let svc = Svc::new(hps, Box::new(ZeroEncoder), Box::new(synth));
        let mut vc = RealtimeVc2::new(
            &svc,
            Speaker::Name("speaker0".into()),
            InferOptions::default(),
            SliceOptions::default(),
        );

        let block_len = 11025;
        let mut signal = vec![0.0; 44100];
        signal.extend(tone(44100));
        signal.extend(vec![0.0; 40 * block_len]);

        let mut speech_samples = 0;
        let mut drained_at = None;
        for (i, block) in signal.chunks(block_len).enumerate() {
            let out = vc.process(block).unwrap();
            assert_eq!(out.len(), block_len);
            speech_samples += out.iter().filter(|x| **x == 0.5).count();
            // Blocks 0..8 hold the leading silence and the tone
            if i >= 8 && produced.get() > 0 && vc.pending() == 0 && drained_at.is_none() {
                drained_at = Some(i);
            }
        }

        // One utterance, played back whole and exactly once
        assert!(produced.get() > 0);
        assert_eq!(speech_samples, produced.get());
        // Speech is ~5 blocks long, the silence after it gets squeezed to catch up
        let drained_at = drained_at.expect("chunk store never drained");
        assert!(drained_at <= 8 + 8, "drained at block {}", drained_at);
        assert_eq!(vc.pending(), 0);
    }

    #[test]
    fn v2_holds_back_unfinished_speech() {
        let svc = test_svc();
        let mut vc = RealtimeVc2::new(
            &svc,
            Speaker::Name("speaker0".into()),
            InferOptions::default(),
            SliceOptions::default(),
        );
        let out = vc.process(&tone(22050)).unwrap();
        assert_eq!(out.len(), 22050);
        assert!(out.iter().all(|x| *x == 0.0));
        assert_eq!(vc.pending(), 0);
    }

    #[test]
    fn block_buffer_regroups_callbacks() {
        let mut buffer = BlockBuffer::new(4);
        assert!(buffer.push(&[1.0, 2.0, 3.0]).is_empty());
        assert_eq!(buffer.buffered(), 3);
        let blocks = buffer.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(
            blocks,
            vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]
        );
        assert_eq!(buffer.buffered(), 1);
        assert_eq!(buffer.push(&[10.0, 11.0, 12.0]), vec![vec![9.0, 10.0, 11.0, 12.0]]);
        assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn device_lookup() {
        let names: Vec<String> = ["Built-in Microphone", "USB Audio", "usb audio monitor"]
            .iter()
            .map(|x| x.to_string())
            .collect();
        assert_eq!(find_device_index(&names, "1"), Some(1));
        assert_eq!(find_device_index(&names, "7"), None);
        assert_eq!(find_device_index(&names, "USB AUDIO"), Some(1));
        assert_eq!(find_device_index(&names, "monitor"), Some(2));
        assert_eq!(find_device_index(&names, "microphone"), Some(0));
        assert_eq!(find_device_index(&names, "headset"), None);
    }

    #[test]
    fn blocks_cover_the_input() {
        let mut cf = Crossfader::new(10);
        struct Passthrough<'a>(&'a mut Crossfader);
        impl<'a> RealtimeConverter for Passthrough<'a> {
            fn process(&mut self, input: &[f32]) -> anyhow::Result<Vec<f32>> {
                self.0.process(input, |x| Ok(x.to_vec()))
            }
        }
        let audio = vec![1.0; 1050];
        let out = process_blocks(&mut Passthrough(&mut cf), &audio, 100).unwrap();
        assert_eq!(out.len(), 1050);
        assert!(out[10..].iter().all(|x| (*x - 1.0).abs() < 1e-6));
        assert!(process_blocks(&mut Passthrough(&mut cf), &audio, 0).is_err());
    }
}
