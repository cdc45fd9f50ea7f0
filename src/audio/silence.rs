//! Silence detection. The model behaves badly when asked to convert long stretches of nothing, and
//! it's wasted compute anyway, so the input is split into speech and silence regions and only the
//! speech is sent through the networks.
//!
//! The detection is a frame based energy threshold. Each frame's mean square is converted to
//! decibels relative to a reference and compared against `-top_db`. Frames are centred, so the
//! signal is zero padded by half a frame on either side, which gives `1 + len / hop` frames for an
//! even frame length.

/// Power floor to avoid `log10(0)`.
const AMIN: f64 = 1e-10;

/// What the frame energies are measured against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reference {
    /// A fixed mean square, `1.0` meaning full scale. Used for streaming where there's no global
    /// view of the signal.
    Absolute(f32),
    /// The loudest frame in the buffer.
    Max,
}

/// A contiguous region of a buffer that's either speech or silence.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub is_speech: bool,
    pub audio: Vec<f32>,
    /// Start sample in the buffer it was cut from
    pub start: usize,
    /// End sample (exclusive) in the buffer it was cut from
    pub end: usize,
}

impl Chunk {
    /// Number of samples currently held. This can differ from `end - start` once the audio has
    /// been replaced with converted audio or partially consumed.
    pub fn duration(&self) -> usize {
        self.audio.len()
    }
}

/// Centred frame-wise mean square of the signal.
pub fn mean_square_frames(audio: &[f32], frame_length: usize, hop_length: usize) -> Vec<f64> {
    assert!(frame_length > 0 && hop_length > 0);
    let pad = frame_length / 2;
    let padded_len = audio.len() + 2 * pad;
    if padded_len < frame_length {
        return vec![];
    }
    let n_frames = 1 + (padded_len - frame_length) / hop_length;

    // Sample lookup into the virtual zero padded signal
    let sample = |i: usize| -> f64 {
        if i < pad || i - pad >= audio.len() {
            0.0
        } else {
            audio[i - pad] as f64
        }
    };

    (0..n_frames)
        .map(|frame| {
            let start = frame * hop_length;
            let sum: f64 = (start..start + frame_length)
                .map(|i| {
                    let s = sample(i);
                    s * s
                })
                .sum();
            sum / frame_length as f64
        })
        .collect()
}

/// Centred frame-wise RMS of the signal.
pub fn rms_frames(audio: &[f32], frame_length: usize, hop_length: usize) -> Vec<f32> {
    mean_square_frames(audio, frame_length, hop_length)
        .into_iter()
        .map(|x| x.sqrt() as f32)
        .collect()
}

fn non_silent_frames(
    audio: &[f32],
    top_db: f32,
    reference: Reference,
    frame_length: usize,
    hop_length: usize,
) -> Vec<bool> {
    let ms = mean_square_frames(audio, frame_length, hop_length);
    let reference = match reference {
        Reference::Absolute(r) => r as f64,
        Reference::Max => ms.iter().cloned().fold(0.0, f64::max),
    };
    let ref_db = 10.0 * reference.max(AMIN).log10();
    ms.iter()
        .map(|x| 10.0 * x.max(AMIN).log10() - ref_db > -(top_db as f64))
        .collect()
}

/// Returns the `[start, end)` sample intervals that are louder than `top_db` below the reference.
/// Intervals are ordered and never overlap.
pub fn split(
    audio: &[f32],
    top_db: f32,
    reference: Reference,
    frame_length: usize,
    hop_length: usize,
) -> Vec<(usize, usize)> {
    let flags = non_silent_frames(audio, top_db, reference, frame_length, hop_length);
    let mut intervals = vec![];
    let mut start = None;
    for (i, active) in flags.iter().enumerate() {
        match (start, *active) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                intervals.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        intervals.push((s, flags.len()));
    }

    intervals
        .into_iter()
        .map(|(s, e)| {
            (
                (s * hop_length).min(audio.len()),
                (e * hop_length).min(audio.len()),
            )
        })
        .filter(|(s, e)| s < e)
        .collect()
}

/// Splits the whole buffer into alternating silence and speech chunks. The chunks tile the input
/// exactly: concatenating their audio gives back the original buffer.
pub fn split_silence(
    audio: &[f32],
    top_db: f32,
    reference: Reference,
    frame_length: usize,
    hop_length: usize,
) -> Vec<Chunk> {
    let mut chunks = vec![];
    let mut last_end = 0;
    for (start, end) in split(audio, top_db, reference, frame_length, hop_length) {
        if start != last_end {
            chunks.push(Chunk {
                is_speech: false,
                audio: audio[last_end..start].to_vec(),
                start: last_end,
                end: start,
            });
        }
        chunks.push(Chunk {
            is_speech: true,
            audio: audio[start..end].to_vec(),
            start,
            end,
        });
        last_end = end;
    }
    if last_end != audio.len() {
        chunks.push(Chunk {
            is_speech: false,
            audio: audio[last_end..].to_vec(),
            start: last_end,
            end: audio.len(),
        });
    }
    chunks
}

/// Removes leading and trailing silence, measured against the loudest frame.
pub fn trim(audio: &[f32], top_db: f32) -> &[f32] {
    let frame_length = 2048;
    let hop_length = 512;
    let flags = non_silent_frames(audio, top_db, Reference::Max, frame_length, hop_length);
    let first = flags.iter().position(|x| *x);
    let last = flags.iter().rposition(|x| *x);
    match (first, last) {
        (Some(first), Some(last)) => {
            let start = (first * hop_length).min(audio.len());
            let end = ((last + 1) * hop_length).min(audio.len());
            &audio[start..end]
        }
        _ => &audio[0..0],
    }
}
