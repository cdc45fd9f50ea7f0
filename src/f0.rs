//! Pitch (f0) handling. The synthesizer is conditioned on the fundamental frequency of the source
//! so the converted voice sings the same melody, this module extracts it, fills in the gaps where
//! nothing is voiced and shifts it when the user asks for a transpose.
//!
//! Extraction is a short-term autocorrelation tracker in the spirit of Boersma's method used by
//! Praat. The signal is brought down to 16kHz first, plenty for an 1100Hz ceiling and it cuts the
//! cost of the lag search by almost 3x for 44.1kHz input.
use crate::audio::{peak, resample};
use ndarray::{Array2, ArrayView2};

/// Lowest pitch that will be reported as voiced.
pub const F0_MIN: f32 = 50.0;
/// Highest pitch that will be reported as voiced.
pub const F0_MAX: f32 = 1100.0;
/// Rate the content encoder expects its audio at.
pub const HUBERT_SAMPLING_RATE: u32 = 16000;
/// Samples of 16kHz audio per content encoder frame.
pub const HUBERT_HOP: usize = 320;

/// Rate the pitch tracker runs at internally
const ANALYSIS_RATE: u32 = 16000;
/// Frames quieter than this fraction of the global peak are unvoiced.
const SILENCE_THRESHOLD: f32 = 0.03;
/// Minimum normalised autocorrelation for a frame to count as voiced.
const VOICING_THRESHOLD: f32 = 0.45;
/// Candidates within this fraction of the strongest peak are preferred if they're at a shorter
/// lag, avoids reporting subharmonics.
const OCTAVE_TOLERANCE: f32 = 0.9;

fn hann(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            0.5 - 0.5 * (2.0 * std::f32::consts::PI * (i as f32 + 0.5) / len as f32).cos()
        })
        .collect()
}

fn autocorrelation(x: &[f32], max_lag: usize) -> Vec<f32> {
    (0..=max_lag)
        .map(|lag| {
            x.iter()
                .zip(x.iter().skip(lag))
                .map(|(a, b)| a * b)
                .sum::<f32>()
        })
        .collect()
}

/// Computes f0 in Hz for every hop of the input, `len / hop_length` frames in total. Unvoiced
/// frames are 0.
pub fn compute_f0(audio: &[f32], sample_rate: u32, hop_length: usize) -> Vec<f32> {
    let n_frames = audio.len() / hop_length.max(1);
    let mut f0 = vec![0.0; n_frames];
    if n_frames == 0 {
        return f0;
    }

    let signal = resample(audio, sample_rate, ANALYSIS_RATE);
    let global_peak = peak(&signal);
    if global_peak == 0.0 {
        return f0;
    }

    let sr = ANALYSIS_RATE as f32;
    let min_lag = (sr / F0_MAX).floor().max(1.0) as usize;
    let max_lag = (sr / F0_MIN).ceil() as usize;
    // Three periods of the lowest pitch
    let window_len = 3 * max_lag;
    let window = hann(window_len);
    let window_ac = autocorrelation(&window, max_lag + 1);

    let mut frame = vec![0.0; window_len];
    for (i, out) in f0.iter_mut().enumerate() {
        let centre = (i * hop_length) as f64 * ANALYSIS_RATE as f64 / sample_rate as f64;
        let start = centre.round() as isize - window_len as isize / 2;

        for (j, x) in frame.iter_mut().enumerate() {
            let idx = start + j as isize;
            *x = if idx >= 0 && (idx as usize) < signal.len() {
                signal[idx as usize]
            } else {
                0.0
            };
        }
        if peak(&frame) < SILENCE_THRESHOLD * global_peak {
            continue;
        }
        let mean = frame.iter().sum::<f32>() / window_len as f32;
        for (x, w) in frame.iter_mut().zip(window.iter()) {
            *x = (*x - mean) * w;
        }

        let ac = autocorrelation(&frame, max_lag + 1);
        if ac[0] <= f32::EPSILON {
            continue;
        }
        let normalised: Vec<f32> = ac
            .iter()
            .zip(window_ac.iter())
            .map(|(r, w)| if *w > 0.0 { r / ac[0] / (w / window_ac[0]) } else { 0.0 })
            .collect();

        let peaks: Vec<usize> = (min_lag.max(1)..=max_lag)
            .filter(|&lag| {
                normalised[lag] > normalised[lag - 1] && normalised[lag] >= normalised[lag + 1]
            })
            .collect();
        let strongest = peaks
            .iter()
            .map(|lag| normalised[*lag])
            .fold(f32::MIN, f32::max);
        if strongest < VOICING_THRESHOLD {
            continue;
        }
        let lag = match peaks
            .iter()
            .find(|lag| normalised[**lag] >= OCTAVE_TOLERANCE * strongest)
        {
            Some(lag) => *lag,
            None => continue,
        };

        // Parabolic interpolation around the peak
        let (a, b, c) = (normalised[lag - 1], normalised[lag], normalised[lag + 1]);
        let denom = a - 2.0 * b + c;
        let offset = if denom.abs() > f32::EPSILON {
            (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };
        let pitch = sr / (lag as f32 + offset);
        if (F0_MIN..=F0_MAX).contains(&pitch) {
            *out = pitch;
        }
    }
    f0
}

/// Fills unvoiced frames so the synthesizer gets a continuous pitch contour, returning the filled
/// contour and the voiced mask (1.0 voiced, 0.0 unvoiced).
///
/// Gaps between voiced frames are linearly interpolated between the voiced frames either side,
/// leading gaps take the first voiced value and trailing gaps hold the last. If nothing is voiced
/// the contour stays at zero.
pub fn interpolate_f0(f0: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let uv = f0
        .iter()
        .map(|x| if *x > 0.0 { 1.0 } else { 0.0 })
        .collect();
    let mut ip = f0.to_vec();
    let n = ip.len();
    let mut last_value = 0.0;
    let mut i = 0;
    while i < n {
        if ip[i] > 0.0 {
            last_value = ip[i];
            i += 1;
            continue;
        }
        let next_voiced = (i + 1..n).find(|j| ip[*j] > 0.0);
        match next_voiced {
            Some(j) if last_value > 0.0 => {
                let step = (ip[j] - ip[i - 1]) / (j - i + 1) as f32;
                let base = ip[i - 1];
                for k in i..j {
                    ip[k] = base + step * (k - i + 1) as f32;
                }
                i = j;
            }
            Some(j) => {
                let value = ip[j];
                ip[i..j].iter_mut().for_each(|x| *x = value);
                i = j;
            }
            None => {
                ip[i..].iter_mut().for_each(|x| *x = last_value);
                i = n;
            }
        }
    }
    (ip, uv)
}

/// Shifts the contour by a number of semitones.
pub fn transpose(f0: &mut [f32], semitones: i32) {
    let factor = 2.0f32.powf(semitones as f32 / 12.0);
    f0.iter_mut().for_each(|x| *x *= factor);
}

/// Stretches `[dim, src_len]` features to `[dim, target_len]` by repeating frames. Content
/// features come out of the encoder at a different frame rate to the f0 so they need lining up.
pub fn repeat_expand(content: ArrayView2<f32>, target_len: usize) -> Array2<f32> {
    let (dim, src_len) = content.dim();
    let mut target = Array2::zeros((dim, target_len));
    if src_len == 0 {
        return target;
    }
    let boundary = |p: usize| p as f64 * target_len as f64 / src_len as f64;
    let mut pos = 0;
    for i in 0..target_len {
        while pos + 1 < src_len && i as f64 >= boundary(pos + 1) {
            pos += 1;
        }
        target.column_mut(i).assign(&content.column(pos));
    }
    target
}
