use std::f64::consts::PI;

/// Zero crossings of the sinc kept either side of the interpolation point.
const ZERO_CROSSINGS: f64 = 16.0;
/// Cutoff as a fraction of the lower Nyquist frequency, keeps the transition band away from
/// aliasing.
const ROLLOFF: f64 = 0.945;

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Band-limited resampling via a Hann windowed sinc. Output length is
/// `ceil(len * to / from)`, the same as common resamplers, so feature frame counts line up with
/// audio prepared by other tools.
pub fn resample(audio: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || audio.is_empty() || from == 0 || to == 0 {
        return audio.to_vec();
    }
    let ratio = to as f64 / from as f64;
    let out_len = ((audio.len() as u64 * to as u64 + from as u64 - 1) / from as u64) as usize;

    // When downsampling the filter is stretched so the cutoff sits below the new Nyquist.
    let cutoff = ratio.min(1.0) * ROLLOFF;
    let half_width = ZERO_CROSSINGS / cutoff;
    let len = audio.len() as isize;

    (0..out_len)
        .map(|i| {
            let t = i as f64 / ratio;
            let first = ((t - half_width).ceil() as isize).max(0);
            let last = ((t + half_width).floor() as isize).min(len - 1);
            let mut acc = 0.0;
            for j in first..=last {
                let x = t - j as f64;
                let window = 0.5 * (1.0 + (PI * x / half_width).cos());
                acc += audio[j as usize] as f64 * cutoff * sinc(cutoff * x) * window;
            }
            acc as f32
        })
        .collect()
}
