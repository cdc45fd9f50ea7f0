//! Audio plumbing shared by preprocessing, inference and the realtime converters.
//!
//! Everything here works on mono `f32` buffers in the range [-1, 1]. Multi-channel files are
//! averaged down when they're loaded, the models only ever see a single channel. Sample rates are
//! carried alongside the buffers rather than inside them, this keeps the slices usable directly
//! with `ndarray` when they're turned into tensors.

mod loader;
mod resample;
mod silence;

pub use loader::*;
pub use resample::*;
pub use silence::*;

/// Root mean square of the whole buffer, zero for an empty one.
pub fn rms(audio: &[f32]) -> f32 {
    if audio.is_empty() {
        return 0.0;
    }
    let sum: f64 = audio.iter().map(|x| (*x as f64) * (*x as f64)).sum();
    (sum / audio.len() as f64).sqrt() as f32
}

/// Largest absolute sample value.
pub fn peak(audio: &[f32]) -> f32 {
    audio.iter().fold(0.0f32, |acc, x| acc.max(x.abs()))
}

/// Centre crops or zero pads the audio to exactly `target_len` samples. When padding, the extra
/// sample of an odd pad goes on the right.
pub fn pad_array(audio: &[f32], target_len: usize) -> Vec<f32> {
    let current = audio.len();
    if current >= target_len {
        let start = (current - target_len) / 2;
        audio[start..start + target_len].to_vec()
    } else {
        let pad_width = target_len - current;
        let pad_left = pad_width / 2;
        let mut res = vec![0.0; target_len];
        res[pad_left..pad_left + current].copy_from_slice(audio);
        res
    }
}

/// Averages interleaved frames down to a single channel.
pub fn to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear ramp of `len` points from `start` to `end` inclusive, like `numpy.linspace`.
pub fn linspace(start: f32, end: f32, len: usize) -> Vec<f32> {
    match len {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (len - 1) as f32;
            (0..len).map(|i| start + step * i as f32).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_array_crop_and_pad() {
        assert_eq!(pad_array(&[1.0, 2.0, 3.0, 4.0, 5.0], 3), vec![2.0, 3.0, 4.0]);
        assert_eq!(pad_array(&[1.0, 2.0], 5), vec![0.0, 1.0, 2.0, 0.0, 0.0]);
        assert_eq!(pad_array(&[1.0, 2.0], 2), vec![1.0, 2.0]);
        assert!(pad_array(&[], 0).is_empty());
    }

    #[test]
    fn mono_downmix() {
        assert_eq!(to_mono(&[1.0, 3.0, -1.0, 1.0], 2), vec![2.0, 0.0]);
        assert_eq!(to_mono(&[0.5, 0.25], 1), vec![0.5, 0.25]);
        // Partial trailing frame is dropped
        assert_eq!(to_mono(&[1.0, 1.0, 1.0], 2), vec![1.0]);
    }

    #[test]
    fn linspace_endpoints() {
        let l = linspace(1.0, 0.0, 5);
        assert_eq!(l, vec![1.0, 0.75, 0.5, 0.25, 0.0]);
        assert_eq!(linspace(0.0, 1.0, 1), vec![0.0]);
    }

    #[test]
    fn rms_of_square_wave() {
        let audio = [0.5, -0.5, 0.5, -0.5];
        assert!((rms(&audio) - 0.5).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(peak(&[0.1, -0.7, 0.3]), 0.7);
    }
}
