//! Audio plumbing shared by sources and sinks

pub mod buffer;
pub mod resampler;

pub use buffer::{AudioRing, BlockInfo, InfoRing, RateRing};
pub use resampler::Resampler;

/// The sample type used throughout the engine.
pub type Sample = f32;

/// Interleave non-interleaved channel slices into `out`.
///
/// `out` must hold `frames * channels.len()` samples; channel slices
/// shorter than `frames` are padded with silence.
pub fn interleave(channels: &[&[Sample]], frames: usize, out: &mut [Sample]) {
    let nch = channels.len();
    debug_assert!(out.len() >= frames * nch);
    for (i, ch) in channels.iter().enumerate() {
        for j in 0..frames {
            out[j * nch + i] = ch.get(j).copied().unwrap_or(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave() {
        let left = [1.0, 2.0, 3.0];
        let right = [4.0, 5.0, 6.0];
        let mut out = [0.0; 6];
        interleave(&[&left, &right], 3, &mut out);
        assert_eq!(out, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_interleave_pads_short_channels() {
        let left = [1.0];
        let right: [f32; 0] = [];
        let mut out = [9.0; 4];
        interleave(&[&left, &right], 2, &mut out);
        assert_eq!(out, [1.0, 0.0, 0.0, 0.0]);
    }
}
