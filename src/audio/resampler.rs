//! Rational-rate resampler between the stream clock and the local clock
//!
//! A circular buffer with a fractional read head. The conversion ratio is
//! refreshed every audio tick from the DLL estimates, so playback tracks
//! clock drift between peers instead of slowly over- or under-running.

use crate::audio::Sample;

/// Linear-interpolation resampler over interleaved samples.
#[derive(Debug)]
pub struct Resampler {
    buffer: Vec<Sample>,
    channels: usize,
    capacity_frames: usize,
    write_frame: usize,
    read_pos: f64,
    /// Input frames currently buffered (fractional once reads started).
    balance: f64,
    /// Output rate over input rate.
    ratio: f64,
}

impl Resampler {
    /// Set up a converter between `(in_block, in_rate)` and
    /// `(out_block, out_rate)` for `channels` interleaved channels.
    pub fn new(
        in_block: usize,
        out_block: usize,
        in_rate: f64,
        out_rate: f64,
        channels: usize,
    ) -> Self {
        let capacity_frames = 4 * in_block.max(out_block).max(1);
        let mut resampler = Self {
            buffer: vec![0.0; capacity_frames * channels.max(1)],
            channels: channels.max(1),
            capacity_frames,
            write_frame: 0,
            read_pos: 0.0,
            balance: 0.0,
            ratio: 1.0,
        };
        resampler.update(in_rate, out_rate);
        resampler
    }

    /// Refresh the conversion ratio with the current rate estimates.
    pub fn update(&mut self, in_rate: f64, out_rate: f64) {
        self.ratio = if in_rate > 0.0 && out_rate > 0.0 && in_rate != out_rate {
            out_rate / in_rate
        } else {
            1.0
        };
    }

    /// Drop all buffered samples.
    pub fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_frame = 0;
        self.read_pos = 0.0;
        self.balance = 0.0;
    }

    /// Sample frames that can be written without overrunning the read head.
    pub fn write_available(&self) -> usize {
        self.capacity_frames.saturating_sub(self.balance.ceil() as usize)
    }

    /// Sample frames that can currently be read at the active ratio.
    pub fn read_available(&self) -> usize {
        if self.is_copying() {
            self.balance.floor() as usize
        } else {
            // interpolation touches the frame after the read head
            (((self.balance - 1.0).max(0.0)) * self.ratio).floor() as usize
        }
    }

    /// Append interleaved input samples; `samples.len()` must be a multiple
    /// of the channel count and fit in [`write_available`].
    pub fn write(&mut self, samples: &[Sample]) {
        let frames = samples.len() / self.channels;
        debug_assert!(frames <= self.write_available());
        let cap = self.capacity_frames;
        for frame in 0..frames {
            let slot = ((self.write_frame + frame) % cap) * self.channels;
            let src = frame * self.channels;
            self.buffer[slot..slot + self.channels]
                .copy_from_slice(&samples[src..src + self.channels]);
        }
        self.write_frame = (self.write_frame + frames) % cap;
        self.balance += frames as f64;
    }

    /// Fill `out` with interleaved output samples; `out.len()` must be a
    /// multiple of the channel count and fit in [`read_available`].
    pub fn read(&mut self, out: &mut [Sample]) {
        let frames = out.len() / self.channels;
        debug_assert!(frames <= self.read_available());
        let cap = self.capacity_frames;

        if self.is_copying() {
            let mut pos = self.read_pos as usize;
            for frame in 0..frames {
                let slot = (pos % cap) * self.channels;
                let dst = frame * self.channels;
                out[dst..dst + self.channels]
                    .copy_from_slice(&self.buffer[slot..slot + self.channels]);
                pos += 1;
            }
            self.read_pos = (pos % cap) as f64;
            self.balance -= frames as f64;
        } else {
            let advance = 1.0 / self.ratio;
            for frame in 0..frames {
                let base = self.read_pos.floor();
                let fract = self.read_pos - base;
                let i0 = (base as usize % cap) * self.channels;
                let i1 = ((base as usize + 1) % cap) * self.channels;
                let dst = frame * self.channels;
                for ch in 0..self.channels {
                    let a = self.buffer[i0 + ch];
                    let b = self.buffer[i1 + ch];
                    out[dst + ch] = a + (b - a) * fract as Sample;
                }
                self.read_pos += advance;
                if self.read_pos >= cap as f64 {
                    self.read_pos -= cap as f64;
                }
            }
            self.balance -= frames as f64 * advance;
        }
    }

    fn is_copying(&self) -> bool {
        self.ratio == 1.0 && self.read_pos.fract() == 0.0
    }
}
