//! Uncompressed PCM codec
//!
//! Samples travel as big-endian integers or IEEE-754 floats. The settings
//! blob is a single big-endian i32 naming the bit depth, so a decoder can
//! reconfigure itself from the `/format` announcement alone. Integer
//! conversion is fixed-point with saturating clamp.

use std::sync::Arc;

use crate::audio::Sample;
use crate::codec::{Codec, Decoder, Encoder, Format, FormatHeader};
use crate::error::CodecError;

pub const CODEC_NAME: &str = "pcm";

/// Sample storage width on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Int16,
    Int24,
    Float32,
    Float64,
}

impl BitDepth {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            BitDepth::Int16 => 2,
            BitDepth::Int24 => 3,
            BitDepth::Float32 => 4,
            BitDepth::Float64 => 8,
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            BitDepth::Int16 => 0,
            BitDepth::Int24 => 1,
            BitDepth::Float32 => 2,
            BitDepth::Float64 => 3,
        }
    }

    fn from_wire(code: i32) -> Option<Self> {
        match code {
            0 => Some(BitDepth::Int16),
            1 => Some(BitDepth::Int24),
            2 => Some(BitDepth::Float32),
            3 => Some(BitDepth::Float64),
            _ => None,
        }
    }
}

/// Build a PCM [`Format`] with the settings blob filled in.
pub fn format(channels: u32, sample_rate: u32, block_size: u32, depth: BitDepth) -> Format {
    Format {
        codec: CODEC_NAME.to_string(),
        channels,
        sample_rate,
        block_size,
        settings: depth.to_wire().to_be_bytes().to_vec(),
    }
}

#[derive(Debug, Clone, Copy)]
struct PcmState {
    channels: u32,
    sample_rate: u32,
    block_size: u32,
    depth: BitDepth,
}

impl Default for PcmState {
    fn default() -> Self {
        Self {
            channels: 1,
            sample_rate: 44100,
            block_size: 64,
            depth: BitDepth::Float32,
        }
    }
}

impl PcmState {
    fn block_samples(&self) -> usize {
        self.block_size as usize * self.channels as usize
    }
}

fn clamp_header(mut header: FormatHeader) -> FormatHeader {
    if header.block_size == 0 {
        tracing::warn!("PCM: bad block size 0, using 64 samples");
        header.block_size = 64;
    }
    if header.sample_rate == 0 {
        tracing::warn!("PCM: bad sample rate 0, using 44100");
        header.sample_rate = 44100;
    }
    if header.channels == 0 || header.channels > 255 {
        tracing::warn!("PCM: bad channel count {}, using 1 channel", header.channels);
        header.channels = 1;
    }
    header
}

fn read_depth(settings: &[u8]) -> Result<BitDepth, CodecError> {
    if settings.len() < 4 {
        return Err(CodecError::InvalidSettings(settings.len()));
    }
    let code = i32::from_be_bytes([settings[0], settings[1], settings[2], settings[3]]);
    Ok(BitDepth::from_wire(code).unwrap_or_else(|| {
        tracing::warn!("PCM: bad bit depth {}, using 32-bit float", code);
        BitDepth::Float32
    }))
}

fn sample_to_i16(x: Sample, out: &mut [u8]) {
    let scaled = (x as f64 * 0x7fff as f64 + 0.5).floor();
    let clamped = scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    out[..2].copy_from_slice(&clamped.to_be_bytes());
}

fn i16_to_sample(bytes: &[u8]) -> Sample {
    i16::from_be_bytes([bytes[0], bytes[1]]) as Sample / 32768.0
}

fn sample_to_i24(x: Sample, out: &mut [u8]) {
    let scaled = (x as f64 * 0x7fff_ffff as f64 + 0.5).floor();
    let clamped = scaled.clamp(i32::MIN as f64, i32::MAX as f64) as i32;
    // keep only the highest three bytes
    out[..3].copy_from_slice(&clamped.to_be_bytes()[..3]);
}

fn i24_to_sample(bytes: &[u8]) -> Sample {
    let value = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0]);
    (value as f64 / 0x7fff_ffff as f64) as Sample
}

fn sample_to_f32(x: Sample, out: &mut [u8]) {
    out[..4].copy_from_slice(&x.to_be_bytes());
}

fn f32_to_sample(bytes: &[u8]) -> Sample {
    Sample::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn sample_to_f64(x: Sample, out: &mut [u8]) {
    out[..8].copy_from_slice(&(x as f64).to_be_bytes());
}

fn f64_to_sample(bytes: &[u8]) -> Sample {
    f64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]) as Sample
}

/// PCM encoder
#[derive(Debug, Default)]
pub struct PcmEncoder {
    state: PcmState,
}

impl Encoder for PcmEncoder {
    fn setup(&mut self, format: Format) -> Result<Format, CodecError> {
        let header = clamp_header(FormatHeader {
            channels: format.channels,
            sample_rate: format.sample_rate,
            block_size: format.block_size,
        });
        let depth = if format.settings.is_empty() {
            BitDepth::Float32
        } else {
            read_depth(&format.settings)?
        };
        self.state = PcmState {
            channels: header.channels,
            sample_rate: header.sample_rate,
            block_size: header.block_size,
            depth,
        };
        tracing::debug!(
            "PCM settings: channels = {}, block size = {}, sample rate = {}, {} bytes per sample",
            header.channels,
            header.block_size,
            header.sample_rate,
            depth.bytes_per_sample()
        );
        Ok(self::format(
            header.channels,
            header.sample_rate,
            header.block_size,
            depth,
        ))
    }

    fn name(&self) -> &'static str {
        CODEC_NAME
    }

    fn channels(&self) -> u32 {
        self.state.channels
    }

    fn sample_rate(&self) -> u32 {
        self.state.sample_rate
    }

    fn block_size(&self) -> u32 {
        self.state.block_size
    }

    fn encode(&mut self, samples: &[Sample], out: &mut [u8]) -> Result<usize, CodecError> {
        if samples.len() != self.state.block_samples() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }
        let sample_size = self.state.depth.bytes_per_sample();
        let need = samples.len() * sample_size;
        if out.len() < need {
            return Err(CodecError::BufferTooSmall {
                need,
                have: out.len(),
            });
        }
        let convert: fn(Sample, &mut [u8]) = match self.state.depth {
            BitDepth::Int16 => sample_to_i16,
            BitDepth::Int24 => sample_to_i24,
            BitDepth::Float32 => sample_to_f32,
            BitDepth::Float64 => sample_to_f64,
        };
        for (sample, chunk) in samples.iter().zip(out.chunks_exact_mut(sample_size)) {
            convert(*sample, chunk);
        }
        Ok(need)
    }

    fn write_format(&self) -> Result<(FormatHeader, Vec<u8>), CodecError> {
        Ok((
            FormatHeader {
                channels: self.state.channels,
                sample_rate: self.state.sample_rate,
                block_size: self.state.block_size,
            },
            self.state.depth.to_wire().to_be_bytes().to_vec(),
        ))
    }
}

/// PCM decoder
#[derive(Debug, Default)]
pub struct PcmDecoder {
    state: PcmState,
}

impl Decoder for PcmDecoder {
    fn read_format(&mut self, header: FormatHeader, settings: &[u8]) -> Result<(), CodecError> {
        let header = clamp_header(header);
        let depth = read_depth(settings)?;
        self.state = PcmState {
            channels: header.channels,
            sample_rate: header.sample_rate,
            block_size: header.block_size,
            depth,
        };
        Ok(())
    }

    fn name(&self) -> &'static str {
        CODEC_NAME
    }

    fn channels(&self) -> u32 {
        self.state.channels
    }

    fn sample_rate(&self) -> u32 {
        self.state.sample_rate
    }

    fn block_size(&self) -> u32 {
        self.state.block_size
    }

    fn decode(&mut self, data: &[u8], samples: &mut [Sample]) -> Result<usize, CodecError> {
        let sample_size = self.state.depth.bytes_per_sample();
        let count = data.len() / sample_size;
        if samples.len() < count {
            return Err(CodecError::BufferTooSmall {
                need: count,
                have: samples.len(),
            });
        }
        let convert: fn(&[u8]) -> Sample = match self.state.depth {
            BitDepth::Int16 => i16_to_sample,
            BitDepth::Int24 => i24_to_sample,
            BitDepth::Float32 => f32_to_sample,
            BitDepth::Float64 => f64_to_sample,
        };
        for (chunk, sample) in data.chunks_exact(sample_size).zip(samples.iter_mut()) {
            *sample = convert(chunk);
        }
        Ok(count)
    }
}

/// The PCM codec factory.
pub struct PcmCodec;

impl Codec for PcmCodec {
    fn name(&self) -> &'static str {
        CODEC_NAME
    }

    fn new_encoder(&self) -> Box<dyn Encoder> {
        Box::new(PcmEncoder::default())
    }

    fn new_decoder(&self) -> Box<dyn Decoder> {
        Box::new(PcmDecoder::default())
    }
}

/// Register the PCM codec.
pub fn setup() {
    crate::codec::register_codec(Arc::new(PcmCodec));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(depth: BitDepth) -> (PcmEncoder, PcmDecoder) {
        let mut encoder = PcmEncoder::default();
        let format = encoder.setup(format_for(depth)).unwrap();
        let mut decoder = PcmDecoder::default();
        decoder
            .read_format(
                FormatHeader {
                    channels: format.channels,
                    sample_rate: format.sample_rate,
                    block_size: format.block_size,
                },
                &format.settings,
            )
            .unwrap();
        (encoder, decoder)
    }

    fn format_for(depth: BitDepth) -> Format {
        format(2, 48000, 4, depth)
    }

    fn test_signal() -> Vec<f32> {
        vec![0.0, 0.25, -0.5, 0.99, -0.99, 0.125, -0.0625, 1.0]
    }

    #[test]
    fn test_float32_roundtrip_is_bit_exact() {
        let (mut enc, mut dec) = pair(BitDepth::Float32);
        let input = test_signal();
        let mut bytes = vec![0u8; input.len() * 4];
        let written = enc.encode(&input, &mut bytes).unwrap();
        assert_eq!(written, input.len() * 4);

        let mut output = vec![0.0f32; input.len()];
        let read = dec.decode(&bytes[..written], &mut output).unwrap();
        assert_eq!(read, input.len());
        assert_eq!(input, output);
    }

    #[test]
    fn test_float64_roundtrip_is_bit_exact() {
        let (mut enc, mut dec) = pair(BitDepth::Float64);
        let input = test_signal();
        let mut bytes = vec![0u8; input.len() * 8];
        let written = enc.encode(&input, &mut bytes).unwrap();

        let mut output = vec![0.0f32; input.len()];
        dec.decode(&bytes[..written], &mut output).unwrap();
        assert_eq!(input, output);
    }

    #[test]
    fn test_int16_roundtrip_within_one_lsb() {
        let (mut enc, mut dec) = pair(BitDepth::Int16);
        let input = test_signal();
        let mut bytes = vec![0u8; input.len() * 2];
        let written = enc.encode(&input, &mut bytes).unwrap();
        assert_eq!(written, input.len() * 2);

        let mut output = vec![0.0f32; input.len()];
        dec.decode(&bytes[..written], &mut output).unwrap();
        // encode scales by 0x7fff while decode divides by 32768, so the
        // worst case is slightly above one least significant bit
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() <= 1.6 / 32768.0, "{a} vs {b}");
        }
    }

    #[test]
    fn test_int24_roundtrip_within_one_lsb() {
        let (mut enc, mut dec) = pair(BitDepth::Int24);
        let input = test_signal();
        let mut bytes = vec![0u8; input.len() * 3];
        enc.encode(&input, &mut bytes).unwrap();

        let mut output = vec![0.0f32; input.len()];
        dec.decode(&bytes, &mut output).unwrap();
        // byte truncation plus f32 rounding stays within two lsb
        let lsb = 1.0 / 8_388_608.0;
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() <= 2.0 * lsb, "{a} vs {b}");
        }
    }

    #[test]
    fn test_integer_encode_saturates() {
        let (mut enc, mut dec) = pair(BitDepth::Int16);
        let input = vec![2.0, -2.0, 1.0, -1.0, 0.0, 0.0, 0.0, 0.0];
        let mut bytes = vec![0u8; input.len() * 2];
        enc.encode(&input, &mut bytes).unwrap();

        let mut output = vec![0.0f32; input.len()];
        dec.decode(&bytes, &mut output).unwrap();
        assert!((output[0] - output[2]).abs() < 1e-6); // 2.0 clamps to full scale
        assert!((output[1] - output[3]).abs() < 1e-6);
    }

    #[test]
    fn test_settings_blob_is_big_endian() {
        let f = format(1, 44100, 64, BitDepth::Float32);
        assert_eq!(f.settings, vec![0, 0, 0, 2]);
    }

    #[test]
    fn test_setup_clamps_bad_fields() {
        let mut enc = PcmEncoder::default();
        let clamped = enc
            .setup(format(0, 0, 0, BitDepth::Float32))
            .unwrap();
        assert_eq!(clamped.channels, 1);
        assert_eq!(clamped.sample_rate, 44100);
        assert_eq!(clamped.block_size, 64);
    }

    #[test]
    fn test_short_settings_blob_rejected() {
        let mut dec = PcmDecoder::default();
        let result = dec.read_format(
            FormatHeader {
                channels: 1,
                sample_rate: 44100,
                block_size: 64,
            },
            &[0, 1],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_rejects_wrong_block_length() {
        let (mut enc, _) = pair(BitDepth::Float32);
        let mut bytes = vec![0u8; 64];
        assert!(enc.encode(&[0.0; 3], &mut bytes).is_err());
    }
}
