//! Opus codec wrapper
//!
//! Bridges the codec contract onto the `opus` crate. The settings blob
//! carries three big-endian i32s `{bitrate, complexity, signal}` so a
//! decoder learns the encoder's configuration from the `/format`
//! announcement; everything else defers to the codec library.

use opus::{Application, Channels};
use std::sync::Arc;

use crate::audio::Sample;
use crate::codec::{Codec, Decoder, Encoder, Format, FormatHeader};
use crate::error::CodecError;

pub const CODEC_NAME: &str = "opus";

const SUPPORTED_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Wire representation of the Opus settings blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpusSettings {
    /// Target bitrate in bits per second.
    pub bitrate: i32,
    /// Encoder complexity, 0..=10.
    pub complexity: i32,
    /// Signal hint: 0 auto, 1 voice, 2 music.
    pub signal: i32,
}

impl Default for OpusSettings {
    fn default() -> Self {
        Self {
            bitrate: 128_000,
            complexity: 9,
            signal: 0,
        }
    }
}

impl OpusSettings {
    fn to_blob(self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(12);
        blob.extend_from_slice(&self.bitrate.to_be_bytes());
        blob.extend_from_slice(&self.complexity.to_be_bytes());
        blob.extend_from_slice(&self.signal.to_be_bytes());
        blob
    }

    fn from_blob(blob: &[u8]) -> Result<Self, CodecError> {
        if blob.len() < 12 {
            return Err(CodecError::InvalidSettings(blob.len()));
        }
        let int = |i: usize| i32::from_be_bytes([blob[i], blob[i + 1], blob[i + 2], blob[i + 3]]);
        Ok(Self {
            bitrate: int(0),
            complexity: int(4),
            signal: int(8),
        })
    }
}

/// Build an Opus [`Format`] with the settings blob filled in.
pub fn format(channels: u32, sample_rate: u32, block_size: u32, settings: OpusSettings) -> Format {
    Format {
        codec: CODEC_NAME.to_string(),
        channels,
        sample_rate,
        block_size,
        settings: settings.to_blob(),
    }
}

fn clamp_header(mut header: FormatHeader) -> FormatHeader {
    if !SUPPORTED_RATES.contains(&header.sample_rate) {
        tracing::warn!(
            "Opus: unsupported sample rate {}, using 48000",
            header.sample_rate
        );
        header.sample_rate = 48000;
    }
    if header.channels == 0 || header.channels > 2 {
        tracing::warn!("Opus: unsupported channel count {}, using 1", header.channels);
        header.channels = 1;
    }
    // Opus frames are 2.5/5/10/20/40/60 ms; snap to the nearest one.
    let frame_sizes = [
        header.sample_rate / 400,
        header.sample_rate / 200,
        header.sample_rate / 100,
        header.sample_rate / 50,
        header.sample_rate / 25,
        header.sample_rate * 3 / 50,
    ];
    if !frame_sizes.contains(&header.block_size) {
        let snapped = *frame_sizes
            .iter()
            .min_by_key(|&&size| size.abs_diff(header.block_size))
            .unwrap();
        tracing::warn!(
            "Opus: invalid block size {}, using {}",
            header.block_size,
            snapped
        );
        header.block_size = snapped;
    }
    header
}

fn opus_channels(channels: u32) -> Channels {
    if channels == 2 {
        Channels::Stereo
    } else {
        Channels::Mono
    }
}

/// Opus encoder
pub struct OpusEncoder {
    encoder: Option<opus::Encoder>,
    header: FormatHeader,
    settings: OpusSettings,
}

impl Default for OpusEncoder {
    fn default() -> Self {
        Self {
            encoder: None,
            header: FormatHeader {
                channels: 1,
                sample_rate: 48000,
                block_size: 480,
            },
            settings: OpusSettings::default(),
        }
    }
}

impl Encoder for OpusEncoder {
    fn setup(&mut self, format: Format) -> Result<Format, CodecError> {
        let header = clamp_header(FormatHeader {
            channels: format.channels,
            sample_rate: format.sample_rate,
            block_size: format.block_size,
        });
        let settings = if format.settings.is_empty() {
            OpusSettings::default()
        } else {
            OpusSettings::from_blob(&format.settings)?
        };

        let mut encoder = opus::Encoder::new(
            header.sample_rate,
            opus_channels(header.channels),
            Application::Audio,
        )
        .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(settings.bitrate))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        self.encoder = Some(encoder);
        self.header = header;
        self.settings = settings;

        tracing::debug!(
            "Opus settings: channels = {}, block size = {}, sample rate = {}, bitrate = {}",
            header.channels,
            header.block_size,
            header.sample_rate,
            settings.bitrate
        );
        Ok(self::format(
            header.channels,
            header.sample_rate,
            header.block_size,
            settings,
        ))
    }

    fn name(&self) -> &'static str {
        CODEC_NAME
    }

    fn channels(&self) -> u32 {
        self.header.channels
    }

    fn sample_rate(&self) -> u32 {
        self.header.sample_rate
    }

    fn block_size(&self) -> u32 {
        self.header.block_size
    }

    fn encode(&mut self, samples: &[Sample], out: &mut [u8]) -> Result<usize, CodecError> {
        let expected = self.header.block_size as usize * self.header.channels as usize;
        if samples.len() != expected {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| CodecError::EncoderInit("encoder not set up".to_string()))?;
        encoder
            .encode_float(samples, out)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))
    }

    fn write_format(&self) -> Result<(FormatHeader, Vec<u8>), CodecError> {
        Ok((self.header, self.settings.to_blob()))
    }
}

/// Opus decoder
pub struct OpusDecoder {
    decoder: Option<opus::Decoder>,
    header: FormatHeader,
}

impl Default for OpusDecoder {
    fn default() -> Self {
        Self {
            decoder: None,
            header: FormatHeader {
                channels: 1,
                sample_rate: 48000,
                block_size: 480,
            },
        }
    }
}

impl Decoder for OpusDecoder {
    fn read_format(&mut self, header: FormatHeader, settings: &[u8]) -> Result<(), CodecError> {
        // the blob is validated even though the decoder itself only needs
        // the header; a short blob means a garbled announcement
        let _ = OpusSettings::from_blob(settings)?;
        let header = clamp_header(header);
        let decoder = opus::Decoder::new(header.sample_rate, opus_channels(header.channels))
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;
        self.decoder = Some(decoder);
        self.header = header;
        Ok(())
    }

    fn name(&self) -> &'static str {
        CODEC_NAME
    }

    fn channels(&self) -> u32 {
        self.header.channels
    }

    fn sample_rate(&self) -> u32 {
        self.header.sample_rate
    }

    fn block_size(&self) -> u32 {
        self.header.block_size
    }

    fn decode(&mut self, data: &[u8], samples: &mut [Sample]) -> Result<usize, CodecError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| CodecError::DecoderInit("decoder not set up".to_string()))?;
        let frames = decoder
            .decode_float(data, samples, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        Ok(frames * self.header.channels as usize)
    }
}

/// The Opus codec factory.
pub struct OpusCodec;

impl Codec for OpusCodec {
    fn name(&self) -> &'static str {
        CODEC_NAME
    }

    fn new_encoder(&self) -> Box<dyn Encoder> {
        Box::new(OpusEncoder::default())
    }

    fn new_decoder(&self) -> Box<dyn Decoder> {
        Box::new(OpusDecoder::default())
    }
}

/// Register the Opus codec.
pub fn setup() {
    crate::codec::register_codec(Arc::new(OpusCodec));
}
