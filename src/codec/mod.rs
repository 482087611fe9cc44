//! Codec contract and registry
//!
//! Codecs are looked up by name in a process-wide registry filled by
//! [`crate::initialize`] before any source or sink exists; afterwards the
//! registry is only read. Each codec is a factory for encoder and decoder
//! instances sharing a common lifecycle: `setup` with a [`Format`], then
//! per-block `encode`/`decode`, plus (de)serialization of the codec's
//! settings blob for the `/format` announcement.

pub mod pcm;

#[cfg(feature = "opus")]
pub mod opus;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::audio::Sample;
use crate::error::CodecError;

/// A stream format as announced on the wire.
///
/// The settings blob is opaque to the engine; only the codec named by
/// `codec` can interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub codec: String,
    pub channels: u32,
    pub sample_rate: u32,
    pub block_size: u32,
    pub settings: Vec<u8>,
}

/// The numeric part of a format, as carried in `/format` arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatHeader {
    pub channels: u32,
    pub sample_rate: u32,
    pub block_size: u32,
}

/// Encoder instance lifecycle.
pub trait Encoder: Send {
    /// Validate and store the format, clamping out-of-range fields with
    /// warnings. Returns the format actually in effect.
    fn setup(&mut self, format: Format) -> Result<Format, CodecError>;

    fn name(&self) -> &'static str;
    fn channels(&self) -> u32;
    fn sample_rate(&self) -> u32;
    fn block_size(&self) -> u32;

    /// Encode one block of `block_size * channels` interleaved samples.
    /// Returns the number of bytes written to `out`.
    fn encode(&mut self, samples: &[Sample], out: &mut [u8]) -> Result<usize, CodecError>;

    /// Serialize the settings blob that will reach the decoder.
    fn write_format(&self) -> Result<(FormatHeader, Vec<u8>), CodecError>;
}

/// Decoder instance lifecycle.
pub trait Decoder: Send {
    /// Deserialize a settings blob received in a `/format` message and
    /// reconfigure the decoder.
    fn read_format(&mut self, header: FormatHeader, settings: &[u8]) -> Result<(), CodecError>;

    fn name(&self) -> &'static str;
    fn channels(&self) -> u32;
    fn sample_rate(&self) -> u32;
    fn block_size(&self) -> u32;

    /// Decode one encoded block into `block_size * channels` interleaved
    /// samples. Returns the number of samples written.
    fn decode(&mut self, data: &[u8], samples: &mut [Sample]) -> Result<usize, CodecError>;
}

/// A named codec: a pair of encoder/decoder factories.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;
    fn new_encoder(&self) -> Box<dyn Encoder>;
    fn new_decoder(&self) -> Box<dyn Decoder>;
}

fn registry() -> &'static RwLock<HashMap<&'static str, Arc<dyn Codec>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, Arc<dyn Codec>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a codec under its name. Call before constructing any source or
/// sink; later registrations replace earlier ones of the same name.
pub fn register_codec(codec: Arc<dyn Codec>) {
    let name = codec.name();
    if registry().write().insert(name, codec).is_some() {
        tracing::warn!("codec '{}' registered twice", name);
    }
}

/// Look up a codec by name.
pub fn find_codec(name: &str) -> Option<Arc<dyn Codec>> {
    registry().read().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_codec_after_initialize() {
        crate::initialize();
        assert!(find_codec(pcm::CODEC_NAME).is_some());
        assert!(find_codec("no-such-codec").is_none());
    }

    #[test]
    fn test_registry_roundtrips_instances() {
        crate::initialize();
        let codec = find_codec(pcm::CODEC_NAME).unwrap();
        assert_eq!(codec.name(), "pcm");
        let encoder = codec.new_encoder();
        let decoder = codec.new_decoder();
        assert_eq!(encoder.name(), decoder.name());
    }
}
