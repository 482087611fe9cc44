//! Error types for the streaming engine

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Engine is not set up")]
    NotSetup,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Output buffer too small: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("Invalid codec settings blob ({0} bytes)")]
    InvalidSettings(usize),
}

/// Wire message errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Not an AoO message")]
    NotAoo,

    #[error("OSC bundles are not supported")]
    Bundle,

    #[error("Malformed OSC packet: {0}")]
    Malformed(String),

    #[error("Wrong number of arguments for {pattern}: {count}")]
    Arity { pattern: &'static str, count: usize },

    #[error("Bad argument {index} for {pattern}")]
    BadArgument { pattern: &'static str, index: usize },

    #[error("Unknown message '{0}'")]
    UnknownMessage(String),

    #[error("Message addressed to wrong id {0}")]
    WrongId(i32),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
