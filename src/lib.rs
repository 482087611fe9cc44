//! # AOO — Audio over OSC
//!
//! Peer-to-peer streaming of uncompressed or compressed PCM audio between
//! loosely-coupled endpoints over unreliable datagram transport, with all
//! control traffic embedded in OSC messages.
//!
//! A process hosts any number of [`Source`]s (senders) and [`Sink`]s
//! (receivers), each identified by a 32-bit integer. The library never
//! touches a socket: the host feeds incoming datagrams to
//! `handle_message`, polls `Source::send` from a network thread and
//! supplies a reply function per remote endpoint.
//!
//! ```text
//!  SENDER                                     RECEIVER
//!  ┌──────────────┐                           ┌──────────────┐
//!  │ DSP callback │ audio thread              │ DSP callback │ audio thread
//!  └──────┬───────┘                           └──────▲───────┘
//!         ▼                                          │ mix-add
//!  ┌──────────────┐                           ┌──────┴───────┐
//!  │  resampler   │                           │  resampler   │◄─ DLL drift
//!  └──────┬───────┘                           └──────▲───────┘
//!         ▼ lock-free rings        lock-free rings   │
//!  ┌──────────────┐                           ┌──────┴───────┐
//!  │ encode +     │ network thread            │ reassemble + │ network thread
//!  │ fragment     │──── /data over UDP ──────►│ decode       │
//!  │ history      │◄─── /resend ──────────────│ block queue  │
//!  └──────────────┘                           └──────────────┘
//! ```
//!
//! Call [`initialize`] once before constructing any object; it fills the
//! codec registry (PCM, plus Opus with the `opus` feature).

pub mod audio;
pub mod codec;
pub mod error;
pub mod event;
pub mod protocol;
pub mod stream;
pub mod time;

pub use codec::Format;
pub use error::{CodecError, Error, MessageError, Result};
pub use event::{Event, StreamState};
pub use stream::{ProcessFn, Sink, SinkSettings, Source, SourceSettings};
pub use time::TimeTag;

use std::net::SocketAddr;
use std::sync::{Arc, Once};

/// Addresses every matching object behind an endpoint.
pub const WILDCARD_ID: i32 = -1;
/// An unset id.
pub const NONE_ID: i32 = i32::MIN;

/// Sends a datagram back to a remote endpoint. The function closes over
/// whatever transport state it needs; the engine only compares endpoints
/// by value and never retries a failed send.
pub type ReplyFn = Arc<dyn Fn(SocketAddr, &[u8]) -> std::io::Result<usize> + Send + Sync>;

/// Protocol defaults
pub mod constants {
    /// Default send latency in milliseconds.
    pub const DEFAULT_SOURCE_BUFFER_MS: f64 = 10.0;

    /// Default receive latency in milliseconds.
    pub const DEFAULT_SINK_BUFFER_MS: f64 = 20.0;

    /// Default replay-cache duration in milliseconds.
    pub const DEFAULT_RESEND_BUFFER_MS: f64 = 1000.0;

    /// Default number of re-requests per block.
    pub const DEFAULT_RESEND_LIMIT: i32 = 4;

    /// Default spacing between re-requests in milliseconds.
    pub const DEFAULT_RESEND_INTERVAL_MS: f64 = 5.0;

    /// Default per-burst cap on requested fragments.
    pub const DEFAULT_RESEND_MAX_FRAMES: i32 = 64;

    /// Default `/resend` datagram budget in bytes.
    pub const DEFAULT_RESEND_PACKET_SIZE: usize = 256;

    /// Default time-filter (DLL) bandwidth.
    pub const DEFAULT_TIME_FILTER_BANDWIDTH: f64 = 0.012;
}

/// Register the built-in codecs. Idempotent; call before constructing any
/// source or sink.
pub fn initialize() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        codec::pcm::setup();
        #[cfg(feature = "opus")]
        codec::opus::setup();
    });
}
