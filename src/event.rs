//! Events surfaced to the host
//!
//! The engine only reports what it observes on the stream; delivery is
//! batched per audio tick and handed to the sink's process callback.

use std::net::SocketAddr;

/// Playback state of a remote source as seen by a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// The source stopped delivering audio (underrun or gap).
    Stop,
    /// The source is delivering audio.
    Play,
}

/// A host-visible event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A remote source transitioned between playing and stopped.
    SourceState {
        endpoint: SocketAddr,
        id: i32,
        state: StreamState,
    },
}

/// Upper bound on events delivered in one process tick.
pub const MAX_EVENTS_PER_TICK: usize = 256;
