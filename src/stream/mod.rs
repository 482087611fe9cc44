//! The streaming engines and their supporting storage

pub mod block;
pub mod resend;
pub mod sink;
pub mod source;

pub use sink::{ProcessFn, Sink, SinkSettings};
pub use source::{Source, SourceSettings};
