//! Lock-free ring buffers between the audio and network threads
//!
//! Each ring is a bounded single-producer single-consumer queue. Which
//! thread owns which side depends on the direction: a source's audio
//! thread produces blocks that its network thread consumes, while a sink's
//! network thread produces blocks that its audio thread consumes. Pushing
//! into a full ring fails and the producer drops the block.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::audio::Sample;
use crate::event::StreamState;

/// Per-block stream metadata travelling alongside the audio ring.
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    /// Measured sample rate the block was produced at.
    pub sample_rate: f64,
    /// Destination channel onset requested by the source.
    pub channel: i32,
    /// Whether the block carries live audio or gap filler.
    pub state: StreamState,
}

/// Ring of interleaved audio blocks with a fixed per-slot sample count.
pub struct AudioRing {
    queue: ArrayQueue<Vec<Sample>>,
    block_samples: usize,
    dropped: AtomicUsize,
}

impl AudioRing {
    /// Create a ring holding `capacity` blocks of `block_samples`
    /// interleaved samples each.
    pub fn new(capacity: usize, block_samples: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            block_samples,
            dropped: AtomicUsize::new(0),
        }
    }

    /// Samples per block slot (`block_size * channels`).
    pub fn block_samples(&self) -> usize {
        self.block_samples
    }

    /// Push a block; returns false (and counts a drop) when full.
    pub fn push(&self, block: Vec<Sample>) -> bool {
        debug_assert_eq!(block.len(), self.block_samples);
        match self.queue.push(block) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop the oldest block, if any.
    pub fn pop(&self) -> Option<Vec<Sample>> {
        self.queue.pop()
    }

    /// An all-zero block of the ring's slot size.
    pub fn silent_block(&self) -> Vec<Sample> {
        vec![0.0; self.block_samples]
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Free block slots.
    pub fn write_available(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Blocks dropped because the ring was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Ring of [`BlockInfo`] records, one per audio-ring slot.
pub struct InfoRing {
    queue: ArrayQueue<BlockInfo>,
}

impl InfoRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn push(&self, info: BlockInfo) -> bool {
        self.queue.push(info).is_ok()
    }

    pub fn pop(&self) -> Option<BlockInfo> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn write_available(&self) -> usize {
        self.queue.capacity() - self.queue.len()
    }
}

/// Ring of measured sample rates, one per block sent (source side).
pub struct RateRing {
    queue: ArrayQueue<f64>,
}

impl RateRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn push(&self, rate: f64) -> bool {
        self.queue.push(rate).is_ok()
    }

    pub fn pop(&self) -> Option<f64> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_ring_fifo() {
        let ring = AudioRing::new(4, 8);
        assert!(ring.push(vec![1.0; 8]));
        assert!(ring.push(vec![2.0; 8]));
        assert_eq!(ring.len(), 2);

        assert_eq!(ring.pop().unwrap()[0], 1.0);
        assert_eq!(ring.pop().unwrap()[0], 2.0);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_audio_ring_drops_when_full() {
        let ring = AudioRing::new(2, 4);
        assert!(ring.push(ring.silent_block()));
        assert!(ring.push(ring.silent_block()));
        assert!(ring.is_full());
        assert!(!ring.push(ring.silent_block()));
        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_info_ring_parallels_audio_ring() {
        let ring = InfoRing::new(2);
        assert!(ring.push(BlockInfo {
            sample_rate: 44100.0,
            channel: 0,
            state: StreamState::Play,
        }));
        assert_eq!(ring.write_available(), 1);
        let info = ring.pop().unwrap();
        assert_eq!(info.channel, 0);
        assert_eq!(info.state, StreamState::Play);
    }

    #[test]
    fn test_rate_ring_bounded() {
        let ring = RateRing::new(1);
        assert!(ring.push(48000.0));
        assert!(ring.is_full());
        assert!(!ring.push(48001.0));
        assert_eq!(ring.pop(), Some(48000.0));
        assert!(ring.is_empty());
    }
}
