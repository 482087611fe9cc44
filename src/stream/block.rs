//! Sequenced block storage
//!
//! A block is one codec frame of audio, fragmented into `nframes` wire
//! packets. The receiver reassembles fragments into [`Block`]s held in a
//! sequence-ordered [`BlockQueue`]; the sender keeps already-emitted blocks
//! in a [`HistoryBuffer`] so it can serve retransmission requests.

use bytes::Bytes;
use std::collections::VecDeque;

/// A partially or fully reassembled block on the receiver side.
#[derive(Debug)]
pub struct Block {
    pub sequence: i32,
    pub sample_rate: f64,
    pub channel: i32,
    total_size: usize,
    frames: Vec<bool>,
    received: usize,
    payload: Vec<u8>,
}

impl Block {
    fn new(sequence: i32, sample_rate: f64, channel: i32, total_size: usize, nframes: usize) -> Self {
        Self {
            sequence,
            sample_rate,
            channel,
            total_size,
            frames: vec![false; nframes.max(1)],
            received: 0,
            payload: vec![0; total_size],
        }
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn size(&self) -> usize {
        self.total_size
    }

    pub fn has_frame(&self, index: usize) -> bool {
        self.frames.get(index).copied().unwrap_or(false)
    }

    /// Store one fragment. Every fragment except the last shares the same
    /// length, so fragment `i` starts at `i * len`; the final fragment is
    /// anchored to the end of the payload. Frames are immutable once
    /// added; duplicates and out-of-range fragments are ignored.
    pub fn add_frame(&mut self, index: usize, data: &[u8]) {
        if index >= self.frames.len() || self.frames[index] {
            return;
        }
        let offset = if index == self.frames.len() - 1 {
            self.total_size.saturating_sub(data.len())
        } else {
            index * data.len()
        };
        let Some(slot) = self.payload.get_mut(offset..offset + data.len()) else {
            tracing::warn!(
                "fragment {} of block {} exceeds its total size",
                index,
                self.sequence
            );
            return;
        };
        slot.copy_from_slice(data);
        self.frames[index] = true;
        self.received += 1;
    }

    /// All fragments present.
    pub fn complete(&self) -> bool {
        self.received == self.frames.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Sequence-ordered queue of the newest in-flight blocks.
#[derive(Debug)]
pub struct BlockQueue {
    blocks: VecDeque<Block>,
    capacity: usize,
}

impl BlockQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn full(&self) -> bool {
        self.blocks.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn find_mut(&mut self, sequence: i32) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.sequence == sequence)
    }

    /// Insert a fresh block, keeping the queue ordered by sequence.
    /// The caller is responsible for evicting when full.
    pub fn insert(
        &mut self,
        sequence: i32,
        sample_rate: f64,
        channel: i32,
        total_size: usize,
        nframes: usize,
    ) -> &mut Block {
        let position = self
            .blocks
            .iter()
            .position(|b| b.sequence > sequence)
            .unwrap_or(self.blocks.len());
        self.blocks.insert(
            position,
            Block::new(sequence, sample_rate, channel, total_size, nframes),
        );
        &mut self.blocks[position]
    }

    pub fn front(&self) -> Option<&Block> {
        self.blocks.front()
    }

    pub fn pop_front(&mut self) -> Option<Block> {
        self.blocks.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
}

/// One already-sent block kept around for retransmission.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub sequence: i32,
    pub sample_rate: f64,
    pub nframes: usize,
    frame_size: usize,
    payload: Bytes,
}

impl HistoryEntry {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// The bytes of fragment `index`, or `None` when out of range.
    pub fn frame(&self, index: usize) -> Option<&[u8]> {
        if index >= self.nframes {
            return None;
        }
        let offset = index * self.frame_size;
        let end = (offset + self.frame_size).min(self.payload.len());
        Some(&self.payload[offset..end])
    }
}

/// Sender-side replay cache, bounded by the resend buffer duration.
/// Zero capacity disables retransmission entirely.
#[derive(Debug)]
pub struct HistoryBuffer {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, sequence: i32, sample_rate: f64, payload: Bytes, nframes: usize, frame_size: usize) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            sequence,
            sample_rate,
            nframes,
            frame_size,
            payload,
        });
    }

    pub fn find(&self, sequence: i32) -> Option<&HistoryEntry> {
        self.entries.iter().rev().find(|e| e.sequence == sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_reassembly_in_any_order() {
        let mut block = Block::new(0, 44100.0, 0, 10, 3);
        // fragments of 4, 4 and 2 bytes
        block.add_frame(2, &[9, 10]);
        assert!(!block.complete());
        block.add_frame(0, &[1, 2, 3, 4]);
        block.add_frame(1, &[5, 6, 7, 8]);
        assert!(block.complete());
        assert_eq!(block.payload(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_block_ignores_duplicate_frames() {
        let mut block = Block::new(0, 44100.0, 0, 4, 2);
        block.add_frame(0, &[1, 2]);
        block.add_frame(0, &[9, 9]);
        block.add_frame(1, &[3, 4]);
        assert_eq!(block.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_block_single_frame() {
        let mut block = Block::new(5, 48000.0, 1, 3, 1);
        block.add_frame(0, &[7, 8, 9]);
        assert!(block.complete());
        assert_eq!(block.size(), 3);
    }

    #[test]
    fn test_queue_keeps_sequence_order() {
        let mut queue = BlockQueue::new(8);
        queue.insert(3, 44100.0, 0, 1, 1);
        queue.insert(1, 44100.0, 0, 1, 1);
        queue.insert(2, 44100.0, 0, 1, 1);
        let order: Vec<i32> = queue.iter().map(|b| b.sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(queue.front().unwrap().sequence, 1);
    }

    #[test]
    fn test_queue_find() {
        let mut queue = BlockQueue::new(4);
        queue.insert(10, 44100.0, 0, 1, 1);
        assert!(queue.find_mut(10).is_some());
        assert!(queue.find_mut(11).is_none());
    }

    #[test]
    fn test_history_serves_frames() {
        let mut history = HistoryBuffer::new(4);
        history.push(7, 44100.0, Bytes::from_static(&[1, 2, 3, 4, 5]), 2, 3);
        let entry = history.find(7).unwrap();
        assert_eq!(entry.frame(0).unwrap(), &[1, 2, 3]);
        assert_eq!(entry.frame(1).unwrap(), &[4, 5]);
        assert!(entry.frame(2).is_none());
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = HistoryBuffer::new(2);
        for seq in 0..3 {
            history.push(seq, 44100.0, Bytes::from_static(&[0]), 1, 1);
        }
        assert!(history.find(0).is_none());
        assert!(history.find(1).is_some());
        assert!(history.find(2).is_some());
    }

    #[test]
    fn test_zero_capacity_history_disables_resending() {
        let mut history = HistoryBuffer::new(0);
        history.push(0, 44100.0, Bytes::from_static(&[0]), 1, 1);
        assert!(history.find(0).is_none());
    }
}
