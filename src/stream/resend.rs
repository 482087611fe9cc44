//! Retransmission bookkeeping
//!
//! The sink keeps one ack entry per incomplete block it still considers
//! recoverable. Entries rate-limit re-requests and cap how often a block
//! may be asked for before it is given up on.

use std::collections::HashMap;

/// Per-block retransmission state.
#[derive(Debug, Clone, Copy)]
pub struct Ack {
    remaining: i32,
    last_request: f64,
}

impl Ack {
    /// True iff a request is due: tries remain and at least `interval`
    /// seconds passed since the last one. Stamps and decrements on success.
    pub fn check(&mut self, now: f64, interval: f64) -> bool {
        if self.remaining > 0 && now - self.last_request >= interval {
            self.last_request = now;
            self.remaining -= 1;
            true
        } else {
            false
        }
    }
}

/// Ack entries keyed by block sequence.
#[derive(Debug, Default)]
pub struct AckList {
    entries: HashMap<i32, Ack>,
    limit: i32,
}

impl AckList {
    pub fn new(limit: i32) -> Self {
        Self {
            entries: HashMap::new(),
            limit: limit.max(0),
        }
    }

    /// Change the per-block request limit; existing entries are dropped.
    pub fn setup(&mut self, limit: i32) {
        self.limit = limit.max(0);
        self.entries.clear();
    }

    /// Fetch the entry for `sequence`, creating a fresh one on demand. A
    /// fresh entry passes its first `check` immediately.
    pub fn get(&mut self, sequence: i32) -> &mut Ack {
        self.entries.entry(sequence).or_insert(Ack {
            remaining: self.limit,
            last_request: f64::NEG_INFINITY,
        })
    }

    pub fn contains(&self, sequence: i32) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn remove(&mut self, sequence: i32) {
        self.entries.remove(&sequence);
    }

    /// Drop every entry older than `sequence`; returns how many went.
    pub fn remove_before(&mut self, sequence: i32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|&seq, _| seq >= sequence);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
