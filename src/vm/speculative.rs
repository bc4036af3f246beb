#![allow(missing_docs)]

use std::time::{Duration, Instant};

use smallvec::SmallVec;

/// Age bookkeeping for the speculative (read-ahead) buckets.
///
/// New read-ahead pages land in the newest bucket. A bucket stays newest for
/// one age interval; once the ring wraps, or a bucket has lived through every
/// interval of the ring, its pages are promoted to the aged bucket.
pub struct SpeculativeRing {
    newest: u8,
    opened_at: Vec<Option<Instant>>,
    age: Duration,
}

impl SpeculativeRing {
    pub fn new(buckets: u8, age: Duration) -> Self {
        let buckets = buckets.max(1);
        Self {
            newest: 0,
            opened_at: vec![None; buckets as usize],
            age,
        }
    }

    pub fn buckets(&self) -> u8 {
        self.opened_at.len() as u8
    }

    pub fn newest(&self) -> u8 {
        self.newest
    }

    /// Bucket that read-ahead pages inserted at `now` belong to.
    ///
    /// When the ring rotates onto a bucket still holding pages, that bucket is
    /// returned as the second element and must be promoted before inserting.
    pub fn insertion_bucket(&mut self, now: Instant) -> (u8, Option<u8>) {
        let cur = self.newest as usize;
        match self.opened_at[cur] {
            None => {
                self.opened_at[cur] = Some(now);
                (self.newest, None)
            }
            Some(opened) if now.saturating_duration_since(opened) < self.age => (self.newest, None),
            Some(_) => {
                let next = (cur + 1) % self.opened_at.len();
                let stale = self.opened_at[next].map(|_| next as u8);
                self.opened_at[next] = Some(now);
                self.newest = next as u8;
                (self.newest, stale)
            }
        }
    }

    /// Buckets that outlived the whole ring and should be promoted.
    pub fn expired(&self, now: Instant) -> SmallVec<[u8; 8]> {
        let lifetime = self.age * self.opened_at.len() as u32;
        self.opened_at
            .iter()
            .enumerate()
            .filter_map(|(idx, opened)| match opened {
                Some(at) if now.saturating_duration_since(*at) >= lifetime => Some(idx as u8),
                _ => None,
            })
            .collect()
    }

    /// Occupied bucket that was opened first.
    pub fn oldest(&self) -> Option<u8> {
        self.opened_at
            .iter()
            .enumerate()
            .filter_map(|(idx, opened)| opened.map(|at| (at, idx as u8)))
            .min()
            .map(|(_, idx)| idx)
    }

    pub fn mark_promoted(&mut self, bucket: u8) {
        if let Some(slot) = self.opened_at.get_mut(bucket as usize) {
            *slot = None;
        }
    }
}
