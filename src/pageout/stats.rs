#![allow(missing_docs)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::types::Result;

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Cumulative reclaim counters, updated without locks.
        #[derive(Debug, Default)]
        pub struct PageoutStats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`PageoutStats`].
        #[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
        pub struct PageoutStatsSnapshot {
            $(pub $name: u64,)*
        }

        impl PageoutStats {
            pub fn snapshot(&self) -> PageoutStatsSnapshot {
                PageoutStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }

        impl PageoutStatsSnapshot {
            /// Counter growth since `earlier`.
            pub fn delta(&self, earlier: &PageoutStatsSnapshot) -> PageoutStatsSnapshot {
                PageoutStatsSnapshot {
                    $($name: self.$name.saturating_sub(earlier.$name),)*
                }
            }
        }
    };
}

counters! {
    /// Pages returned to the free list by the scan loop or workers.
    freed,
    freed_speculative,
    freed_cleaned,
    compressed,
    compress_failed,
    reactivated,
    purged,
    deactivated,
    laundered,
    throttle_events,
    diverted_throttled,
    forced_reclaims,
    deadlocks,
    write_backs,
    write_back_errors,
    gc_pages,
    filecache_reactivated,
    /// Victims skipped because their object lock was contended.
    lock_deferrals,
    scan_passes,
}

impl PageoutStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// One statistics interval.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSample {
    /// Milliseconds since the subsystem started.
    pub at_ms: u64,
    pub counters: PageoutStatsSnapshot,
    pub compressor_depth: u32,
    pub external_depth: u32,
    pub free_pages: u32,
}

/// Rolling ring of per-interval deltas.
pub struct StatsRing {
    samples: VecDeque<StatsSample>,
    capacity: usize,
    started: Instant,
    last: PageoutStatsSnapshot,
}

impl StatsRing {
    pub fn new(capacity: usize, started: Instant) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            started,
            last: PageoutStatsSnapshot::default(),
        }
    }

    /// Closes the current interval.
    pub fn roll(
        &mut self,
        now: Instant,
        current: PageoutStatsSnapshot,
        compressor_depth: u32,
        external_depth: u32,
        free_pages: u32,
    ) -> StatsSample {
        let sample = StatsSample {
            at_ms: now.saturating_duration_since(self.started).as_millis() as u64,
            counters: current.delta(&self.last),
            compressor_depth,
            external_depth,
            free_pages,
        };
        self.last = current;
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        sample
    }

    pub fn samples(&self) -> impl Iterator<Item = &StatsSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        let samples: Vec<&StatsSample> = self.samples.iter().collect();
        Ok(serde_json::to_string(&samples)?)
    }
}
