#![allow(missing_docs)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{ReclaimError, Result};

/// Tunables of the reclamation engine.
///
/// Every value is resolved once when the subsystem is created. Numeric
/// thresholds are workload knobs rather than fixed behavior; the presets only
/// pick sensible proportions of the physical page count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageoutConfig {
    /// Number of physical pages managed by the arena.
    pub total_pages: u32,
    /// Size of one page in bytes (sizes compressor scratch buffers).
    pub page_size: usize,
    /// Free pages kept back for the reclaimer itself; below this is critical.
    pub free_reserved: u32,
    /// Minimum healthy free-page count.
    pub free_min: u32,
    /// Free-page count the scan loop drives toward.
    pub free_target: u32,
    /// Share of (active + inactive) the balancer keeps inactive.
    pub inactive_target_percent: u32,
    /// Number of speculative age buckets (the aged bucket is extra).
    pub speculative_buckets: u8,
    /// How long a speculative bucket stays the newest before a new one opens.
    pub speculative_age_ms: u64,
    /// Speculative pages above this share of total pages are aged early.
    pub speculative_target_percent: u32,
    /// The file-backed pageable pool is protected below `total_pages / divisor`.
    pub filecache_floor_divisor: u32,
    /// File-backed inactive pages below this share of the inactive target
    /// make the selector lean toward anonymous pages.
    pub file_inactive_target_percent: u32,
    /// Anonymous inactive pages at or below this count are not preferred.
    pub anonymous_min: u32,
    /// Maximum consecutive anonymous picks before a file-backed pick is forced.
    pub anonymous_pick_limit: u32,
    /// Below the file-cache floor, one file-backed page is reactivated every
    /// this many picks.
    pub filecache_reactivate_interval: u32,
    /// Referenced pages reactivated per scan pass before they are forced through.
    pub reactivate_limit: u32,
    /// Extended reactivation limit for important pages.
    pub important_reactivate_limit: u32,
    /// Maximum depth of the compression laundry queue.
    pub compressor_max_depth: u32,
    /// Maximum depth of the write-back laundry queue.
    pub external_max_depth: u32,
    /// A laundry queue is throttled at this percentage of its max depth.
    pub throttle_percent: u32,
    /// Number of compressor worker threads.
    pub compressor_threads: usize,
    /// Upper bound on pages one compressor thread drains per batch.
    pub compressor_batch: usize,
    /// Freed pages are flushed to the free list every this many pages.
    pub free_batch_flush: usize,
    /// Scan-loop pause when every reclaim source is empty.
    pub empty_wait_ms: u64,
    /// Scan-loop pause after a burst of iterations without progress.
    pub burst_wait_ms: u64,
    /// How long the compression queue may stay throttled before a deadlock is assumed.
    pub deadlock_wait_ms: u64,
    /// Poll interval of idle worker threads.
    pub worker_idle_ms: u64,
    /// How long an allocator blocks for a free page before giving up.
    pub alloc_wait_ms: u64,
    /// Iterations without progress before the scan loop takes a burst pause.
    pub burst_limit: u32,
    /// Constant part of the forced-reclaim budget granted on deadlock.
    pub deadlock_relief: u32,
    /// Non-blocking object lock attempts before the victim is deferred.
    pub object_lock_retries: u32,
    /// Timed acquisition used for the published object of interest.
    pub object_lock_backoff_us: u64,
    /// Whether dirty anonymous pages go to the compressor.
    pub compressor_active: bool,
    /// Whether anonymous pages can be paged out at all.
    pub dynamic_paging: bool,
    /// The donate queue is reclaimed once it holds more than this many pages.
    pub donate_target: u32,
    /// The background queue is reclaimed once it holds more than this many pages.
    pub background_target: u32,
    /// Throttled file-backed picks tolerated before one is reactivated outright.
    pub external_forced_reactivate_limit: u32,
    /// Pages the balancer may deactivate per scan iteration.
    pub balance_budget: u32,
    /// Length of one statistics interval.
    pub stats_interval_ms: u64,
    /// Number of intervals retained in the statistics ring.
    pub stats_ring_len: usize,
    /// Pressure notifier poll interval.
    pub pressure_poll_ms: u64,
}

impl Default for PageoutConfig {
    fn default() -> Self {
        Self::for_total_pages(65_536)
    }
}

impl PageoutConfig {
    /// Builds a configuration whose reserves scale with `total_pages`.
    pub fn for_total_pages(total_pages: u32) -> Self {
        let total = total_pages.max(16);
        let free_reserved = (total / 200).max(2);
        let free_min = (total / 100).max(free_reserved + 1);
        let free_target = (total / 40).max(free_min + 1);
        Self {
            total_pages: total,
            page_size: 4096,
            free_reserved,
            free_min,
            free_target,
            inactive_target_percent: 50,
            speculative_buckets: 8,
            speculative_age_ms: 500,
            speculative_target_percent: 5,
            filecache_floor_divisor: 20,
            file_inactive_target_percent: 25,
            anonymous_min: 0,
            anonymous_pick_limit: 24,
            filecache_reactivate_interval: 100,
            reactivate_limit: 100,
            important_reactivate_limit: 1000,
            compressor_max_depth: (total / 64).clamp(16, 2048),
            external_max_depth: (total / 128).clamp(16, 1024),
            throttle_percent: 80,
            compressor_threads: 2,
            compressor_batch: 32,
            free_batch_flush: 32,
            empty_wait_ms: 50,
            burst_wait_ms: 5,
            deadlock_wait_ms: 100,
            worker_idle_ms: 50,
            alloc_wait_ms: 10_000,
            burst_limit: 128,
            deadlock_relief: 100,
            object_lock_retries: 4,
            object_lock_backoff_us: 50,
            compressor_active: true,
            dynamic_paging: true,
            donate_target: total / 100,
            background_target: total / 50,
            external_forced_reactivate_limit: 1000,
            balance_budget: 32,
            stats_interval_ms: 1000,
            stats_ring_len: 60,
            pressure_poll_ms: 100,
        }
    }

    /// Small arena with short waits, suited to tests.
    pub fn small() -> Self {
        Self {
            compressor_max_depth: 100,
            external_max_depth: 100,
            compressor_threads: 1,
            empty_wait_ms: 5,
            burst_wait_ms: 1,
            worker_idle_ms: 5,
            pressure_poll_ms: 10,
            stats_interval_ms: 50,
            ..Self::for_total_pages(256)
        }
    }

    /// Parses a TOML document; keys left out keep the values of
    /// [`PageoutConfig::for_total_pages`] for the given (or default) page count.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let overrides: toml::Table = text.parse()?;
        let base = match overrides.get("total_pages").and_then(|v| v.as_integer()) {
            Some(n) => Self::for_total_pages(
                u32::try_from(n)
                    .map_err(|_| ReclaimError::Config(format!("total_pages out of range: {n}")))?,
            ),
            None => Self::default(),
        };
        let toml::Value::Table(mut merged) =
            toml::Value::try_from(&base).map_err(|err| ReclaimError::Config(err.to_string()))?
        else {
            return Err(ReclaimError::Config("config did not serialize to a table".into()));
        };
        merged.extend(overrides);
        let cfg: Self = toml::Value::Table(merged).try_into()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_pages == 0 {
            return Err(ReclaimError::Config("total_pages must be non-zero".into()));
        }
        if !(self.free_reserved <= self.free_min && self.free_min <= self.free_target) {
            return Err(ReclaimError::Config(format!(
                "free thresholds must satisfy reserved <= min <= target (got {} / {} / {})",
                self.free_reserved, self.free_min, self.free_target
            )));
        }
        if self.free_target >= self.total_pages {
            return Err(ReclaimError::Config(
                "free_target must be below total_pages".into(),
            ));
        }
        if self.compressor_max_depth == 0 || self.external_max_depth == 0 {
            return Err(ReclaimError::Config("laundry depths must be non-zero".into()));
        }
        if self.throttle_percent == 0 || self.throttle_percent > 100 {
            return Err(ReclaimError::Config("throttle_percent must be in 1..=100".into()));
        }
        if self.compressor_threads == 0 {
            return Err(ReclaimError::Config("at least one compressor thread is required".into()));
        }
        if self.speculative_buckets == 0 {
            return Err(ReclaimError::Config("speculative_buckets must be non-zero".into()));
        }
        if self.anonymous_pick_limit == 0 || self.filecache_floor_divisor == 0 {
            return Err(ReclaimError::Config(
                "anonymous_pick_limit and filecache_floor_divisor must be non-zero".into(),
            ));
        }
        if self.inactive_target_percent > 100
            || self.file_inactive_target_percent > 100
            || self.speculative_target_percent > 100
        {
            return Err(ReclaimError::Config("percentages must not exceed 100".into()));
        }
        Ok(())
    }

    /// Depth at which a laundry queue of capacity `max_depth` counts as throttled.
    pub fn throttle_depth(&self, max_depth: u32) -> u32 {
        let depth = (u64::from(max_depth) * u64::from(self.throttle_percent) / 100) as u32;
        depth.max(1)
    }

    pub fn filecache_floor(&self) -> u32 {
        self.total_pages / self.filecache_floor_divisor
    }

    pub fn speculative_target(&self) -> u32 {
        (u64::from(self.total_pages) * u64::from(self.speculative_target_percent) / 100) as u32
    }

    pub fn speculative_age(&self) -> Duration {
        Duration::from_millis(self.speculative_age_ms)
    }

    pub fn empty_wait(&self) -> Duration {
        Duration::from_millis(self.empty_wait_ms)
    }

    pub fn burst_wait(&self) -> Duration {
        Duration::from_millis(self.burst_wait_ms)
    }

    pub fn deadlock_wait(&self) -> Duration {
        Duration::from_millis(self.deadlock_wait_ms)
    }

    pub fn worker_idle(&self) -> Duration {
        Duration::from_millis(self.worker_idle_ms)
    }

    pub fn alloc_wait(&self) -> Duration {
        Duration::from_millis(self.alloc_wait_ms)
    }

    pub fn object_lock_backoff(&self) -> Duration {
        Duration::from_micros(self.object_lock_backoff_us)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn pressure_poll(&self) -> Duration {
        Duration::from_millis(self.pressure_poll_ms)
    }
}
