//! Physical-memory reclamation engine.
//!
//! Resident pages live in an index-linked arena of LRU-approximation queues.
//! A scan thread balances those queues, picks victims and decides per page
//! whether to free, reactivate, throttle or launder it; a compressor pool and
//! an external write-back thread drain the laundry. See [`pageout::Pageout`]
//! for the subsystem handle.

#![warn(missing_docs)]

pub mod config;
pub mod pageout;
pub mod primitives;
pub mod types;
pub mod vm;

pub use config::PageoutConfig;
pub use pageout::{Decision, Pageout, PressureLevel, ScanOutcome};
pub use types::{ObjectId, PageIdx, PagerHandle, ReclaimError, Result};
