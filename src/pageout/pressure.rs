#![allow(missing_docs)]

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::info;

use crate::config::PageoutConfig;

/// Coarse memory-pressure signal derived from the free-page count.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub enum PressureLevel {
    Normal,
    /// Free pages below target; the scan loop is working.
    Warning,
    /// Free pages below the healthy minimum.
    Urgent,
    /// Free pages inside the reserve.
    Critical,
}

impl PressureLevel {
    pub fn from_free(free: u32, cfg: &PageoutConfig) -> Self {
        if free < cfg.free_reserved {
            PressureLevel::Critical
        } else if free < cfg.free_min {
            PressureLevel::Urgent
        } else if free < cfg.free_target {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}

/// Broadcasts pressure-level changes to subscribers.
pub struct PressureNotifier {
    level: Mutex<PressureLevel>,
    changed: Condvar,
}

impl Default for PressureNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PressureNotifier {
    pub fn new() -> Self {
        Self {
            level: Mutex::new(PressureLevel::Normal),
            changed: Condvar::new(),
        }
    }

    pub fn level(&self) -> PressureLevel {
        *self.level.lock()
    }

    /// Publishes the level for `free`; returns the new level when it changed.
    pub fn update(&self, free: u32, cfg: &PageoutConfig) -> Option<PressureLevel> {
        let next = PressureLevel::from_free(free, cfg);
        let mut level = self.level.lock();
        if *level == next {
            return None;
        }
        info!(from = ?*level, to = ?next, free, "pageout.pressure.changed");
        *level = next;
        drop(level);
        self.changed.notify_all();
        Some(next)
    }

    /// Blocks until the level differs from `seen` or `timeout` elapses;
    /// returns the level observed last.
    pub fn wait_for_change(&self, seen: PressureLevel, timeout: Duration) -> PressureLevel {
        let mut level = self.level.lock();
        if *level == seen {
            self.changed.wait_while_for(&mut level, |l| *l == seen, timeout);
        }
        *level
    }

    pub(crate) fn wake_all(&self) {
        self.changed.notify_all();
    }
}
