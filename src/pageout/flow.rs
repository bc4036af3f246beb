#![allow(missing_docs)]

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PageoutConfig;

/// Scan-loop flow-control state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlowState {
    Idle,
    /// The compression queue is throttled; waiting for it to drain.
    Delayed { deadline: Instant },
    /// The queue did not drain in time; `budget` pages may bypass throttling.
    DeadlockDetected { budget: u32 },
}

/// Serializable tag of [`FlowState`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum FlowPhase {
    Idle,
    Delayed,
    DeadlockDetected,
}

impl FlowState {
    pub fn phase(&self) -> FlowPhase {
        match self {
            FlowState::Idle => FlowPhase::Idle,
            FlowState::Delayed { .. } => FlowPhase::Delayed,
            FlowState::DeadlockDetected { .. } => FlowPhase::DeadlockDetected,
        }
    }
}

/// Inputs sampled by the scan loop when the compression queue is throttled.
#[derive(Copy, Clone, Debug, Default)]
pub struct FlowInputs {
    /// Dynamic paging is enabled (anonymous pages may be compressed).
    pub dynamic_paging: bool,
    /// Free pages are at or above the healthy minimum.
    pub free_healthy: bool,
    /// The file-backed pool is above its floor and has inactive pages.
    pub filecache_pressure_low: bool,
    /// Threads blocked waiting for a free page.
    pub waiters: u32,
}

/// What the scan loop must do next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlowDecision {
    Proceed,
    /// Do not block; bias selection toward file-backed pages.
    Defer,
    /// Block the scan thread for at most this long.
    Wait(Duration),
    /// Deadlock assumed; the caller wakes the GC helper and resumes
    /// reclaiming with `budget` forced reclaims.
    DeadlockDetected { budget: u32 },
}

/// The sole authority for blocking the scan thread.
pub struct FlowControl {
    state: FlowState,
    empty_wait: Duration,
    burst_wait: Duration,
    deadlock_wait: Duration,
    relief: u32,
}

impl FlowControl {
    pub fn new(cfg: &PageoutConfig) -> Self {
        Self {
            state: FlowState::Idle,
            empty_wait: cfg.empty_wait(),
            burst_wait: cfg.burst_wait(),
            deadlock_wait: cfg.deadlock_wait(),
            relief: cfg.deadlock_relief,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Every reclaim source is empty.
    pub fn on_empty(&self) -> Duration {
        self.empty_wait
    }

    /// The burst limit was reached without progress.
    pub fn on_burst(&self) -> Duration {
        self.burst_wait
    }

    /// Called every iteration with the current throttle status of the
    /// compression queue; a drained queue ends the delay.
    pub fn observe(&mut self, compressor_throttled: bool) {
        if let FlowState::Delayed { .. } = self.state {
            if !compressor_throttled {
                debug!("pageout.flow.drained");
                self.state = FlowState::Idle;
            }
        }
    }

    /// The compression queue is throttled.
    pub fn on_compressor_throttled(&mut self, now: Instant, inputs: FlowInputs) -> FlowDecision {
        match self.state {
            FlowState::Idle => {
                if !inputs.dynamic_paging {
                    // Internal victims are diverted by the decision engine.
                    return FlowDecision::Proceed;
                }
                if inputs.free_healthy && inputs.filecache_pressure_low {
                    debug!("pageout.flow.defer");
                    return FlowDecision::Defer;
                }
                let deadline = now + self.deadlock_wait;
                info!(wait_ms = self.deadlock_wait.as_millis() as u64, "pageout.flow.delayed");
                self.state = FlowState::Delayed { deadline };
                FlowDecision::Wait(self.deadlock_wait)
            }
            FlowState::Delayed { deadline } => {
                if now >= deadline {
                    let budget = self.relief.saturating_add(inputs.waiters).max(1);
                    warn!(budget, waiters = inputs.waiters, "pageout.flow.deadlock_detected");
                    self.state = FlowState::DeadlockDetected { budget };
                    FlowDecision::DeadlockDetected { budget }
                } else {
                    FlowDecision::Wait(deadline - now)
                }
            }
            FlowState::DeadlockDetected { .. } => FlowDecision::Proceed,
        }
    }

    /// Whether a forced reclaim may bypass throttling right now.
    pub fn forced_reclaim_available(&self) -> bool {
        matches!(self.state, FlowState::DeadlockDetected { budget } if budget > 0)
    }

    /// Spends one unit of the forced-reclaim budget. Returns false when no
    /// budget is available.
    pub fn consume_forced(&mut self) -> bool {
        let FlowState::DeadlockDetected { budget } = self.state else {
            return false;
        };
        if budget <= 1 {
            info!("pageout.flow.deadlock_cleared");
            self.state = FlowState::Idle;
        } else {
            self.state = FlowState::DeadlockDetected { budget: budget - 1 };
        }
        true
    }

    /// The free target was met.
    pub fn reset(&mut self) {
        self.state = FlowState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttled_inputs(waiters: u32) -> FlowInputs {
        FlowInputs {
            dynamic_paging: true,
            free_healthy: false,
            filecache_pressure_low: false,
            waiters,
        }
    }

    #[test]
    fn defers_when_healthy() {
        let mut flow = FlowControl::new(&PageoutConfig::small());
        let inputs = FlowInputs {
            dynamic_paging: true,
            free_healthy: true,
            filecache_pressure_low: true,
            waiters: 0,
        };
        assert_eq!(flow.on_compressor_throttled(Instant::now(), inputs), FlowDecision::Defer);
        assert_eq!(flow.state(), FlowState::Idle);
    }

    #[test]
    fn delayed_then_deadlock_then_idle() {
        let cfg = PageoutConfig {
            deadlock_wait_ms: 100,
            deadlock_relief: 3,
            ..PageoutConfig::small()
        };
        let mut flow = FlowControl::new(&cfg);
        let t0 = Instant::now();
        assert_eq!(
            flow.on_compressor_throttled(t0, throttled_inputs(2)),
            FlowDecision::Wait(Duration::from_millis(100))
        );
        assert_eq!(
            flow.on_compressor_throttled(t0 + Duration::from_millis(40), throttled_inputs(2)),
            FlowDecision::Wait(Duration::from_millis(60))
        );
        assert_eq!(
            flow.on_compressor_throttled(t0 + Duration::from_millis(100), throttled_inputs(2)),
            FlowDecision::DeadlockDetected { budget: 5 }
        );
        for _ in 0..5 {
            assert!(flow.consume_forced());
        }
        assert_eq!(flow.state(), FlowState::Idle);
        assert!(!flow.consume_forced());
    }

    #[test]
    fn drain_cancels_delay() {
        let mut flow = FlowControl::new(&PageoutConfig::small());
        flow.on_compressor_throttled(Instant::now(), throttled_inputs(0));
        assert_eq!(flow.state().phase(), FlowPhase::Delayed);
        flow.observe(true);
        assert_eq!(flow.state().phase(), FlowPhase::Delayed);
        flow.observe(false);
        assert_eq!(flow.state(), FlowState::Idle);
    }

    #[test]
    fn paging_disabled_never_blocks() {
        let mut flow = FlowControl::new(&PageoutConfig::small());
        let inputs = FlowInputs {
            dynamic_paging: false,
            ..throttled_inputs(0)
        };
        assert_eq!(flow.on_compressor_throttled(Instant::now(), inputs), FlowDecision::Proceed);
    }
}
