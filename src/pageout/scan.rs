#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace};

use crate::config::PageoutConfig;
use crate::types::Result;
use crate::vm::LaundryKind;

use super::balance::balance;
use super::flow::{FlowControl, FlowDecision, FlowInputs};
use super::reclaim::{reclaim, Decision, FreeBatch, ReclaimContext};
use super::select::{select_victim, ScanHints};
use super::stats::PageoutStats;
use super::Shared;

/// Why the scan loop paused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitReason {
    /// No reclaim source had a candidate.
    Empty,
    /// Too many iterations without progress.
    Burst,
    /// The compression queue is throttled.
    Throttled,
}

/// Result of one scan pass.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScanOutcome {
    /// Free pages reached the target and nobody is waiting.
    TargetMet,
    /// The scan thread should sleep for at most `duration`.
    Wait { reason: WaitReason, duration: Duration },
    Stopped,
}

/// State private to the scan loop; resets when the free target is met.
pub(crate) struct ScanState {
    pub(crate) hints: ScanHints,
    pub(crate) flow: FlowControl,
    pub(crate) batch: FreeBatch,
}

impl ScanState {
    pub(crate) fn new(cfg: &PageoutConfig) -> Self {
        Self {
            hints: ScanHints::new(cfg),
            flow: FlowControl::new(cfg),
            batch: FreeBatch::new(),
        }
    }
}

/// Runs the scan loop until the free target is met or flow control asks
/// the thread to block.
pub(crate) fn scan_pass(shared: &Shared, now: Instant) -> Result<ScanOutcome> {
    let cfg = &shared.cfg;
    let mut scan = shared.scan.lock();
    let ScanState { hints, flow, batch } = &mut *scan;
    hints.begin_pass();
    PageoutStats::bump(&shared.stats.scan_passes);
    let mut stalled = 0u32;

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            shared.flush_free(batch);
            return Ok(ScanOutcome::Stopped);
        }
        let free = shared.free.count() + batch.len() as u32;
        if free >= cfg.free_target && shared.free.waiters() == 0 {
            shared.flush_free(batch);
            flow.reset();
            debug!(free, "pageout.scan.target_met");
            return Ok(ScanOutcome::TargetMet);
        }

        let mut queues = shared.queues.lock();
        queues.age_speculative(now);
        hints.refresh(&queues);
        let compressor_throttled = queues.laundry(LaundryKind::Compressor).is_throttled();
        flow.observe(compressor_throttled);

        let moved = balance(&mut queues, shared.pmap.as_ref(), cfg.balance_budget);
        PageoutStats::add(&shared.stats.deactivated, u64::from(moved));

        if compressor_throttled && !flow.forced_reclaim_available() {
            let counts = queues.counts();
            let inputs = FlowInputs {
                dynamic_paging: cfg.dynamic_paging,
                free_healthy: free >= cfg.free_min,
                filecache_pressure_low: counts.external_pageable > cfg.filecache_floor()
                    && counts.inactive_external > 0,
                waiters: shared.free.waiters(),
            };
            match flow.on_compressor_throttled(now, inputs) {
                FlowDecision::Proceed => {}
                FlowDecision::Defer => hints.prefer_file = true,
                FlowDecision::Wait(duration) => {
                    drop(queues);
                    shared.flush_free(batch);
                    return Ok(ScanOutcome::Wait {
                        reason: WaitReason::Throttled,
                        duration,
                    });
                }
                FlowDecision::DeadlockDetected { budget } => {
                    PageoutStats::bump(&shared.stats.deadlocks);
                    info!(budget, "pageout.scan.wake_gc");
                    shared.gc_bell.ring();
                }
            }
        }

        let Some(victim) = select_victim(&mut queues, cfg, hints, &shared.stats)? else {
            drop(queues);
            shared.flush_free(batch);
            trace!("pageout.scan.sources_empty");
            return Ok(ScanOutcome::Wait {
                reason: WaitReason::Empty,
                duration: flow.on_empty(),
            });
        };

        let mut ctx = ReclaimContext {
            cfg,
            pmap: shared.pmap.as_ref(),
            stats: &shared.stats,
            hints: &mut *hints,
            flow: &mut *flow,
            free_batch: &mut *batch,
        };
        let decision = reclaim(&mut queues, victim, &mut ctx)?;
        drop(queues);

        let progressed = match decision {
            Decision::Laundered(kind) => {
                shared.bell_for(kind).ring();
                true
            }
            Decision::DivertedToThrottled => true,
            other => other.freed(),
        };
        if progressed {
            stalled = 0;
        } else {
            stalled += 1;
        }

        if batch.len() >= cfg.free_batch_flush || shared.free.count() < cfg.free_reserved {
            shared.flush_free(batch);
        }
        if stalled >= cfg.burst_limit {
            shared.flush_free(batch);
            trace!(stalled, "pageout.scan.burst_limit");
            return Ok(ScanOutcome::Wait {
                reason: WaitReason::Burst,
                duration: flow.on_burst(),
            });
        }
    }
}

/// Body of the scan thread.
pub(crate) fn scan_thread(shared: Arc<Shared>) {
    debug!("pageout.scan.thread_start");
    while !shared.shutdown.load(Ordering::Acquire) {
        let pause = match scan_pass(&shared, Instant::now()) {
            Ok(ScanOutcome::Stopped) => break,
            Ok(ScanOutcome::TargetMet) => shared.cfg.worker_idle(),
            Ok(ScanOutcome::Wait { duration, .. }) => duration,
            Err(err) => {
                error!(error = %err, "pageout.scan.pass_failed");
                shared.scan.lock().hints = ScanHints::new(&shared.cfg);
                shared.cfg.empty_wait()
            }
        };
        shared.scan_bell.wait_timeout(pause);
    }
    debug!("pageout.scan.thread_exit");
}
