#![allow(missing_docs)]

use tracing::{debug, error, trace, warn};

use crate::config::PageoutConfig;
use crate::pageout::stats::PageoutStats;
use crate::types::{ObjectId, PageIdx, ReclaimError, Result};
use crate::vm::{LaundryKind, PageQueues, PageState, QueueId};

/// Scan-loop-local hints shared by the selector and the decision engine.
#[derive(Debug, Clone, Default)]
pub struct ScanHints {
    /// Anonymous picks since the last file-backed pick.
    pub consecutive_anon: u32,
    /// Picks made while the file-backed pool sat below its floor.
    pub filecache_tick: u32,
    /// Sticky: the write-back queue is throttled, take anonymous pages only.
    pub force_anonymous: bool,
    /// Set by a flow-control deferral: lean toward file-backed pages.
    pub prefer_file: bool,
    /// Object whose lock was contended last; tried harder next time.
    pub wanted_object: Option<ObjectId>,
    /// The background queue's head object was contended.
    pub background_blocked: bool,
    /// Referenced pages reactivated in the current pass.
    pub reactivated: u32,
    /// Throttled file-backed picks left before one is reactivated outright.
    pub external_forced_left: u32,
}

impl ScanHints {
    pub fn new(cfg: &PageoutConfig) -> Self {
        Self {
            external_forced_left: cfg.external_forced_reactivate_limit,
            ..Self::default()
        }
    }

    /// Drops hints whose cause has gone away.
    pub fn refresh(&mut self, queues: &PageQueues) {
        if self.force_anonymous && !queues.laundry(LaundryKind::External).is_throttled() {
            debug!("pageout.select.force_anonymous_cleared");
            self.force_anonymous = false;
        }
        if self.prefer_file && !queues.laundry(LaundryKind::Compressor).is_throttled() {
            self.prefer_file = false;
        }
    }

    /// Start of a new pass.
    pub fn begin_pass(&mut self) {
        self.reactivated = 0;
        self.background_blocked = false;
    }
}

/// A reclamation candidate; the page stays linked on `source`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Victim {
    pub idx: PageIdx,
    pub source: QueueId,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Pool {
    Anonymous,
    FileBacked,
}

/// Picks the next candidate, or `None` when nothing is reclaimable.
///
/// When every source looks empty while the counters say otherwise, the
/// counters are rebuilt and the pick retried once. A second miss is an
/// invariant violation.
pub fn select_victim(
    queues: &mut PageQueues,
    cfg: &PageoutConfig,
    hints: &mut ScanHints,
    stats: &PageoutStats,
) -> Result<Option<Victim>> {
    if let Some(victim) = pick(queues, cfg, hints, stats) {
        return Ok(Some(victim));
    }
    if counters_disagree(queues) {
        warn!(counts = ?queues.counts(), "pageout.select.counter_drift");
        queues.recount();
        if let Some(victim) = pick(queues, cfg, hints, stats) {
            return Ok(Some(victim));
        }
        if counters_disagree(queues) {
            let counts = queues.counts();
            error!(?counts, "pageout.select.invariant_violation");
            debug_assert!(false, "victim selector found nothing despite counters {counts:?}");
            return Err(ReclaimError::InvariantViolation(format!(
                "no victim found with non-zero counters {counts:?}"
            )));
        }
    }
    Ok(None)
}

fn pick(
    queues: &mut PageQueues,
    cfg: &PageoutConfig,
    hints: &mut ScanHints,
    stats: &PageoutStats,
) -> Option<Victim> {
    if let Some(v) = head(queues, QueueId::Cleaned) {
        return Some(v);
    }
    if let Some(v) = head(queues, QueueId::SpeculativeAged) {
        let dirty = queues.page(v.idx).map(|p| p.dirty).unwrap_or(false);
        if !(hints.force_anonymous && dirty) {
            return Some(v);
        }
    }
    let counts = queues.counts();
    if counts.donate > cfg.donate_target {
        if let Some(v) = head(queues, QueueId::Donate) {
            return Some(v);
        }
    }
    if counts.background > cfg.background_target && !hints.background_blocked {
        if let Some(v) = head(queues, QueueId::Background) {
            return Some(v);
        }
    }

    let pool = choose_pool(queues, cfg, hints, stats);
    let (first, second) = match pool {
        Pool::Anonymous => (QueueId::InactiveInternal, QueueId::InactiveExternal),
        Pool::FileBacked => (QueueId::InactiveExternal, QueueId::InactiveInternal),
    };
    let victim = head(queues, first).or_else(|| head(queues, second));
    if let Some(v) = victim {
        if v.source == QueueId::InactiveInternal {
            hints.consecutive_anon += 1;
        } else {
            hints.consecutive_anon = 0;
        }
        return Some(v);
    }

    // Last resort: queues skipped above still hold pages.
    [QueueId::Donate, QueueId::Background, QueueId::SpeculativeAged]
        .into_iter()
        .filter(|&q| q != QueueId::Background || !hints.background_blocked)
        .find_map(|q| head(queues, q))
}

fn choose_pool(
    queues: &mut PageQueues,
    cfg: &PageoutConfig,
    hints: &mut ScanHints,
    stats: &PageoutStats,
) -> Pool {
    let counts = queues.counts();
    let anon_inactive = counts.inactive_internal;
    let file_inactive = counts.inactive_external;
    let below_floor = counts.external_pageable < cfg.filecache_floor();

    if below_floor && file_inactive > 0 && anon_inactive > 0 {
        hints.filecache_tick += 1;
        if hints.filecache_tick >= cfg.filecache_reactivate_interval {
            hints.filecache_tick = 0;
            // Busy holds and pending fills stay where they are.
            let resident = queues.iter(QueueId::InactiveExternal).find(|&idx| {
                queues
                    .page(idx)
                    .map_or(false, |p| p.state() == PageState::Resident)
            });
            if let Some(idx) = resident {
                // Keeps the protected file cache circulating.
                queues.activate(idx);
                PageoutStats::bump(&stats.filecache_reactivated);
                trace!(page = %idx, "pageout.select.filecache_reactivate");
            }
        }
    }

    let anon_eligible = anon_inactive > cfg.anonymous_min;
    let hard = below_floor || hints.force_anonymous;
    if hard && anon_eligible {
        return Pool::Anonymous;
    }

    let file_target = u64::from(queues.inactive_target())
        * u64::from(cfg.file_inactive_target_percent)
        / 100;
    let soft = !hints.prefer_file && u64::from(file_inactive) < file_target;
    if soft && anon_eligible {
        if hints.consecutive_anon >= cfg.anonymous_pick_limit && file_inactive > 0 {
            trace!(picks = hints.consecutive_anon, "pageout.select.fairness_file_pick");
            return Pool::FileBacked;
        }
        return Pool::Anonymous;
    }
    Pool::FileBacked
}

fn head(queues: &PageQueues, source: QueueId) -> Option<Victim> {
    queues.head(source).map(|idx| Victim { idx, source })
}

/// A consulted source reports pages in its counter but has no head.
fn counters_disagree(queues: &PageQueues) -> bool {
    let counts = queues.counts();
    [
        (counts.cleaned, QueueId::Cleaned),
        (counts.inactive_internal, QueueId::InactiveInternal),
        (counts.inactive_external, QueueId::InactiveExternal),
        (counts.donate, QueueId::Donate),
        (counts.speculative_aged, QueueId::SpeculativeAged),
    ]
    .into_iter()
    .any(|(claimed, q)| claimed > 0 && queues.head(q).is_none())
}
