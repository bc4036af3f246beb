#![allow(missing_docs)]

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::PageoutConfig;
use crate::pageout::flow::FlowControl;
use crate::pageout::select::{ScanHints, Victim};
use crate::pageout::stats::PageoutStats;
use crate::primitives::concurrency::Backoff;
use crate::primitives::hal::Pmap;
use crate::types::{PageIdx, Result};
use crate::vm::{
    LaundryKind, ObjectGuard, ObjectKind, PageQueues, PageState, Purgeable, QueueId, VmObject,
};

/// Pages freed by the scan loop, waiting to be handed to the free list.
pub type FreeBatch = SmallVec<[PageIdx; 32]>;

/// Outcome of one reclaim decision.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Freed,
    /// Freed without write-back because its purgeable object was emptied.
    Purged,
    Reactivated,
    /// Put back on the tail of its queue.
    Requeued,
    /// The object lock was contended; the page was requeued.
    Deferred,
    /// Handed to a laundry queue; the matching worker must be woken.
    Laundered(LaundryKind),
    /// The laundry queue was full; the page was reactivated or requeued.
    Throttled(LaundryKind),
    /// Anonymous paging is off; the page was parked on the throttled queue.
    DivertedToThrottled,
}

impl Decision {
    /// Whether the page left the resident set.
    pub fn freed(self) -> bool {
        matches!(self, Decision::Freed | Decision::Purged)
    }
}

/// Everything the decision engine touches besides the queues.
pub struct ReclaimContext<'a> {
    pub cfg: &'a PageoutConfig,
    pub pmap: &'a dyn Pmap,
    pub stats: &'a PageoutStats,
    pub hints: &'a mut ScanHints,
    pub flow: &'a mut FlowControl,
    pub free_batch: &'a mut FreeBatch,
}

/// Runs the per-page state machine on `victim`.
///
/// Called with the page-queue lock held. The owning object's lock is only
/// ever try-locked here.
pub fn reclaim(queues: &mut PageQueues, victim: Victim, ctx: &mut ReclaimContext<'_>) -> Result<Decision> {
    let idx = victim.idx;
    let Some(object) = queues.page(idx)?.upgrade_object() else {
        trace!(page = %idx, "pageout.reclaim.orphan");
        free(queues, idx, victim.source, None, ctx);
        return Ok(Decision::Freed);
    };

    let Some(mut guard) = try_lock_object(&object, ctx) else {
        ctx.pmap.clear_reference(idx);
        queues.requeue(idx);
        ctx.hints.wanted_object = Some(object.id());
        if victim.source == QueueId::Background {
            ctx.hints.background_blocked = true;
        }
        PageoutStats::bump(&ctx.stats.lock_deferrals);
        trace!(page = %idx, object = %object.id(), "pageout.reclaim.lock_deferred");
        return Ok(Decision::Deferred);
    };
    if ctx.hints.wanted_object == Some(object.id()) {
        ctx.hints.wanted_object = None;
    }

    let page = queues.page(idx)?;
    let (state, kind, offset) = (page.state(), page.kind, page.offset());
    // A fill in flight holds the page like a busy owner does.
    let held = matches!(state, PageState::Busy | PageState::Cleaning) || page.fill_pending;
    if held || page.free_when_done {
        queues.requeue(idx);
        return Ok(Decision::Requeued);
    }

    let pager_gone = kind == ObjectKind::External && guard.pager.is_none();
    if matches!(state, PageState::Absent | PageState::Error) || !guard.alive || pager_gone {
        detach(&mut guard, offset, idx);
        free(queues, idx, victim.source, None, ctx);
        return Ok(Decision::Freed);
    }

    let (purgeable, shadowed) = (guard.purgeable, guard.cow_shadowed);
    match purgeable {
        Purgeable::Empty if !shadowed => {
            detach(&mut guard, offset, idx);
            ctx.pmap.disconnect(idx);
            let stats = ctx.stats;
            free(queues, idx, victim.source, Some(&stats.purged), ctx);
            return Ok(Decision::Purged);
        }
        Purgeable::Volatile if !ctx.cfg.compressor_active => {
            return Ok(reactivate(queues, idx, ctx));
        }
        _ => {}
    }

    let refmod = ctx.pmap.get_reference_modify(idx);
    let page = queues.page_mut(idx)?;
    page.reference |= refmod.referenced;
    page.dirty |= refmod.modified;

    if page.reference && !page.no_cache {
        let limit = if page.important {
            ctx.cfg.important_reactivate_limit
        } else {
            ctx.cfg.reactivate_limit
        };
        if ctx.hints.reactivated < limit {
            ctx.hints.reactivated += 1;
            ctx.pmap.clear_reference(idx);
            return Ok(reactivate(queues, idx, ctx));
        }
        trace!(page = %idx, limit, "pageout.reclaim.reactivate_limit");
    }

    let modified = ctx.pmap.disconnect(idx);
    let page = queues.page_mut(idx)?;
    page.pmapped = false;
    page.dirty |= modified;
    if !page.dirty && !page.precious {
        detach(&mut guard, offset, idx);
        free(queues, idx, victim.source, None, ctx);
        return Ok(Decision::Freed);
    }

    let laundry = LaundryKind::for_kind(kind);
    if kind == ObjectKind::Internal && (!ctx.cfg.dynamic_paging || !ctx.cfg.compressor_active) {
        queues.set_queue(idx, QueueId::Throttled);
        PageoutStats::bump(&ctx.stats.diverted_throttled);
        return Ok(Decision::DivertedToThrottled);
    }

    if queues.laundry(laundry).is_throttled() {
        if ctx.flow.consume_forced() {
            PageoutStats::bump(&ctx.stats.forced_reclaims);
            debug!(page = %idx, ?laundry, "pageout.reclaim.forced");
        } else {
            queues.laundry_mut(laundry).mark_throttled();
            PageoutStats::bump(&ctx.stats.throttle_events);
            return Ok(throttled(queues, idx, laundry, ctx));
        }
    }

    let pin = object.begin_paging();
    drop(guard);
    if queues.enqueue_laundry(idx, laundry, pin).is_err() {
        queues.requeue(idx);
        return Ok(Decision::Requeued);
    }
    PageoutStats::bump(&ctx.stats.laundered);
    trace!(page = %idx, ?laundry, "pageout.reclaim.laundered");
    Ok(Decision::Laundered(laundry))
}

fn try_lock_object<'o>(object: &'o VmObject, ctx: &ReclaimContext<'_>) -> Option<ObjectGuard<'o>> {
    if ctx.hints.wanted_object == Some(object.id()) {
        object.try_acquire_for(ctx.cfg.object_lock_backoff())
    } else {
        object.try_acquire_with(Backoff::new(ctx.cfg.object_lock_retries))
    }
}

fn throttled(queues: &mut PageQueues, idx: PageIdx, laundry: LaundryKind, ctx: &mut ReclaimContext<'_>) -> Decision {
    match laundry {
        LaundryKind::External => {
            ctx.hints.external_forced_left = ctx.hints.external_forced_left.saturating_sub(1);
            if ctx.hints.external_forced_left == 0 {
                // Breaks a suspected filesystem-lock vs. pageout deadlock.
                ctx.hints.external_forced_left = ctx.cfg.external_forced_reactivate_limit;
                debug!(page = %idx, "pageout.reclaim.external_forced_reactivate");
                reactivate(queues, idx, ctx);
            } else {
                ctx.hints.force_anonymous = true;
                queues.requeue(idx);
            }
        }
        LaundryKind::Compressor => {
            reactivate(queues, idx, ctx);
        }
    }
    Decision::Throttled(laundry)
}

fn reactivate(queues: &mut PageQueues, idx: PageIdx, ctx: &ReclaimContext<'_>) -> Decision {
    queues.activate(idx);
    PageoutStats::bump(&ctx.stats.reactivated);
    Decision::Reactivated
}

pub(crate) fn detach(guard: &mut ObjectGuard<'_>, offset: u64, idx: PageIdx) {
    if guard.resident.get(&offset) == Some(&idx) {
        guard.resident.remove(&offset);
    }
}

fn free(
    queues: &mut PageQueues,
    idx: PageIdx,
    source: QueueId,
    extra: Option<&std::sync::atomic::AtomicU64>,
    ctx: &mut ReclaimContext<'_>,
) {
    drop(queues.release_page(idx));
    ctx.free_batch.push(idx);
    PageoutStats::bump(&ctx.stats.freed);
    if source.is_speculative() {
        PageoutStats::bump(&ctx.stats.freed_speculative);
    } else if source == QueueId::Cleaned {
        PageoutStats::bump(&ctx.stats.freed_cleaned);
    }
    if let Some(counter) = extra {
        PageoutStats::bump(counter);
    }
}
