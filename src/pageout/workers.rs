//! Laundry workers: the compressor pool, the external write-back thread and
//! the garbage-collection helper.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::primitives::hal::{IoTier, PhysPage};
use crate::types::{PageIdx, PagerHandle, ReclaimError, Result};
use crate::vm::{LaundryKind, PageState, QueueId, VmObject};

use super::reclaim::{detach, FreeBatch};
use super::stats::PageoutStats;
use super::Shared;

/// Identity of an in-flight page, captured under the queue lock.
struct InFlight {
    idx: PageIdx,
    object: Option<Arc<VmObject>>,
    offset: u64,
}

fn in_flight(shared: &Shared, idx: PageIdx) -> Option<InFlight> {
    let queues = shared.queues.lock();
    let page = queues.page(idx).ok()?;
    if page.state() != PageState::Cleaning {
        return None;
    }
    Some(InFlight {
        idx,
        object: page.upgrade_object(),
        offset: page.offset(),
    })
}

/// Frees an in-flight page whose object is gone.
fn free_orphan(shared: &Shared, idx: PageIdx, freed: &mut FreeBatch) {
    let mut queues = shared.queues.lock();
    let still_orphan = queues
        .page(idx)
        .map(|p| p.state() == PageState::Cleaning && p.upgrade_object().is_none())
        .unwrap_or(false);
    if still_orphan {
        drop(queues.release_page(idx));
        freed.push(idx);
        PageoutStats::bump(&shared.stats.freed);
    }
}

/// Drains one batch from the compression queue. Returns the number of
/// pages taken off the queue.
pub(crate) fn drain_compressor(shared: &Shared, scratch: &mut [u8]) -> usize {
    let cfg = &shared.cfg;
    let batch = {
        let mut queues = shared.queues.lock();
        let depth = queues.laundry(LaundryKind::Compressor).depth() as usize;
        if depth == 0 {
            return 0;
        }
        // Spread the backlog evenly over the pool.
        let size = (depth / cfg.compressor_threads.max(1)).clamp(1, cfg.compressor_batch.max(1));
        queues.dequeue_laundry_batch(LaundryKind::Compressor, size)
    };

    let mut freed = FreeBatch::new();
    for &idx in &batch {
        compress_one(shared, idx, scratch, &mut freed);
        if freed.len() >= cfg.free_batch_flush || shared.free.count() < cfg.free_reserved {
            shared.flush_free(&mut freed);
        }
    }
    shared.flush_free(&mut freed);

    let (released, backlog) = {
        let mut queues = shared.queues.lock();
        let released = queues.laundry_mut(LaundryKind::Compressor).release_throttle();
        (released, queues.laundry(LaundryKind::Compressor).depth() as usize)
    };
    debug!(pages = batch.len(), backlog, released, "pageout.compressor.batch");
    shared.scan_bell.ring();
    if backlog > cfg.compressor_batch {
        shared.compressor_bell.ring();
    }
    batch.len()
}

fn compress_one(shared: &Shared, idx: PageIdx, scratch: &mut [u8], freed: &mut FreeBatch) {
    let Some(flight) = in_flight(shared, idx) else {
        return;
    };
    let Some(object) = flight.object else {
        free_orphan(shared, idx, freed);
        return;
    };
    // Object lock first; the queue lock is never held while waiting for it.
    let mut guard = object.acquire();
    {
        let queues = shared.queues.lock();
        let same = queues
            .page(idx)
            .map(|p| p.state() == PageState::Cleaning && p.object_id() == Some(object.id()))
            .unwrap_or(false);
        if !same {
            trace!(page = %idx, "pageout.compressor.raced");
            return;
        }
    }

    let phys = PhysPage {
        page: idx,
        object: object.id(),
        offset: flight.offset,
    };
    let result = shared.compressor.compress(phys, scratch);

    let mut queues = shared.queues.lock();
    match result {
        Ok(compressed) => {
            detach(&mut guard, flight.offset, flight.idx);
            drop(queues.release_page(idx));
            freed.push(idx);
            PageoutStats::bump(&shared.stats.compressed);
            PageoutStats::bump(&shared.stats.freed);
            trace!(page = %idx, delta = compressed.byte_delta, "pageout.compressor.page");
        }
        Err(err) => {
            PageoutStats::bump(&shared.stats.compress_failed);
            let free_when_done = queues.page(idx).map(|p| p.free_when_done).unwrap_or(false);
            if free_when_done {
                detach(&mut guard, flight.offset, flight.idx);
                drop(queues.release_page(idx));
                freed.push(idx);
                PageoutStats::bump(&shared.stats.freed);
            } else {
                drop(queues.finish_cleaning(idx, LaundryKind::Compressor, QueueId::Active));
                PageoutStats::bump(&shared.stats.reactivated);
            }
            warn!(page = %idx, error = %err, "pageout.compressor.failed");
        }
    }
}

/// Body of one compressor thread; owns its scratch buffer.
pub(crate) fn compressor_thread(shared: Arc<Shared>, id: usize) {
    let mut scratch = vec![0u8; shared.cfg.page_size];
    debug!(id, "pageout.compressor.thread_start");
    while !shared.shutdown.load(Ordering::Acquire) {
        if drain_compressor(&shared, &mut scratch) == 0 {
            shared.compressor_bell.wait_timeout(shared.cfg.worker_idle());
        }
    }
    debug!(id, "pageout.compressor.thread_exit");
}

/// Takes one page off the write-back queue and hands it to its pager.
/// Returns false when the queue was empty.
pub(crate) fn drain_external_once(shared: &Shared) -> bool {
    let idx = {
        let mut queues = shared.queues.lock();
        let Some(idx) = queues.dequeue_laundry_batch(LaundryKind::External, 1).pop() else {
            return false;
        };
        if queues.laundry_mut(LaundryKind::External).release_throttle() {
            shared.scan_bell.ring();
        }
        idx
    };
    let mut freed = FreeBatch::new();
    write_back_one(shared, idx, &mut freed);
    shared.flush_free(&mut freed);
    true
}

fn write_back_one(shared: &Shared, idx: PageIdx, freed: &mut FreeBatch) {
    let Some(flight) = in_flight(shared, idx) else {
        return;
    };
    let Some(object) = flight.object else {
        free_orphan(shared, idx, freed);
        return;
    };
    let mut guard = object.acquire();
    let pager: PagerHandle = {
        let mut queues = shared.queues.lock();
        let Ok(page) = queues.page(idx) else {
            return;
        };
        if page.state() != PageState::Cleaning || page.object_id() != Some(object.id()) {
            trace!(page = %idx, "pageout.external.raced");
            return;
        }
        let free_when_done = page.free_when_done;
        let (pager, alive) = (guard.pager, guard.alive);
        match pager {
            Some(pager) if alive => pager,
            _ => {
                // The pager went away while the page sat in the queue.
                if free_when_done || !alive {
                    detach(&mut guard, flight.offset, idx);
                    drop(queues.release_page(idx));
                    freed.push(idx);
                    PageoutStats::bump(&shared.stats.freed);
                } else {
                    drop(queues.finish_cleaning(idx, LaundryKind::External, QueueId::Active));
                    PageoutStats::bump(&shared.stats.reactivated);
                }
                debug!(page = %idx, "pageout.external.pager_gone");
                return;
            }
        }
    };
    drop(guard);

    let tier = if shared.free.count() >= shared.cfg.free_target {
        IoTier::Background
    } else {
        IoTier::Foreground
    };
    let previous = std::mem::replace(&mut *shared.io_tier.lock(), tier);
    if previous != tier {
        info!(?previous, ?tier, "pageout.external.io_tier");
    }
    PageoutStats::bump(&shared.stats.write_backs);
    shared.pager.write_back(pager, flight.offset, idx, tier);
}

/// Body of the external write-back thread.
pub(crate) fn external_thread(shared: Arc<Shared>) {
    debug!("pageout.external.thread_start");
    while !shared.shutdown.load(Ordering::Acquire) {
        if !drain_external_once(&shared) {
            shared.external_bell.wait_timeout(shared.cfg.worker_idle());
        }
    }
    debug!("pageout.external.thread_exit");
}

/// Completes a write-back issued by the external worker.
pub(crate) fn complete_write_back(shared: &Shared, idx: PageIdx, ok: bool) -> Result<()> {
    let flight = {
        let queues = shared.queues.lock();
        let page = queues.page(idx)?;
        if page.state() != PageState::Cleaning || page.is_internal() {
            return Err(ReclaimError::Invalid("page has no write-back in flight"));
        }
        InFlight {
            idx,
            object: page.upgrade_object(),
            offset: page.offset(),
        }
    };
    let mut freed = FreeBatch::new();
    match flight.object {
        None => free_orphan(shared, idx, &mut freed),
        Some(object) => {
            let mut guard = object.acquire();
            let mut queues = shared.queues.lock();
            let page = queues.page_mut(idx)?;
            if page.state() != PageState::Cleaning || page.object_id() != Some(object.id()) {
                return Err(ReclaimError::Invalid("page changed while write-back was in flight"));
            }
            if ok {
                page.dirty = false;
                if page.free_when_done {
                    detach(&mut guard, flight.offset, idx);
                    drop(queues.release_page(idx));
                    freed.push(idx);
                    PageoutStats::bump(&shared.stats.freed);
                } else {
                    shared.pmap.clear_reference_modify(idx);
                    drop(queues.finish_cleaning(idx, LaundryKind::External, QueueId::Cleaned));
                }
            } else {
                drop(queues.finish_cleaning(idx, LaundryKind::External, QueueId::Active));
                PageoutStats::bump(&shared.stats.write_back_errors);
                PageoutStats::bump(&shared.stats.reactivated);
                warn!(page = %idx, "pageout.external.write_back_failed");
            }
        }
    }
    shared.flush_free(&mut freed);
    shared.scan_bell.ring();
    Ok(())
}

/// Runs every live GC hook once; returns the pages they reported.
pub(crate) fn run_gc_hooks(shared: &Shared) -> u64 {
    let hooks: Vec<_> = {
        let mut hooks = shared.gc_hooks.lock();
        hooks.retain(|hook| hook.strong_count() > 0);
        hooks.iter().filter_map(|hook| hook.upgrade()).collect()
    };
    let level = shared.pressure.level();
    let pages: u64 = hooks.iter().map(|hook| hook.collect(level)).sum();
    PageoutStats::add(&shared.stats.gc_pages, pages);
    if pages > 0 {
        info!(pages, hooks = hooks.len(), ?level, "pageout.gc.collected");
    }
    pages
}

/// Body of the garbage-collection helper.
pub(crate) fn gc_thread(shared: Arc<Shared>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        if shared.gc_bell.wait_timeout(shared.cfg.worker_idle()) {
            run_gc_hooks(&shared);
        }
    }
}

/// Body of the pressure-notifier thread; also closes statistics intervals.
pub(crate) fn pressure_thread(shared: Arc<Shared>) {
    let mut last_roll = std::time::Instant::now();
    while !shared.shutdown.load(Ordering::Acquire) {
        shared.publish_pressure();
        if shared.free.count() < shared.cfg.free_target {
            shared.scan_bell.ring();
        }
        if last_roll.elapsed() >= shared.cfg.stats_interval() {
            last_roll = std::time::Instant::now();
            shared.roll_stats(last_roll);
        }
        std::thread::sleep(shared.cfg.pressure_poll());
    }
}
