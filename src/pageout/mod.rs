//! The reclamation engine: scan loop, decision engine, laundry workers and
//! the [`Pageout`] handle owning them.

#![allow(missing_docs)]

pub mod balance;
pub mod flow;
pub mod laundry;
pub mod pressure;
pub mod reclaim;
pub mod scan;
pub mod select;
pub mod stats;
mod workers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::PageoutConfig;
use crate::primitives::concurrency::Doorbell;
use crate::primitives::hal::{Compressor, ExternalPager, GcHook, IoTier, Pmap};
use crate::types::{PageIdx, ReclaimError, Result};
use crate::vm::{
    FreeList, LaundryKind, Page, PageInfo, PageQueues, PageState, Placement, QueueCounts, QueueId,
    VmObject,
};

pub use flow::{FlowPhase, FlowState};
pub use laundry::LaundrySnapshot;
pub use pressure::{PressureLevel, PressureNotifier};
pub use reclaim::Decision;
pub use scan::{ScanOutcome, WaitReason};
pub use stats::{PageoutStatsSnapshot, StatsSample};

use reclaim::{detach, FreeBatch, ReclaimContext};
use scan::ScanState;
use select::Victim;
use stats::{PageoutStats, StatsRing};

/// State shared by the handle and every pageout thread.
///
/// Lock order: `scan`, then an object lock, then `queues`. An object lock
/// may only be try-locked while `queues` is held. `free` is never held while
/// taking any other lock.
pub(crate) struct Shared {
    pub(crate) cfg: PageoutConfig,
    pub(crate) queues: Mutex<PageQueues>,
    pub(crate) free: FreeList,
    pub(crate) pmap: Arc<dyn Pmap>,
    pub(crate) compressor: Arc<dyn Compressor>,
    pub(crate) pager: Arc<dyn ExternalPager>,
    pub(crate) gc_hooks: Mutex<Vec<Weak<dyn GcHook>>>,
    pub(crate) scan: Mutex<ScanState>,
    pub(crate) scan_bell: Doorbell,
    pub(crate) compressor_bell: Doorbell,
    pub(crate) external_bell: Doorbell,
    pub(crate) gc_bell: Doorbell,
    pub(crate) stats: PageoutStats,
    pub(crate) ring: Mutex<StatsRing>,
    pub(crate) pressure: PressureNotifier,
    pub(crate) io_tier: Mutex<IoTier>,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn bell_for(&self, kind: LaundryKind) -> &Doorbell {
        match kind {
            LaundryKind::Compressor => &self.compressor_bell,
            LaundryKind::External => &self.external_bell,
        }
    }

    /// Hands freed pages to the free list and wakes blocked allocators.
    pub(crate) fn flush_free(&self, batch: &mut FreeBatch) {
        if batch.is_empty() {
            return;
        }
        self.free.release_batch(batch);
        trace!(pages = batch.len(), free = self.free.count(), "pageout.free.flush");
        batch.clear();
        self.publish_pressure();
    }

    pub(crate) fn publish_pressure(&self) {
        if let Some(PressureLevel::Critical) = self.pressure.update(self.free.count(), &self.cfg) {
            self.gc_bell.ring();
        }
    }

    pub(crate) fn roll_stats(&self, now: Instant) -> StatsSample {
        let (compressor_depth, external_depth) = {
            let queues = self.queues.lock();
            (
                queues.laundry(LaundryKind::Compressor).depth(),
                queues.laundry(LaundryKind::External).depth(),
            )
        };
        self.ring.lock().roll(
            now,
            self.stats.snapshot(),
            compressor_depth,
            external_depth,
            self.free.count(),
        )
    }
}

/// Handle to the reclamation subsystem.
///
/// Created idle; [`Pageout::start`] spawns the scan thread, the compressor
/// pool, the external worker, the pressure notifier and the GC helper. Every
/// step those threads take is also available synchronously so the engine
/// can be driven by hand.
pub struct Pageout {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Pageout {
    pub fn new(
        cfg: PageoutConfig,
        pmap: Arc<dyn Pmap>,
        compressor: Arc<dyn Compressor>,
        pager: Arc<dyn ExternalPager>,
    ) -> Result<Self> {
        cfg.validate()?;
        let now = Instant::now();
        let shared = Shared {
            queues: Mutex::new(PageQueues::new(&cfg)),
            free: FreeList::new(cfg.total_pages),
            pmap,
            compressor,
            pager,
            gc_hooks: Mutex::new(Vec::new()),
            scan: Mutex::new(ScanState::new(&cfg)),
            scan_bell: Doorbell::new(1),
            compressor_bell: Doorbell::new(cfg.compressor_threads),
            external_bell: Doorbell::new(1),
            gc_bell: Doorbell::new(1),
            stats: PageoutStats::default(),
            ring: Mutex::new(StatsRing::new(cfg.stats_ring_len, now)),
            pressure: PressureNotifier::new(),
            io_tier: Mutex::new(IoTier::Background),
            shutdown: AtomicBool::new(false),
            cfg,
        };
        info!(
            total_pages = shared.cfg.total_pages,
            free_target = shared.cfg.free_target,
            compressor_threads = shared.cfg.compressor_threads,
            "pageout.init"
        );
        Ok(Self {
            shared: Arc::new(shared),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PageoutConfig {
        &self.shared.cfg
    }

    /// Spawns the pageout threads.
    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Err(ReclaimError::Invalid("pageout threads already started"));
        }
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(ReclaimError::ShuttingDown);
        }
        let spawn = |name: String, body: Box<dyn FnOnce() + Send>| {
            thread::Builder::new().name(name).spawn(body)
        };
        let shared = Arc::clone(&self.shared);
        threads.push(spawn("pageout-scan".into(), Box::new(move || scan::scan_thread(shared)))?);
        for id in 0..self.shared.cfg.compressor_threads {
            let shared = Arc::clone(&self.shared);
            threads.push(spawn(
                format!("pageout-compressor-{id}"),
                Box::new(move || workers::compressor_thread(shared, id)),
            )?);
        }
        let shared = Arc::clone(&self.shared);
        threads.push(spawn(
            "pageout-external".into(),
            Box::new(move || workers::external_thread(shared)),
        )?);
        let shared = Arc::clone(&self.shared);
        threads.push(spawn(
            "pageout-pressure".into(),
            Box::new(move || workers::pressure_thread(shared)),
        )?);
        let shared = Arc::clone(&self.shared);
        threads.push(spawn("pageout-gc".into(), Box::new(move || workers::gc_thread(shared)))?);
        info!(threads = threads.len(), "pageout.start");
        Ok(())
    }

    /// Stops and joins every pageout thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = &self.shared;
        shared.scan_bell.ring();
        shared.compressor_bell.ring_many(shared.cfg.compressor_threads);
        shared.external_bell.ring();
        shared.gc_bell.ring();
        shared.free.wake_all();
        shared.pressure.wake_all();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                warn!(thread = ?name, "pageout.shutdown.thread_panicked");
            }
        }
        info!("pageout.shutdown");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Allocates a page for `object` at `offset` and links it per
    /// `placement`. Blocks while no page is free, waking the scan thread.
    pub fn allocate(
        &self,
        object: &Arc<VmObject>,
        offset: u64,
        placement: Placement,
    ) -> Result<PageIdx> {
        self.allocate_timeout(object, offset, placement, self.shared.cfg.alloc_wait())
    }

    pub fn allocate_timeout(
        &self,
        object: &Arc<VmObject>,
        offset: u64,
        placement: Placement,
        timeout: Duration,
    ) -> Result<PageIdx> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Acquire) {
            return Err(ReclaimError::ShuttingDown);
        }
        let idx = match shared.free.try_grab() {
            Some(idx) => idx,
            None => shared.free.grab_blocking(timeout, &shared.shutdown, || {
                shared.scan_bell.ring();
            })?,
        };
        if shared.free.count() < shared.cfg.free_target {
            shared.scan_bell.ring();
        }
        shared.publish_pressure();

        let mut guard = object.acquire();
        if guard.resident.contains_key(&offset) {
            drop(guard);
            shared.free.release_batch(&[idx]);
            return Err(ReclaimError::Invalid("offset already has a resident page"));
        }
        let mut queues = shared.queues.lock();
        if let Err(err) = queues.place_new(idx, object, offset, placement, Instant::now()) {
            drop(queues);
            drop(guard);
            shared.free.release_batch(&[idx]);
            return Err(err);
        }
        guard.resident.insert(offset, idx);
        trace!(page = %idx, object = %object.id(), offset, ?placement, "pageout.alloc");
        Ok(idx)
    }

    /// Returns a page to the free list on behalf of its owner.
    ///
    /// A page whose laundry is in flight is marked free-when-done instead and
    /// freed by the worker that finishes it.
    pub fn free_page(&self, idx: PageIdx) -> Result<()> {
        let shared = &self.shared;
        let object = {
            let queues = shared.queues.lock();
            let page = queues.page(idx)?;
            match page.state() {
                PageState::Free => return Err(ReclaimError::Invalid("page is already free")),
                PageState::Wired => return Err(ReclaimError::Invalid("page is wired")),
                _ => page.upgrade_object(),
            }
        };
        let mut guard = object.as_ref().map(|obj| obj.acquire());
        let mut queues = shared.queues.lock();
        let page = queues.page_mut(idx)?;
        if page.object_id() != object.as_ref().map(|obj| obj.id()) {
            return Err(ReclaimError::Invalid("page changed owner"));
        }
        match page.state() {
            PageState::Free => return Err(ReclaimError::Invalid("page is already free")),
            PageState::Wired => return Err(ReclaimError::Invalid("page is wired")),
            PageState::Cleaning => {
                page.free_when_done = true;
                return Ok(());
            }
            _ => {}
        }
        let offset = page.offset();
        if let Some(guard) = guard.as_mut() {
            detach(guard, offset, idx);
        }
        shared.pmap.disconnect(idx);
        drop(queues.release_page(idx));
        drop(queues);
        drop(guard);
        shared.free.release_batch(&[idx]);
        shared.publish_pressure();
        Ok(())
    }

    /// Records an access to the page, as a fault hit would.
    pub fn touch(&self, idx: PageIdx, write: bool) -> Result<()> {
        let mut queues = self.shared.queues.lock();
        let page = queues.page_mut(idx)?;
        if matches!(page.state(), PageState::Free) {
            return Err(ReclaimError::Invalid("cannot touch a free page"));
        }
        page.reference = true;
        page.pmapped = true;
        if write {
            page.dirty = true;
        }
        let queue = page.queue();
        // Read-ahead pages earn their place on first use.
        if queue.is_speculative() {
            queues.activate(idx);
        } else if let QueueId::Laundry(kind) = queue {
            // Not picked up by a worker yet: the fault wins over the pageout.
            let pin = queues.pull_from_laundry(idx);
            drop(queues);
            drop(pin);
            PageoutStats::bump(&self.shared.stats.reactivated);
            trace!(page = %idx, ?kind, "pageout.touch.pulled_from_laundry");
        }
        Ok(())
    }

    pub fn set_dirty(&self, idx: PageIdx, dirty: bool) -> Result<()> {
        self.update_owned(idx, |page| page.dirty = dirty)
    }

    pub fn set_precious(&self, idx: PageIdx, precious: bool) -> Result<()> {
        self.update_owned(idx, |page| page.precious = precious)
    }

    /// Marks a shared-cache or real-time page for the extended reactivation limit.
    pub fn set_important(&self, idx: PageIdx, important: bool) -> Result<()> {
        self.update_owned(idx, |page| page.important = important)
    }

    /// Marks a guard page; the balancer leaves it on the active queue.
    pub fn set_guard(&self, idx: PageIdx, guard: bool) -> Result<()> {
        self.update_owned(idx, |page| page.guard = guard)
    }

    /// A page read with a no-cache hint is not reactivated by a reference.
    pub fn set_no_cache(&self, idx: PageIdx, no_cache: bool) -> Result<()> {
        self.update_owned(idx, |page| page.no_cache = no_cache)
    }

    fn update_owned(&self, idx: PageIdx, f: impl FnOnce(&mut Page)) -> Result<()> {
        let mut queues = self.shared.queues.lock();
        let page = queues.page_mut(idx)?;
        if page.state() == PageState::Free {
            return Err(ReclaimError::Invalid("page is free"));
        }
        f(page);
        Ok(())
    }

    /// Takes or releases the short-term busy state of a resident page.
    pub fn set_busy(&self, idx: PageIdx, busy: bool) -> Result<()> {
        let mut queues = self.shared.queues.lock();
        let (from, to) = if busy {
            (PageState::Resident, PageState::Busy)
        } else {
            (PageState::Busy, PageState::Resident)
        };
        if queues.page(idx)?.state() != from {
            return Err(ReclaimError::Invalid("page is not in the expected busy state"));
        }
        queues.set_state(idx, to);
        Ok(())
    }

    /// Finishes the fill of a page allocated [`Placement::Absent`].
    pub fn fill_complete(&self, idx: PageIdx, ok: bool) -> Result<()> {
        let mut queues = self.shared.queues.lock();
        let page = queues.page_mut(idx)?;
        if page.state() != PageState::Absent || !page.fill_pending {
            return Err(ReclaimError::Invalid("page has no fill in flight"));
        }
        page.fill_pending = false;
        if ok {
            queues.set_state(idx, PageState::Resident);
            queues.activate(idx);
        } else {
            // Stays inactive; the scan loop frees it.
            queues.set_state(idx, PageState::Error);
        }
        Ok(())
    }

    /// Gives up a fill without data. The page stays an absent placeholder
    /// until the scan loop frees it.
    pub fn abandon_fill(&self, idx: PageIdx) -> Result<()> {
        let mut queues = self.shared.queues.lock();
        let page = queues.page_mut(idx)?;
        if page.state() != PageState::Absent || !page.fill_pending {
            return Err(ReclaimError::Invalid("page has no fill in flight"));
        }
        page.fill_pending = false;
        Ok(())
    }

    pub fn wire(&self, idx: PageIdx) -> Result<()> {
        self.shared.queues.lock().wire(idx)
    }

    pub fn unwire(&self, idx: PageIdx) -> Result<()> {
        self.shared.queues.lock().unwire(idx)
    }

    /// Runs the decision engine on one specific page, as a producer that has
    /// identified a reclaimable page would.
    pub fn reclaim_now(&self, idx: PageIdx) -> Result<Decision> {
        let shared = &self.shared;
        let mut scan = shared.scan.lock();
        let ScanState { hints, flow, batch } = &mut *scan;
        let mut queues = shared.queues.lock();
        let page = queues.page(idx)?;
        let source = page.queue();
        if page.laundry() || matches!(source, QueueId::Laundry(_)) {
            return Err(ReclaimError::Invalid("page is already on a laundry queue"));
        }
        if matches!(source, QueueId::None | QueueId::Free | QueueId::Wired) {
            return Err(ReclaimError::Invalid("page is not on a reclaimable queue"));
        }
        let mut ctx = ReclaimContext {
            cfg: &shared.cfg,
            pmap: shared.pmap.as_ref(),
            stats: &shared.stats,
            hints: &mut *hints,
            flow: &mut *flow,
            free_batch: &mut *batch,
        };
        let decision = reclaim::reclaim(&mut queues, Victim { idx, source }, &mut ctx)?;
        drop(queues);
        if let Decision::Laundered(kind) = decision {
            shared.bell_for(kind).ring();
        }
        shared.flush_free(batch);
        Ok(decision)
    }

    /// Runs one scan pass now.
    pub fn scan_once(&self) -> Result<ScanOutcome> {
        scan::scan_pass(&self.shared, Instant::now())
    }

    /// Runs one scan pass with an explicit clock reading.
    pub fn scan_at(&self, now: Instant) -> Result<ScanOutcome> {
        scan::scan_pass(&self.shared, now)
    }

    /// Drains one compressor batch on the calling thread.
    pub fn drain_compressor_once(&self) -> usize {
        let mut scratch = vec![0u8; self.shared.cfg.page_size];
        workers::drain_compressor(&self.shared, &mut scratch)
    }

    /// Hands one write-back page to its pager on the calling thread.
    pub fn drain_external_once(&self) -> bool {
        workers::drain_external_once(&self.shared)
    }

    /// Reports the end of a write-back issued to the external pager.
    pub fn write_back_complete(&self, idx: PageIdx, ok: bool) -> Result<()> {
        workers::complete_write_back(&self.shared, idx, ok)
    }

    /// Registers a memory owner the GC helper asks for pages when stuck.
    pub fn register_gc_hook(&self, hook: &Arc<dyn GcHook>) {
        self.shared.gc_hooks.lock().push(Arc::downgrade(hook));
    }

    /// Runs every registered GC hook on the calling thread.
    pub fn collect_garbage(&self) -> u64 {
        workers::run_gc_hooks(&self.shared)
    }

    pub fn page_info(&self, idx: PageIdx) -> Result<PageInfo> {
        self.shared.queues.lock().info(idx)
    }

    pub fn queue_len(&self, queue: QueueId) -> u32 {
        let queues = self.shared.queues.lock();
        match queue {
            QueueId::Wired => queues.counts().wired,
            other => queues.len(other),
        }
    }

    pub fn laundry(&self, kind: LaundryKind) -> LaundrySnapshot {
        self.shared.queues.lock().laundry(kind).snapshot()
    }

    pub fn counts(&self) -> QueueCounts {
        self.shared.queues.lock().counts()
    }

    pub fn check_invariants(&self) -> Result<()> {
        self.shared.queues.lock().check_invariants()
    }

    pub fn free_count(&self) -> u32 {
        self.shared.free.count()
    }

    /// Threads blocked in [`Pageout::allocate`].
    pub fn free_waiters(&self) -> u32 {
        self.shared.free.waiters()
    }

    pub fn stats(&self) -> PageoutStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Closes the current statistics interval now.
    pub fn roll_stats(&self) -> StatsSample {
        self.shared.roll_stats(Instant::now())
    }

    pub fn stats_samples(&self) -> Vec<StatsSample> {
        self.shared.ring.lock().samples().copied().collect()
    }

    pub fn stats_json(&self) -> Result<String> {
        self.shared.ring.lock().to_json()
    }

    pub fn pressure_level(&self) -> PressureLevel {
        self.shared.pressure.level()
    }

    /// Blocks until the pressure level differs from `seen` or `timeout` passes.
    pub fn wait_for_pressure_change(&self, seen: PressureLevel, timeout: Duration) -> PressureLevel {
        self.shared.pressure.wait_for_change(seen, timeout)
    }

    pub fn flow_state(&self) -> FlowState {
        self.shared.scan.lock().flow.state()
    }

    /// Priority the external worker reported with its latest write-back.
    pub fn io_tier(&self) -> IoTier {
        *self.shared.io_tier.lock()
    }
}

impl Drop for Pageout {
    fn drop(&mut self) {
        if !self.threads.get_mut().is_empty() {
            self.shutdown();
        } else {
            debug!("pageout.drop_idle");
        }
    }
}
