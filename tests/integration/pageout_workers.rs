#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use pageout::primitives::hal::GcHook;
use pageout::primitives::sim::{SimCompressor, SimPager, SimPmap};
use pageout::vm::{LaundryKind, ObjectKind, PageState, Placement, VmObject};
use pageout::{
    ObjectId, Pageout, PageoutConfig, PagerHandle, PressureLevel, ReclaimError, Result,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pageout=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn started(cfg: PageoutConfig) -> Result<(Arc<Pageout>, Arc<SimCompressor>, Arc<SimPager>)> {
    init_tracing();
    let compressor = Arc::new(SimCompressor::new(cfg.page_size));
    let pager = Arc::new(SimPager::new());
    let po = Pageout::new(
        cfg.clone(),
        Arc::new(SimPmap::new(cfg.total_pages)),
        compressor.clone(),
        pager.clone(),
    )?;
    po.start()?;
    Ok((Arc::new(po), compressor, pager))
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn allocators_are_fed_by_the_compressor_pool() -> Result<()> {
    let cfg = PageoutConfig {
        compressor_threads: 2,
        ..PageoutConfig::small()
    };
    let (po, compressor, _pager) = started(cfg)?;
    let obj = VmObject::new(ObjectId(1), ObjectKind::Internal);
    // More allocations than physical pages: every one past the first few
    // hundred depends on reclamation.
    for offset in 0..600u64 {
        let idx = po.allocate(&obj, offset, Placement::Active)?;
        // The scan thread may already have taken it back.
        let _ = po.set_dirty(idx, true);
    }
    assert!(compressor.compressed_pages() > 0);
    assert!(po.stats().laundered > 0);
    po.shutdown();
    assert!(po.is_shut_down());
    po.check_invariants()
}

#[test]
fn write_backs_complete_through_the_cleaned_queue() -> Result<()> {
    let (po, _compressor, pager) = started(PageoutConfig::small())?;
    let stop = Arc::new(AtomicBool::new(false));
    let completer = {
        let po = Arc::clone(&po);
        let pager = Arc::clone(&pager);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                for req in pager.take_requests() {
                    // The page may have been freed by its owner meanwhile.
                    let _ = po.write_back_complete(req.page, true);
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    // Keep the arena under pressure until a cleaned page has been reclaimed.
    let file = VmObject::external(ObjectId(5), PagerHandle(2));
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut offset = 0u64;
    while po.stats().freed_cleaned == 0 {
        assert!(Instant::now() < deadline, "no cleaned page was reclaimed");
        let idx = po.allocate(&file, offset, Placement::Active)?;
        let _ = po.set_dirty(idx, true);
        offset += 1;
    }
    assert!(po.stats().write_backs > 0);

    stop.store(true, Ordering::Release);
    completer.join().expect("completer thread");
    po.shutdown();
    po.check_invariants()
}

struct CountingHook {
    calls: AtomicU64,
    last_level: parking_lot::Mutex<Option<PressureLevel>>,
}

impl GcHook for CountingHook {
    fn collect(&self, level: PressureLevel) -> u64 {
        self.calls.fetch_add(1, Ordering::AcqRel);
        *self.last_level.lock() = Some(level);
        0
    }
}

#[test]
fn critical_pressure_wakes_gc_helper() -> Result<()> {
    let (po, _compressor, _pager) = started(PageoutConfig::small())?;
    let hook = Arc::new(CountingHook {
        calls: AtomicU64::new(0),
        last_level: parking_lot::Mutex::new(None),
    });
    let dyn_hook: Arc<dyn GcHook> = hook.clone();
    po.register_gc_hook(&dyn_hook);

    // Wired pages cannot be reclaimed, so the reserve stays breached.
    let obj = VmObject::kernel(ObjectId(1));
    let mut pages = Vec::new();
    for offset in 0..255u64 {
        let idx = po.allocate(&obj, offset, Placement::Active)?;
        po.wire(idx)?;
        pages.push(idx);
    }
    assert_eq!(po.pressure_level(), PressureLevel::Critical);
    wait_until("gc hook", || hook.calls.load(Ordering::Acquire) > 0);
    assert_eq!(*hook.last_level.lock(), Some(PressureLevel::Critical));

    for &idx in &pages[..64] {
        po.unwire(idx)?;
        po.free_page(idx)?;
    }
    let level = po.wait_for_pressure_change(PressureLevel::Critical, Duration::from_secs(5));
    assert_eq!(level, PressureLevel::Normal);

    drop(dyn_hook);
    drop(hook);
    assert_eq!(po.collect_garbage(), 0);
    po.shutdown();
    po.check_invariants()
}

#[test]
fn blocked_allocator_is_released_by_shutdown() -> Result<()> {
    let (po, _compressor, _pager) = started(PageoutConfig::small())?;
    let obj = VmObject::kernel(ObjectId(1));
    for offset in 0..256u64 {
        let idx = po.allocate(&obj, offset, Placement::Active)?;
        po.wire(idx)?;
    }
    let waiter = {
        let po = Arc::clone(&po);
        let obj = Arc::clone(&obj);
        thread::spawn(move || po.allocate(&obj, 10_000, Placement::Active))
    };
    wait_until("blocked allocator", || po.free_waiters() > 0);
    po.shutdown();
    let res = waiter.join().expect("waiter thread");
    assert!(matches!(res, Err(ReclaimError::ShuttingDown)));
    assert!(matches!(po.start(), Err(ReclaimError::ShuttingDown)));
    Ok(())
}

#[test]
fn stats_are_rolled_in_the_background() -> Result<()> {
    let (po, _compressor, _pager) = started(PageoutConfig::small())?;
    let obj = VmObject::new(ObjectId(1), ObjectKind::Internal);
    for offset in 0..300u64 {
        po.allocate(&obj, offset, Placement::Inactive)?;
    }
    wait_until("stats samples", || po.stats_samples().len() >= 2);
    let freed: u64 = po.stats_samples().iter().map(|s| s.counters.freed).sum();
    assert!(freed > 0);
    assert_eq!(po.laundry(LaundryKind::Compressor).in_flight, 0);
    po.shutdown();
    for idx in (0..po.config().total_pages).map(pageout::PageIdx) {
        let info = po.page_info(idx)?;
        assert!(info.state == PageState::Free || info.object == Some(obj.id()));
    }
    po.check_invariants()
}
