#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use pageout::primitives::sim::{SimCompressor, SimPager, SimPmap};
use pageout::vm::{ObjectKind, PageState, Placement, VmObject};
use pageout::{ObjectId, PageIdx, Pageout, PageoutConfig, PagerHandle, ReclaimError, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const THREADS: usize = 4;
const OPS_PER_THREAD: usize = 2_000;

fn stress_cfg() -> PageoutConfig {
    PageoutConfig {
        compressor_threads: 2,
        compressor_max_depth: 24,
        external_max_depth: 12,
        deadlock_wait_ms: 20,
        alloc_wait_ms: 20_000,
        ..PageoutConfig::small()
    }
}

fn worker(
    id: usize,
    po: Arc<Pageout>,
    pmap: Arc<SimPmap>,
    barrier: Arc<Barrier>,
) -> Result<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_0000 + id as u64);
    let object = if id % 2 == 0 {
        VmObject::new(ObjectId(id as u64 + 1), ObjectKind::Internal)
    } else {
        VmObject::external(ObjectId(id as u64 + 1), PagerHandle(id as u64))
    };
    let mut owned: Vec<(u64, PageIdx)> = Vec::new();
    let mut next_offset = 0u64;
    let mut allocated = 0usize;
    barrier.wait();

    for _ in 0..OPS_PER_THREAD {
        // Drop entries the engine reclaimed behind our back.
        owned.retain(|&(offset, idx)| object.acquire().resident_page(offset) == Some(idx));
        match rng.gen_range(0..10) {
            0..=4 => {
                let placement = match rng.gen_range(0..4) {
                    0 => Placement::Speculative,
                    1 => Placement::Active,
                    _ => Placement::Inactive,
                };
                let idx = po.allocate(&object, next_offset, placement)?;
                owned.push((next_offset, idx));
                next_offset += 1;
                allocated += 1;
            }
            5..=6 if !owned.is_empty() => {
                let (_, idx) = owned[rng.gen_range(0..owned.len())];
                let write = rng.gen_bool(0.5);
                pmap.access(idx, write);
                let _ = po.touch(idx, write);
            }
            7 if !owned.is_empty() => {
                let (_, idx) = owned[rng.gen_range(0..owned.len())];
                let _ = po.set_dirty(idx, true);
            }
            8 if !owned.is_empty() => {
                let at = rng.gen_range(0..owned.len());
                let (_, idx) = owned.swap_remove(at);
                match po.free_page(idx) {
                    Ok(()) | Err(ReclaimError::Invalid(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            _ => thread::yield_now(),
        }
    }
    Ok(allocated)
}

#[test]
fn concurrent_allocators_under_pressure() -> Result<()> {
    let cfg = stress_cfg();
    let pmap = Arc::new(SimPmap::new(cfg.total_pages));
    let compressor = Arc::new(SimCompressor::new(cfg.page_size));
    let pager = Arc::new(SimPager::new());
    let po = Arc::new(Pageout::new(
        cfg.clone(),
        pmap.clone(),
        compressor.clone(),
        pager.clone(),
    )?);
    po.start()?;

    let stop = Arc::new(AtomicBool::new(false));
    let completer = {
        let po = Arc::clone(&po);
        let pager = Arc::clone(&pager);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            while !stop.load(Ordering::Acquire) {
                for req in pager.take_requests() {
                    let _ = po.write_back_complete(req.page, rng.gen_bool(0.9));
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|id| {
            let po = Arc::clone(&po);
            let pmap = Arc::clone(&pmap);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || worker(id, po, pmap, barrier))
        })
        .collect();
    let mut allocated = 0;
    for handle in handles {
        allocated += handle.join().expect("worker thread")?;
    }
    assert!(allocated > cfg.total_pages as usize);

    stop.store(true, Ordering::Release);
    completer.join().expect("completer thread");
    po.shutdown();
    po.check_invariants()?;

    let in_use = (0..cfg.total_pages)
        .filter(|&i| {
            po.page_info(PageIdx(i))
                .map(|info| info.state != PageState::Free)
                .unwrap_or(false)
        })
        .count() as u32;
    assert_eq!(in_use + po.free_count(), cfg.total_pages);
    let stats = po.stats();
    assert!(stats.freed > 0);
    assert!(stats.scan_passes > 0);
    Ok(())
}
