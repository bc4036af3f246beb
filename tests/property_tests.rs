#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use pageout::primitives::sim::{SimCompressor, SimPager, SimPmap};
use pageout::vm::{ObjectKind, PageState, Placement, VmObject};
use pageout::{ObjectId, PageIdx, Pageout, PageoutConfig, PagerHandle};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Operation {
    Allocate { external: bool, placement: Placement },
    Free { slot: usize },
    Touch { slot: usize, write: bool },
    Dirty { slot: usize },
    Reclaim { slot: usize },
    Wire { slot: usize },
    Unwire { slot: usize },
    FinishFill { slot: usize, outcome: u8 },
    Scan,
    DrainCompressor,
    DrainExternal,
    CompleteWriteBacks { ok: bool },
    FailCompressor { fail: bool },
}

fn arb_placement() -> impl Strategy<Value = Placement> {
    prop_oneof![
        Just(Placement::Active),
        Just(Placement::Inactive),
        Just(Placement::Speculative),
        Just(Placement::Background),
        Just(Placement::Donate),
        Just(Placement::Absent),
    ]
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => (any::<bool>(), arb_placement())
            .prop_map(|(external, placement)| Operation::Allocate { external, placement }),
        1 => any::<usize>().prop_map(|slot| Operation::Free { slot }),
        2 => (any::<usize>(), any::<bool>()).prop_map(|(slot, write)| Operation::Touch { slot, write }),
        2 => any::<usize>().prop_map(|slot| Operation::Dirty { slot }),
        2 => any::<usize>().prop_map(|slot| Operation::Reclaim { slot }),
        1 => any::<usize>().prop_map(|slot| Operation::Wire { slot }),
        1 => any::<usize>().prop_map(|slot| Operation::Unwire { slot }),
        1 => (any::<usize>(), 0u8..3).prop_map(|(slot, outcome)| Operation::FinishFill { slot, outcome }),
        2 => Just(Operation::Scan),
        1 => Just(Operation::DrainCompressor),
        1 => Just(Operation::DrainExternal),
        1 => any::<bool>().prop_map(|ok| Operation::CompleteWriteBacks { ok }),
        1 => any::<bool>().prop_map(|fail| Operation::FailCompressor { fail }),
    ]
}

struct Model {
    po: Pageout,
    compressor: Arc<SimCompressor>,
    pager: Arc<SimPager>,
    anon: Arc<VmObject>,
    file: Arc<VmObject>,
    pages: Vec<PageIdx>,
    next_offset: u64,
}

impl Model {
    fn new() -> Self {
        let cfg = PageoutConfig {
            total_pages: 64,
            free_reserved: 2,
            free_min: 4,
            free_target: 8,
            compressor_max_depth: 8,
            external_max_depth: 4,
            burst_limit: 16,
            ..PageoutConfig::small()
        };
        let compressor = Arc::new(SimCompressor::new(cfg.page_size));
        let pager = Arc::new(SimPager::new());
        let po = Pageout::new(
            cfg,
            Arc::new(SimPmap::new(64)),
            compressor.clone(),
            pager.clone(),
        )
        .expect("valid config");
        Self {
            po,
            compressor,
            pager,
            anon: VmObject::new(ObjectId(1), ObjectKind::Internal),
            file: VmObject::external(ObjectId(2), PagerHandle(1)),
            pages: Vec::new(),
            next_offset: 0,
        }
    }

    fn pick(&self, slot: usize) -> Option<PageIdx> {
        if self.pages.is_empty() {
            None
        } else {
            Some(self.pages[slot % self.pages.len()])
        }
    }

    fn apply(&mut self, op: Operation) {
        match op {
            Operation::Allocate {
                external,
                placement,
            } => {
                let obj = if external { &self.file } else { &self.anon };
                self.next_offset += 1;
                let res =
                    self.po
                        .allocate_timeout(obj, self.next_offset, placement, Duration::ZERO);
                if let Ok(idx) = res {
                    self.pages.push(idx);
                }
            }
            Operation::Free { slot } => {
                if let Some(idx) = self.pick(slot) {
                    let _ = self.po.free_page(idx);
                }
            }
            Operation::Touch { slot, write } => {
                if let Some(idx) = self.pick(slot) {
                    let _ = self.po.touch(idx, write);
                }
            }
            Operation::Dirty { slot } => {
                if let Some(idx) = self.pick(slot) {
                    let _ = self.po.set_dirty(idx, true);
                }
            }
            Operation::Reclaim { slot } => {
                if let Some(idx) = self.pick(slot) {
                    let _ = self.po.reclaim_now(idx);
                }
            }
            Operation::Wire { slot } => {
                if let Some(idx) = self.pick(slot) {
                    let _ = self.po.wire(idx);
                }
            }
            Operation::Unwire { slot } => {
                if let Some(idx) = self.pick(slot) {
                    let _ = self.po.unwire(idx);
                }
            }
            Operation::FinishFill { slot, outcome } => {
                if let Some(idx) = self.pick(slot) {
                    let _ = match outcome {
                        0 => self.po.fill_complete(idx, true),
                        1 => self.po.fill_complete(idx, false),
                        _ => self.po.abandon_fill(idx),
                    };
                }
            }
            Operation::Scan => {
                let _ = self.po.scan_once().expect("scan pass");
            }
            Operation::DrainCompressor => {
                self.po.drain_compressor_once();
            }
            Operation::DrainExternal => {
                self.po.drain_external_once();
            }
            Operation::CompleteWriteBacks { ok } => {
                for req in self.pager.take_requests() {
                    let _ = self.po.write_back_complete(req.page, ok);
                }
            }
            Operation::FailCompressor { fail } => self.compressor.set_failing(fail),
        }
        // Forget slots whose page went back to the free list.
        let po = &self.po;
        self.pages
            .retain(|&idx| po.page_info(idx).map(|i| i.state != PageState::Free).unwrap_or(false));
    }

    /// Every page is either on the free list or owned.
    fn conserved(&self) -> bool {
        let total = self.po.config().total_pages;
        let in_use = (0..total)
            .filter(|&i| {
                self.po
                    .page_info(PageIdx(i))
                    .map(|info| info.state != PageState::Free)
                    .unwrap_or(false)
            })
            .count() as u32;
        in_use + self.po.free_count() == total
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_invariants_hold_after_every_operation(
        ops in prop::collection::vec(arb_operation(), 1..200)
    ) {
        let mut model = Model::new();
        for op in ops {
            model.apply(op.clone());
            let checked = model.po.check_invariants();
            prop_assert!(checked.is_ok(), "after {:?}: {:?}", op, checked);
            prop_assert!(model.conserved(), "page leaked after {:?}", op);
        }
    }

    #[test]
    fn prop_laundry_depth_never_exceeds_max_without_forcing(
        dirty in 1usize..40,
    ) {
        let mut model = Model::new();
        for _ in 0..dirty {
            model.apply(Operation::Allocate { external: false, placement: Placement::Inactive });
        }
        let pages = model.pages.clone();
        for idx in pages {
            let _ = model.po.set_dirty(idx, true);
            let _ = model.po.reclaim_now(idx);
        }
        let snapshot = model.po.laundry(pageout::vm::LaundryKind::Compressor);
        prop_assert!(snapshot.depth <= snapshot.max_depth);
        prop_assert!(model.po.check_invariants().is_ok());
    }
}
