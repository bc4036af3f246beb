#![forbid(unsafe_code)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pageout::primitives::sim::{SimCompressor, SimPager, SimPmap};
use pageout::vm::{ObjectKind, Placement, VmObject};
use pageout::{ObjectId, Pageout, PageoutConfig, PagerHandle};

fn micro_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/scan");
    group.sample_size(20);
    for total in [4_096u32, 32_768] {
        group.throughput(Throughput::Elements(u64::from(total)));
        group.bench_with_input(BenchmarkId::new("refill_clean", total), &total, |b, &total| {
            let mut harness = ScanHarness::new(total);
            b.iter(|| harness.refill_and_scan());
        });
        group.bench_with_input(BenchmarkId::new("compress_dirty", total), &total, |b, &total| {
            let mut harness = ScanHarness::new(total);
            b.iter(|| harness.dirty_and_drain());
        });
    }
    group.finish();
}

struct ScanHarness {
    po: Pageout,
    anon: Arc<VmObject>,
    file: Arc<VmObject>,
    offset: u64,
}

impl ScanHarness {
    fn new(total: u32) -> Self {
        let cfg = PageoutConfig {
            compressor_threads: 1,
            ..PageoutConfig::for_total_pages(total)
        };
        let po = Pageout::new(
            cfg.clone(),
            Arc::new(SimPmap::new(total)),
            Arc::new(SimCompressor::new(cfg.page_size)),
            Arc::new(SimPager::new()),
        )
        .expect("pageout");
        Self {
            po,
            anon: VmObject::new(ObjectId(1), ObjectKind::Internal),
            file: VmObject::external(ObjectId(2), PagerHandle(1)),
            offset: 0,
        }
    }

    /// Fills the free list down below target, then lets one pass refill it.
    fn refill_and_scan(&mut self) {
        let target = self.po.config().free_target;
        while self.po.free_count() >= target {
            let obj = if self.offset % 3 == 0 { &self.file } else { &self.anon };
            self.po
                .allocate(obj, self.offset, Placement::Inactive)
                .expect("allocate");
            self.offset += 1;
        }
        self.po.scan_once().expect("scan");
    }

    fn dirty_and_drain(&mut self) {
        let target = self.po.config().free_target;
        while self.po.free_count() >= target {
            let idx = self
                .po
                .allocate(&self.anon, self.offset, Placement::Inactive)
                .expect("allocate");
            self.po.set_dirty(idx, true).expect("dirty");
            self.offset += 1;
        }
        self.po.scan_once().expect("scan");
        while self.po.drain_compressor_once() > 0 {}
    }
}

criterion_group!(benches, micro_scan);
criterion_main!(benches);
