//! Software stand-ins for the hardware and pager collaborators.
//!
//! They keep reference/modify bits and write-back requests in memory so the
//! engine can run without a real MMU or file system.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::primitives::hal::{
    CompressError, Compressed, Compressor, ExternalPager, IoTier, PhysPage, Pmap, RefMod,
};
use crate::types::{PageIdx, PagerHandle};

const BIT_REFERENCED: u8 = 0b001;
const BIT_MODIFIED: u8 = 0b010;
const BIT_MAPPED: u8 = 0b100;

/// Reference/modify bits kept in an atomic byte per page.
pub struct SimPmap {
    bits: Vec<AtomicU8>,
}

impl SimPmap {
    pub fn new(total_pages: u32) -> Self {
        Self {
            bits: (0..total_pages).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Simulates a CPU access through a mapping of `page`.
    pub fn access(&self, page: PageIdx, write: bool) {
        let mut set = BIT_REFERENCED | BIT_MAPPED;
        if write {
            set |= BIT_MODIFIED;
        }
        if let Some(slot) = self.bits.get(page.index()) {
            slot.fetch_or(set, Ordering::AcqRel);
        }
    }

    pub fn is_mapped(&self, page: PageIdx) -> bool {
        self.load(page) & BIT_MAPPED != 0
    }

    fn load(&self, page: PageIdx) -> u8 {
        self.bits
            .get(page.index())
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn clear(&self, page: PageIdx, mask: u8) -> u8 {
        self.bits
            .get(page.index())
            .map(|slot| slot.fetch_and(!mask, Ordering::AcqRel))
            .unwrap_or(0)
    }
}

impl Pmap for SimPmap {
    fn disconnect(&self, page: PageIdx) -> bool {
        let prev = self.clear(page, BIT_MAPPED | BIT_MODIFIED | BIT_REFERENCED);
        prev & BIT_MODIFIED != 0
    }

    fn get_reference_modify(&self, page: PageIdx) -> RefMod {
        let bits = self.load(page);
        RefMod {
            referenced: bits & BIT_REFERENCED != 0,
            modified: bits & BIT_MODIFIED != 0,
        }
    }

    fn clear_reference_modify(&self, page: PageIdx) {
        self.clear(page, BIT_REFERENCED | BIT_MODIFIED);
    }

    fn clear_reference(&self, page: PageIdx) {
        self.clear(page, BIT_REFERENCED);
    }
}

/// Compressor that accepts every page unless told to fail.
pub struct SimCompressor {
    ratio_percent: u32,
    page_size: usize,
    fail: AtomicBool,
    compressed: AtomicU64,
    failures: AtomicU64,
    pool_bytes: AtomicU64,
}

impl SimCompressor {
    pub fn new(page_size: usize) -> Self {
        Self {
            ratio_percent: 40,
            page_size,
            fail: AtomicBool::new(false),
            compressed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            pool_bytes: AtomicU64::new(0),
        }
    }

    /// Makes every following call fail with [`CompressError::PoolFull`].
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub fn compressed_pages(&self) -> u64 {
        self.compressed.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn pool_bytes(&self) -> u64 {
        self.pool_bytes.load(Ordering::Acquire)
    }
}

impl Compressor for SimCompressor {
    fn compress(
        &self,
        _page: PhysPage,
        scratch: &mut [u8],
    ) -> std::result::Result<Compressed, CompressError> {
        if self.fail.load(Ordering::Acquire) {
            self.failures.fetch_add(1, Ordering::AcqRel);
            return Err(CompressError::PoolFull);
        }
        let size = self.page_size * self.ratio_percent as usize / 100;
        if scratch.len() < size {
            self.failures.fetch_add(1, Ordering::AcqRel);
            return Err(CompressError::Other(format!(
                "scratch buffer too small: {} < {size}",
                scratch.len()
            )));
        }
        scratch[..size].fill(0);
        self.compressed.fetch_add(1, Ordering::AcqRel);
        self.pool_bytes.fetch_add(size as u64, Ordering::AcqRel);
        Ok(Compressed {
            byte_delta: size as i64,
        })
    }
}

/// A write-back request as seen by the pager.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WriteBackRequest {
    pub pager: PagerHandle,
    pub offset: u64,
    pub page: PageIdx,
    pub tier: IoTier,
}

/// Pager that records requests; completions are driven by the caller.
#[derive(Default)]
pub struct SimPager {
    requests: Mutex<Vec<WriteBackRequest>>,
}

impl SimPager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every request issued so far.
    pub fn take_requests(&self) -> Vec<WriteBackRequest> {
        std::mem::take(&mut *self.requests.lock())
    }

    pub fn pending(&self) -> usize {
        self.requests.lock().len()
    }
}

impl ExternalPager for SimPager {
    fn write_back(&self, pager: PagerHandle, offset: u64, page: PageIdx, tier: IoTier) {
        self.requests.lock().push(WriteBackRequest {
            pager,
            offset,
            page,
            tier,
        });
    }
}
