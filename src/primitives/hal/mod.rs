#![forbid(unsafe_code)]
#![allow(missing_docs)]

use thiserror::Error;

use crate::pageout::PressureLevel;
use crate::types::{ObjectId, PageIdx, PagerHandle};

/// Hardware reference/modify bits for one page.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RefMod {
    /// The page was accessed since the bits were last cleared.
    pub referenced: bool,
    /// The page was written since the bits were last cleared.
    pub modified: bool,
}

/// Hardware page-mapping layer.
///
/// All calls are synchronous, non-blocking and infallible. They may be made
/// while the page-queue lock is held.
pub trait Pmap: Send + Sync + 'static {
    /// Removes every mapping of the page; returns whether it was modified.
    fn disconnect(&self, page: PageIdx) -> bool;
    /// Reads the reference/modify bits of the page.
    fn get_reference_modify(&self, page: PageIdx) -> RefMod;
    /// Clears both reference and modify bits.
    fn clear_reference_modify(&self, page: PageIdx);
    /// Best-effort clear of the reference bit only, without a TLB flush.
    fn clear_reference(&self, page: PageIdx);
}

/// Identity of the physical page handed to the compressor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysPage {
    pub page: PageIdx,
    pub object: ObjectId,
    pub offset: u64,
}

/// Successful compression result.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Compressed {
    /// Change of the compressed pool size in bytes.
    pub byte_delta: i64,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum CompressError {
    #[error("compressed pool is full")]
    PoolFull,
    #[error("page content is incompressible")]
    Incompressible,
    #[error("compressor failure: {0}")]
    Other(String),
}

/// Opaque compression codec.
///
/// Called with the owning object's lock held. Implementations must not wait
/// on the free-page pool.
pub trait Compressor: Send + Sync + 'static {
    fn compress(
        &self,
        page: PhysPage,
        scratch: &mut [u8],
    ) -> std::result::Result<Compressed, CompressError>;
}

/// I/O priority reported with each write-back request.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize)]
pub enum IoTier {
    /// Free-page targets are met; write-back should yield to other I/O.
    Background,
    /// Allocators are short of pages; write-back is urgent.
    Foreground,
}

/// External (file) pager write-back protocol.
///
/// Fire-and-forget: completion is reported later through
/// [`crate::pageout::Pageout::write_back_complete`].
pub trait ExternalPager: Send + Sync + 'static {
    fn write_back(&self, pager: PagerHandle, offset: u64, page: PageIdx, tier: IoTier);
}

/// Memory owner that can give pages back when the reclaimer is stuck.
pub trait GcHook: Send + Sync + 'static {
    /// Releases what it can; returns the number of pages returned.
    fn collect(&self, level: PressureLevel) -> u64;
}
