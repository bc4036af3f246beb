#![allow(missing_docs)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::primitives::concurrency::Backoff;
use crate::types::{ObjectId, PageIdx, PagerHandle};

/// Anonymous (internal) vs file-backed (external) memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ObjectKind {
    Internal,
    External,
}

/// Purgeable state declared by the owner of the object.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum Purgeable {
    /// Not purgeable.
    #[default]
    Deny,
    NonVolatile,
    /// Content may be discarded under pressure.
    Volatile,
    /// Content already discarded.
    Empty,
}

/// State guarded by the object lock.
pub struct ObjectState {
    pub(crate) resident: FxHashMap<u64, PageIdx>,
    pub pager: Option<PagerHandle>,
    pub purgeable: Purgeable,
    pub alive: bool,
    /// A copy-on-write shadow still references this object's pages.
    pub cow_shadowed: bool,
}

impl ObjectState {
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    pub fn resident_page(&self, offset: u64) -> Option<PageIdx> {
        self.resident.get(&offset).copied()
    }
}

pub type ObjectGuard<'a> = MutexGuard<'a, ObjectState>;

/// A memory object owning a set of resident pages.
pub struct VmObject {
    id: ObjectId,
    kind: ObjectKind,
    kernel_owned: bool,
    state: Mutex<ObjectState>,
    paging_in_progress: AtomicU32,
}

impl VmObject {
    pub fn new(id: ObjectId, kind: ObjectKind) -> Arc<Self> {
        Self::build(id, kind, None, false)
    }

    /// File-backed object written back through `pager`.
    pub fn external(id: ObjectId, pager: PagerHandle) -> Arc<Self> {
        Self::build(id, ObjectKind::External, Some(pager), false)
    }

    /// Object owned by the kernel itself; its pages are never deactivated.
    pub fn kernel(id: ObjectId) -> Arc<Self> {
        Self::build(id, ObjectKind::Internal, None, true)
    }

    fn build(
        id: ObjectId,
        kind: ObjectKind,
        pager: Option<PagerHandle>,
        kernel_owned: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            kernel_owned,
            state: Mutex::new(ObjectState {
                resident: FxHashMap::default(),
                pager,
                purgeable: Purgeable::Deny,
                alive: true,
                cow_shadowed: false,
            }),
            paging_in_progress: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_internal(&self) -> bool {
        self.kind == ObjectKind::Internal
    }

    pub fn is_kernel_owned(&self) -> bool {
        self.kernel_owned
    }

    /// Blocking acquire. Never call while holding the page-queue lock.
    pub fn acquire(&self) -> ObjectGuard<'_> {
        self.state.lock()
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(&self) -> Option<ObjectGuard<'_>> {
        self.state.try_lock()
    }

    /// Non-blocking attempts following `backoff`.
    pub fn try_acquire_with(&self, backoff: Backoff) -> Option<ObjectGuard<'_>> {
        backoff.retry(|| self.state.try_lock())
    }

    /// Bounded timed attempt, used for the published object of interest.
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<ObjectGuard<'_>> {
        self.state.try_lock_for(timeout)
    }

    /// Pins the object for the duration of a paging operation.
    pub fn begin_paging(self: &Arc<Self>) -> PagingToken {
        self.paging_in_progress.fetch_add(1, Ordering::AcqRel);
        PagingToken {
            object: Arc::clone(self),
        }
    }

    pub fn paging_in_progress(&self) -> u32 {
        self.paging_in_progress.load(Ordering::Acquire)
    }
}

/// Scope guard for an in-flight paging operation; dropping it unpins the object.
pub struct PagingToken {
    object: Arc<VmObject>,
}

impl PagingToken {
    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }
}

impl Drop for PagingToken {
    fn drop(&mut self) {
        self.object.paging_in_progress.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for PagingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagingToken")
            .field("object", &self.object.id)
            .finish()
    }
}
