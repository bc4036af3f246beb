#![allow(missing_docs)]

use std::sync::{Arc, Weak};

use crate::types::{ObjectId, PageIdx};

use super::object::{ObjectKind, PagingToken, VmObject};

/// Which laundry queue a dirty page is handed to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize)]
pub enum LaundryKind {
    /// Anonymous pages bound for the compressor.
    Compressor,
    /// File-backed pages bound for their external pager.
    External,
}

impl LaundryKind {
    pub const ALL: [LaundryKind; 2] = [LaundryKind::Compressor, LaundryKind::External];

    pub fn index(self) -> usize {
        match self {
            LaundryKind::Compressor => 0,
            LaundryKind::External => 1,
        }
    }

    pub fn for_kind(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Internal => LaundryKind::Compressor,
            ObjectKind::External => LaundryKind::External,
        }
    }
}

/// Queue membership tag. Every page carries exactly one.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QueueId {
    /// Not on any queue (busy in a worker, or not yet placed).
    None,
    /// On the free list.
    Free,
    /// Pinned; never reclaimed.
    Wired,
    Active,
    InactiveInternal,
    InactiveExternal,
    /// One of the speculative age buckets.
    Speculative(u8),
    SpeculativeAged,
    Cleaned,
    Throttled,
    Background,
    Donate,
    /// Pending on a laundry queue.
    Laundry(LaundryKind),
}

pub(crate) const FIXED_SLOTS: usize = 10;

impl QueueId {
    /// Position of the queue's list in the arena, if the queue is linked.
    pub(crate) fn slot(self) -> Option<usize> {
        match self {
            QueueId::None | QueueId::Free | QueueId::Wired => None,
            QueueId::Active => Some(0),
            QueueId::InactiveInternal => Some(1),
            QueueId::InactiveExternal => Some(2),
            QueueId::SpeculativeAged => Some(3),
            QueueId::Cleaned => Some(4),
            QueueId::Throttled => Some(5),
            QueueId::Background => Some(6),
            QueueId::Donate => Some(7),
            QueueId::Laundry(LaundryKind::Compressor) => Some(8),
            QueueId::Laundry(LaundryKind::External) => Some(9),
            QueueId::Speculative(bucket) => Some(FIXED_SLOTS + bucket as usize),
        }
    }

    pub(crate) fn from_slot(slot: usize) -> QueueId {
        match slot {
            0 => QueueId::Active,
            1 => QueueId::InactiveInternal,
            2 => QueueId::InactiveExternal,
            3 => QueueId::SpeculativeAged,
            4 => QueueId::Cleaned,
            5 => QueueId::Throttled,
            6 => QueueId::Background,
            7 => QueueId::Donate,
            8 => QueueId::Laundry(LaundryKind::Compressor),
            9 => QueueId::Laundry(LaundryKind::External),
            n => QueueId::Speculative((n - FIXED_SLOTS) as u8),
        }
    }

    pub fn is_speculative(self) -> bool {
        matches!(self, QueueId::Speculative(_) | QueueId::SpeculativeAged)
    }

    pub fn is_inactive(self) -> bool {
        matches!(self, QueueId::InactiveInternal | QueueId::InactiveExternal)
    }

    /// Queues whose pages count toward the pageable pools.
    pub fn is_pageable(self) -> bool {
        matches!(
            self,
            QueueId::Active
                | QueueId::InactiveInternal
                | QueueId::InactiveExternal
                | QueueId::Speculative(_)
                | QueueId::SpeculativeAged
                | QueueId::Cleaned
                | QueueId::Background
                | QueueId::Donate
        )
    }
}

/// Life-cycle state of a page.
///
/// Orthogonal attributes (dirty, precious, reference, free-when-done) live
/// next to it on [`Page`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PageState {
    Free,
    /// Allocated but its contents are not filled in yet.
    Absent,
    Resident,
    /// Held exclusively by some thread for a short time.
    Busy,
    /// Linked on a laundry queue.
    Laundry,
    /// Taken off a laundry queue; compression or write-back in flight.
    Cleaning,
    /// The fill failed.
    Error,
    Wired,
}

impl PageState {
    /// The transition table. Anything not listed is a bug.
    pub fn can_transition(self, to: PageState) -> bool {
        use PageState::*;
        matches!(
            (self, to),
            (Free, Absent)
                | (Free, Resident)
                | (Absent, Resident)
                | (Absent, Error)
                | (Absent, Free)
                | (Resident, Busy)
                | (Resident, Laundry)
                | (Resident, Wired)
                | (Resident, Free)
                | (Busy, Resident)
                | (Busy, Free)
                | (Laundry, Cleaning)
                | (Laundry, Resident)
                | (Laundry, Free)
                | (Cleaning, Resident)
                | (Cleaning, Free)
                | (Error, Free)
                | (Wired, Resident)
                | (Wired, Free)
        )
    }
}

/// One physical frame.
pub struct Page {
    pub(crate) state: PageState,
    pub(crate) queue: QueueId,
    pub(crate) prev: Option<PageIdx>,
    pub(crate) next: Option<PageIdx>,
    pub(crate) object: Option<Weak<VmObject>>,
    pub(crate) object_id: Option<ObjectId>,
    pub(crate) kind: ObjectKind,
    pub(crate) kernel_owned: bool,
    pub(crate) offset: u64,
    pub(crate) pin: Option<PagingToken>,
    /// An absent page whose filler has not reported back yet.
    pub(crate) fill_pending: bool,
    pub dirty: bool,
    pub precious: bool,
    pub reference: bool,
    pub free_when_done: bool,
    pub pmapped: bool,
    /// Guard page; never reclaimed by the balancer.
    pub guard: bool,
    /// Shared-cache or real-time page; gets the extended reactivation limit.
    pub important: bool,
    /// Read with a no-cache hint; a reference does not earn a reactivation.
    pub no_cache: bool,
    pub wire_count: u16,
}

impl Page {
    pub(crate) fn new() -> Self {
        Self {
            state: PageState::Free,
            queue: QueueId::Free,
            prev: None,
            next: None,
            object: None,
            object_id: None,
            kind: ObjectKind::Internal,
            kernel_owned: false,
            offset: 0,
            pin: None,
            fill_pending: false,
            dirty: false,
            precious: false,
            reference: false,
            free_when_done: false,
            pmapped: false,
            guard: false,
            important: false,
            no_cache: false,
            wire_count: 0,
        }
    }

    pub(crate) fn bind(&mut self, object: &Arc<VmObject>, offset: u64) {
        self.object = Some(Arc::downgrade(object));
        self.object_id = Some(object.id());
        self.kind = object.kind();
        self.kernel_owned = object.is_kernel_owned();
        self.offset = offset;
    }

    /// Drops every binding and attribute; returns the pin, if any, so the
    /// caller controls where it is released.
    pub(crate) fn reset(&mut self) -> Option<PagingToken> {
        let pin = self.pin.take();
        *self = Page::new();
        pin
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.object_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_internal(&self) -> bool {
        self.kind == ObjectKind::Internal
    }

    pub fn laundry(&self) -> bool {
        self.state == PageState::Laundry
    }

    pub(crate) fn upgrade_object(&self) -> Option<Arc<VmObject>> {
        self.object.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn info(&self, idx: PageIdx) -> PageInfo {
        PageInfo {
            idx,
            state: self.state,
            queue: self.queue,
            object: self.object_id,
            offset: self.offset,
            dirty: self.dirty,
            precious: self.precious,
            reference: self.reference,
            free_when_done: self.free_when_done,
            fill_pending: self.fill_pending,
            laundry: self.laundry(),
            wire_count: self.wire_count,
        }
    }
}

/// Read-only snapshot of a page record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageInfo {
    pub idx: PageIdx,
    pub state: PageState,
    pub queue: QueueId,
    pub object: Option<ObjectId>,
    pub offset: u64,
    pub dirty: bool,
    pub precious: bool,
    pub reference: bool,
    pub free_when_done: bool,
    pub fill_pending: bool,
    pub laundry: bool,
    pub wire_count: u16,
}
