#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::PageoutConfig;
use crate::pageout::laundry::LaundryQueue;
use crate::types::{PageIdx, ReclaimError, Result};

use super::object::{ObjectKind, PagingToken, VmObject};
use super::page::{LaundryKind, Page, PageInfo, PageState, QueueId, FIXED_SLOTS};
use super::speculative::SpeculativeRing;

#[derive(Copy, Clone, Debug, Default)]
struct ListHead {
    head: Option<PageIdx>,
    tail: Option<PageIdx>,
    len: u32,
}

/// Soft per-queue counters, maintained incrementally.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct QueueCounts {
    pub active: u32,
    pub inactive_internal: u32,
    pub inactive_external: u32,
    pub speculative: u32,
    pub speculative_aged: u32,
    pub cleaned: u32,
    pub throttled: u32,
    pub background: u32,
    pub donate: u32,
    pub wired: u32,
    pub internal_pageable: u32,
    pub external_pageable: u32,
}

impl QueueCounts {
    fn adjust(&mut self, queue: QueueId, kind: ObjectKind, delta: i32) {
        let apply = |v: &mut u32| *v = v.saturating_add_signed(delta);
        match queue {
            QueueId::Active => apply(&mut self.active),
            QueueId::InactiveInternal => apply(&mut self.inactive_internal),
            QueueId::InactiveExternal => apply(&mut self.inactive_external),
            QueueId::Speculative(_) => apply(&mut self.speculative),
            QueueId::SpeculativeAged => apply(&mut self.speculative_aged),
            QueueId::Cleaned => apply(&mut self.cleaned),
            QueueId::Throttled => apply(&mut self.throttled),
            QueueId::Background => apply(&mut self.background),
            QueueId::Donate => apply(&mut self.donate),
            QueueId::Wired => apply(&mut self.wired),
            QueueId::None | QueueId::Free | QueueId::Laundry(_) => {}
        }
        if queue.is_pageable() {
            match kind {
                ObjectKind::Internal => apply(&mut self.internal_pageable),
                ObjectKind::External => apply(&mut self.external_pageable),
            }
        }
    }
}

/// Where a freshly allocated page is placed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    Active,
    Inactive,
    /// Read-ahead page not yet touched by a fault.
    Speculative,
    Background,
    Donate,
    /// Allocated for a fill that has not completed.
    Absent,
}

/// The page arena and every queue threaded through it.
///
/// This is the only owner of page linkage. All methods run under the
/// page-queue lock held by the caller.
pub struct PageQueues {
    pages: Vec<Page>,
    lists: Vec<ListHead>,
    counts: QueueCounts,
    speculative: SpeculativeRing,
    laundry: [LaundryQueue; 2],
    inactive_target_percent: u32,
    speculative_target: u32,
}

impl PageQueues {
    pub fn new(cfg: &PageoutConfig) -> Self {
        let buckets = cfg.speculative_buckets.max(1);
        Self {
            pages: (0..cfg.total_pages).map(|_| Page::new()).collect(),
            lists: vec![ListHead::default(); FIXED_SLOTS + buckets as usize],
            counts: QueueCounts::default(),
            speculative: SpeculativeRing::new(buckets, cfg.speculative_age()),
            laundry: [
                LaundryQueue::new(
                    LaundryKind::Compressor,
                    cfg.compressor_max_depth,
                    cfg.throttle_depth(cfg.compressor_max_depth),
                ),
                LaundryQueue::new(
                    LaundryKind::External,
                    cfg.external_max_depth,
                    cfg.throttle_depth(cfg.external_max_depth),
                ),
            ],
            inactive_target_percent: cfg.inactive_target_percent,
            speculative_target: cfg.speculative_target(),
        }
    }

    pub fn total_pages(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn page(&self, idx: PageIdx) -> Result<&Page> {
        self.pages
            .get(idx.index())
            .ok_or(ReclaimError::Invalid("page index out of range"))
    }

    pub(crate) fn page_mut(&mut self, idx: PageIdx) -> Result<&mut Page> {
        self.pages
            .get_mut(idx.index())
            .ok_or(ReclaimError::Invalid("page index out of range"))
    }

    pub fn info(&self, idx: PageIdx) -> Result<PageInfo> {
        Ok(self.page(idx)?.info(idx))
    }

    pub fn counts(&self) -> QueueCounts {
        self.counts
    }

    pub fn laundry(&self, kind: LaundryKind) -> &LaundryQueue {
        &self.laundry[kind.index()]
    }

    pub(crate) fn laundry_mut(&mut self, kind: LaundryKind) -> &mut LaundryQueue {
        &mut self.laundry[kind.index()]
    }

    pub fn speculative_ring(&self) -> &SpeculativeRing {
        &self.speculative
    }

    /// Length of a queue's linkage list (0 for unlinked tags).
    pub fn len(&self, queue: QueueId) -> u32 {
        queue.slot().map(|s| self.lists[s].len).unwrap_or(0)
    }

    pub fn is_empty(&self, queue: QueueId) -> bool {
        self.len(queue) == 0
    }

    pub fn head(&self, queue: QueueId) -> Option<PageIdx> {
        queue.slot().and_then(|s| self.lists[s].head)
    }

    /// Walks a queue from head to tail.
    pub fn iter(&self, queue: QueueId) -> QueueIter<'_> {
        QueueIter {
            queues: self,
            cursor: self.head(queue),
        }
    }

    /// Inactive pool size the balancer aims for.
    pub fn inactive_target(&self) -> u32 {
        let pool = u64::from(self.counts.active)
            + u64::from(self.counts.inactive_internal)
            + u64::from(self.counts.inactive_external);
        (pool * u64::from(self.inactive_target_percent) / 100) as u32
    }

    pub fn inactive_count(&self) -> u32 {
        self.counts.inactive_internal + self.counts.inactive_external
    }

    pub fn speculative_count(&self) -> u32 {
        self.counts.speculative + self.counts.speculative_aged
    }

    fn link_tail(&mut self, idx: PageIdx, queue: QueueId) {
        let kind = self.pages[idx.index()].kind;
        if let Some(slot) = queue.slot() {
            let tail = self.lists[slot].tail;
            {
                let page = &mut self.pages[idx.index()];
                debug_assert!(page.prev.is_none() && page.next.is_none());
                page.prev = tail;
                page.next = None;
            }
            match tail {
                Some(t) => self.pages[t.index()].next = Some(idx),
                None => self.lists[slot].head = Some(idx),
            }
            self.lists[slot].tail = Some(idx);
            self.lists[slot].len += 1;
        }
        self.pages[idx.index()].queue = queue;
        self.counts.adjust(queue, kind, 1);
    }

    fn unlink(&mut self, idx: PageIdx) {
        let (queue, kind, prev, next) = {
            let page = &self.pages[idx.index()];
            (page.queue, page.kind, page.prev, page.next)
        };
        if let Some(slot) = queue.slot() {
            match prev {
                Some(p) => self.pages[p.index()].next = next,
                None => self.lists[slot].head = next,
            }
            match next {
                Some(n) => self.pages[n.index()].prev = prev,
                None => self.lists[slot].tail = prev,
            }
            self.lists[slot].len -= 1;
        }
        let page = &mut self.pages[idx.index()];
        page.prev = None;
        page.next = None;
        page.queue = QueueId::None;
        self.counts.adjust(queue, kind, -1);
    }

    /// Moves a page to the tail of `queue`.
    pub(crate) fn set_queue(&mut self, idx: PageIdx, queue: QueueId) {
        self.unlink(idx);
        self.link_tail(idx, queue);
    }

    pub(crate) fn set_state(&mut self, idx: PageIdx, to: PageState) {
        let page = &mut self.pages[idx.index()];
        debug_assert!(
            page.state == to || page.state.can_transition(to),
            "illegal page transition {:?} -> {:?} for page {idx}",
            page.state,
            to
        );
        page.state = to;
    }

    pub(crate) fn inactive_queue_for(kind: ObjectKind) -> QueueId {
        match kind {
            ObjectKind::Internal => QueueId::InactiveInternal,
            ObjectKind::External => QueueId::InactiveExternal,
        }
    }

    /// Binds a page taken off the free list and links it per `placement`.
    pub(crate) fn place_new(
        &mut self,
        idx: PageIdx,
        object: &Arc<VmObject>,
        offset: u64,
        placement: Placement,
        now: Instant,
    ) -> Result<()> {
        {
            let page = self.page_mut(idx)?;
            if page.state != PageState::Free {
                return Err(ReclaimError::Invalid("page taken off the free list is not free"));
            }
            page.bind(object, offset);
        }
        // Free pages are tracked by the free list, not a queue.
        self.pages[idx.index()].queue = QueueId::None;
        match placement {
            Placement::Absent => {
                self.set_state(idx, PageState::Absent);
                self.pages[idx.index()].fill_pending = true;
                self.link_tail(idx, Self::inactive_queue_for(object.kind()));
            }
            Placement::Active => {
                self.set_state(idx, PageState::Resident);
                self.link_tail(idx, QueueId::Active);
            }
            Placement::Inactive => {
                self.set_state(idx, PageState::Resident);
                self.link_tail(idx, Self::inactive_queue_for(object.kind()));
            }
            Placement::Background => {
                self.set_state(idx, PageState::Resident);
                self.link_tail(idx, QueueId::Background);
            }
            Placement::Donate => {
                self.set_state(idx, PageState::Resident);
                self.link_tail(idx, QueueId::Donate);
            }
            Placement::Speculative => {
                self.set_state(idx, PageState::Resident);
                self.insert_speculative(idx, now);
            }
        }
        Ok(())
    }

    /// Moves a page to the tail of the queue it is already on.
    pub(crate) fn requeue(&mut self, idx: PageIdx) {
        let queue = self.pages[idx.index()].queue;
        self.set_queue(idx, queue);
    }

    /// Puts a page back on the active queue with its reference cleared.
    pub(crate) fn activate(&mut self, idx: PageIdx) {
        let page = &mut self.pages[idx.index()];
        page.reference = false;
        if matches!(page.state, PageState::Laundry | PageState::Cleaning) {
            self.set_state(idx, PageState::Resident);
        }
        self.set_queue(idx, QueueId::Active);
    }

    /// Moves a page to the inactive queue of its object kind.
    pub(crate) fn deactivate(&mut self, idx: PageIdx) {
        let kind = self.pages[idx.index()].kind;
        self.pages[idx.index()].reference = false;
        self.set_queue(idx, Self::inactive_queue_for(kind));
    }

    pub(crate) fn insert_speculative(&mut self, idx: PageIdx, now: Instant) {
        let (bucket, stale) = self.speculative.insertion_bucket(now);
        if let Some(stale) = stale {
            self.promote_bucket(stale);
            // The stale bucket was just reopened as the newest one.
            self.speculative.insertion_bucket(now);
        }
        self.set_queue(idx, QueueId::Speculative(bucket));
    }

    /// Moves every page of `bucket` to the aged bucket.
    fn promote_bucket(&mut self, bucket: u8) -> u32 {
        let mut moved = 0;
        while let Some(idx) = self.head(QueueId::Speculative(bucket)) {
            self.set_queue(idx, QueueId::SpeculativeAged);
            moved += 1;
        }
        self.speculative.mark_promoted(bucket);
        moved
    }

    /// Promotes expired buckets, and the oldest one when speculative pages
    /// exceed their target. Returns the number of pages aged.
    pub(crate) fn age_speculative(&mut self, now: Instant) -> u32 {
        let mut moved = 0;
        for bucket in self.speculative.expired(now) {
            moved += self.promote_bucket(bucket);
        }
        if self.counts.speculative > self.speculative_target && self.is_empty(QueueId::SpeculativeAged) {
            if let Some(oldest) = self.speculative.oldest() {
                moved += self.promote_bucket(oldest);
            }
        }
        if moved > 0 {
            trace!(moved, "pageout.speculative.aged");
        }
        moved
    }

    /// Links a page at the tail of a laundry queue.
    pub(crate) fn enqueue_laundry(
        &mut self,
        idx: PageIdx,
        kind: LaundryKind,
        pin: PagingToken,
    ) -> Result<()> {
        let page = self.page(idx)?;
        if matches!(page.queue, QueueId::Laundry(_)) || page.state == PageState::Laundry {
            return Err(ReclaimError::Invalid("page is already on a laundry queue"));
        }
        if page.state != PageState::Resident {
            return Err(ReclaimError::Invalid("only resident pages can be laundered"));
        }
        self.set_state(idx, PageState::Laundry);
        self.pages[idx.index()].pin = Some(pin);
        self.set_queue(idx, QueueId::Laundry(kind));
        self.laundry[kind.index()].note_enqueue();
        Ok(())
    }

    /// Takes up to `max` pages off the head of a laundry queue, in FIFO
    /// order, marking them in flight.
    pub(crate) fn dequeue_laundry_batch(&mut self, kind: LaundryKind, max: usize) -> Vec<PageIdx> {
        let mut batch = Vec::with_capacity(max.min(self.len(QueueId::Laundry(kind)) as usize));
        if max > 0 {
            self.laundry[kind.index()].begin_drain();
        }
        while batch.len() < max {
            let Some(idx) = self.head(QueueId::Laundry(kind)) else {
                break;
            };
            self.unlink(idx);
            self.set_state(idx, PageState::Cleaning);
            self.laundry[kind.index()].note_dequeue(true);
            batch.push(idx);
        }
        batch
    }

    /// Removes a still-pending page from its laundry queue and reactivates it.
    pub(crate) fn pull_from_laundry(&mut self, idx: PageIdx) -> Option<PagingToken> {
        let QueueId::Laundry(kind) = self.pages[idx.index()].queue else {
            return None;
        };
        self.laundry[kind.index()].note_dequeue(false);
        let pin = self.pages[idx.index()].pin.take();
        self.activate(idx);
        pin
    }

    /// Finishes an in-flight page by putting it back in circulation.
    pub(crate) fn finish_cleaning(&mut self, idx: PageIdx, kind: LaundryKind, to: QueueId) -> Option<PagingToken> {
        self.laundry[kind.index()].finish_in_flight(1);
        let pin = self.pages[idx.index()].pin.take();
        self.set_state(idx, PageState::Resident);
        self.pages[idx.index()].reference = false;
        self.set_queue(idx, to);
        pin
    }

    /// Unlinks a page and resets it to free. The caller detaches it from its
    /// object and hands it to the free list.
    pub(crate) fn release_page(&mut self, idx: PageIdx) -> Option<PagingToken> {
        match self.pages[idx.index()].state {
            PageState::Laundry => {
                if let QueueId::Laundry(kind) = self.pages[idx.index()].queue {
                    self.laundry[kind.index()].note_dequeue(false);
                }
            }
            PageState::Cleaning => {
                let kind = LaundryKind::for_kind(self.pages[idx.index()].kind);
                self.laundry[kind.index()].finish_in_flight(1);
            }
            _ => {}
        }
        self.unlink(idx);
        self.set_state(idx, PageState::Free);
        let pin = self.pages[idx.index()].reset();
        self.pages[idx.index()].queue = QueueId::Free;
        pin
    }

    pub(crate) fn wire(&mut self, idx: PageIdx) -> Result<()> {
        let state = self.page(idx)?.state;
        match state {
            PageState::Wired => {}
            PageState::Resident => {
                self.set_state(idx, PageState::Wired);
                self.set_queue(idx, QueueId::Wired);
            }
            _ => return Err(ReclaimError::Invalid("only resident pages can be wired")),
        }
        let page = &mut self.pages[idx.index()];
        page.wire_count = page
            .wire_count
            .checked_add(1)
            .ok_or(ReclaimError::Invalid("wire count overflow"))?;
        Ok(())
    }

    pub(crate) fn unwire(&mut self, idx: PageIdx) -> Result<()> {
        let page = self.page_mut(idx)?;
        if page.state != PageState::Wired || page.wire_count == 0 {
            return Err(ReclaimError::Invalid("page is not wired"));
        }
        page.wire_count -= 1;
        if page.wire_count == 0 {
            self.set_state(idx, PageState::Resident);
            self.set_queue(idx, QueueId::Active);
        }
        Ok(())
    }

    fn computed_counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for page in &self.pages {
            counts.adjust(page.queue, page.kind, 1);
        }
        counts
    }

    /// Rebuilds the soft counters from the page tags.
    pub(crate) fn recount(&mut self) {
        let fresh = self.computed_counts();
        if fresh != self.counts {
            warn!(before = ?self.counts, after = ?fresh, "pageout.queues.recount");
        } else {
            debug!("pageout.queues.recount_clean");
        }
        self.counts = fresh;
    }

    /// Verifies linkage, laundry and counter invariants.
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = vec![false; self.pages.len()];
        for (slot, list) in self.lists.iter().enumerate() {
            let queue = QueueId::from_slot(slot);
            let mut cursor = list.head;
            let mut prev = None;
            let mut walked = 0u32;
            while let Some(idx) = cursor {
                let page = self
                    .pages
                    .get(idx.index())
                    .ok_or_else(|| violation(format!("{queue:?} links out-of-range page {idx}")))?;
                if seen[idx.index()] {
                    return Err(violation(format!("page {idx} linked twice (found again on {queue:?})")));
                }
                seen[idx.index()] = true;
                if page.queue != queue {
                    return Err(violation(format!(
                        "page {idx} tagged {:?} but linked on {queue:?}",
                        page.queue
                    )));
                }
                if page.prev != prev {
                    return Err(violation(format!("page {idx} has a broken back link")));
                }
                walked += 1;
                prev = cursor;
                cursor = page.next;
            }
            if list.tail != prev {
                return Err(violation(format!("{queue:?} tail does not match its last page")));
            }
            if walked != list.len {
                return Err(violation(format!(
                    "{queue:?} length {} but {walked} pages linked",
                    list.len
                )));
            }
        }
        for (i, page) in self.pages.iter().enumerate() {
            if page.queue.slot().is_some() != seen[i] {
                return Err(violation(format!(
                    "page {i} tagged {:?} but linkage disagrees",
                    page.queue
                )));
            }
            let on_laundry = matches!(page.queue, QueueId::Laundry(_));
            if on_laundry != (page.state == PageState::Laundry) {
                return Err(violation(format!(
                    "page {i} laundry state {:?} disagrees with queue {:?}",
                    page.state, page.queue
                )));
            }
            if (page.queue == QueueId::Free) != (page.state == PageState::Free) {
                return Err(violation(format!(
                    "page {i} free state {:?} disagrees with queue {:?}",
                    page.state, page.queue
                )));
            }
        }
        for kind in LaundryKind::ALL {
            let depth = self.laundry[kind.index()].depth();
            let len = self.len(QueueId::Laundry(kind));
            if depth != len {
                return Err(violation(format!(
                    "{kind:?} laundry depth {depth} but {len} pages pending"
                )));
            }
        }
        let computed = self.computed_counts();
        if computed != self.counts {
            return Err(violation(format!(
                "soft counters {:?} disagree with tags {:?}",
                self.counts, computed
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn corrupt_counts_for_test(&mut self) {
        self.counts.inactive_internal += 5;
    }
}

fn violation(msg: String) -> ReclaimError {
    ReclaimError::InvariantViolation(msg)
}

pub struct QueueIter<'a> {
    queues: &'a PageQueues,
    cursor: Option<PageIdx>,
}

impl Iterator for QueueIter<'_> {
    type Item = PageIdx;

    fn next(&mut self) -> Option<PageIdx> {
        let idx = self.cursor?;
        self.cursor = self.queues.pages[idx.index()].next;
        Some(idx)
    }
}
