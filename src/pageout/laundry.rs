#![allow(missing_docs)]

use serde::Serialize;

use crate::vm::LaundryKind;

/// Bookkeeping for one laundry (pageout) queue.
///
/// The pending list itself is an arena list owned by
/// [`crate::vm::PageQueues`]; this struct carries the depth and throttle
/// state. All fields are mutated under the page-queue lock.
#[derive(Debug, Clone)]
pub struct LaundryQueue {
    kind: LaundryKind,
    depth: u32,
    max_depth: u32,
    throttle_at: u32,
    throttled: bool,
    draining: bool,
    in_flight: u32,
    enqueued_total: u64,
    throttle_events: u64,
}

/// Serializable view of a laundry queue.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct LaundrySnapshot {
    pub kind: LaundryKind,
    pub depth: u32,
    pub max_depth: u32,
    pub throttled: bool,
    pub draining: bool,
    pub in_flight: u32,
    pub enqueued_total: u64,
    pub throttle_events: u64,
}

impl LaundryQueue {
    pub fn new(kind: LaundryKind, max_depth: u32, throttle_at: u32) -> Self {
        Self {
            kind,
            depth: 0,
            max_depth,
            throttle_at: throttle_at.clamp(1, max_depth.max(1)),
            throttled: false,
            draining: false,
            in_flight: 0,
            enqueued_total: 0,
            throttle_events: 0,
        }
    }

    pub fn kind(&self) -> LaundryKind {
        self.kind
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Producers must not add pages once the depth reaches the throttle mark.
    pub fn is_throttled(&self) -> bool {
        self.depth >= self.throttle_at
    }

    /// Whether some producer was turned away and is waiting for the drain.
    pub fn producers_waiting(&self) -> bool {
        self.throttled
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// A producer found the queue throttled.
    pub(crate) fn mark_throttled(&mut self) {
        if !self.throttled {
            self.throttle_events += 1;
        }
        self.throttled = true;
    }

    pub(crate) fn note_enqueue(&mut self) {
        self.depth += 1;
        self.enqueued_total += 1;
    }

    pub(crate) fn note_dequeue(&mut self, in_flight: bool) {
        self.depth = self.depth.saturating_sub(1);
        if in_flight {
            self.in_flight += 1;
        }
    }

    pub(crate) fn begin_drain(&mut self) {
        self.draining = true;
    }

    pub(crate) fn finish_in_flight(&mut self, pages: u32) {
        self.in_flight = self.in_flight.saturating_sub(pages);
    }

    /// Ends a drain; returns true when waiting producers may now proceed.
    pub(crate) fn release_throttle(&mut self) -> bool {
        self.draining = false;
        if self.throttled && !self.is_throttled() {
            self.throttled = false;
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> LaundrySnapshot {
        LaundrySnapshot {
            kind: self.kind,
            depth: self.depth,
            max_depth: self.max_depth,
            throttled: self.is_throttled(),
            draining: self.draining,
            in_flight: self.in_flight,
            enqueued_total: self.enqueued_total,
            throttle_events: self.throttle_events,
        }
    }
}
