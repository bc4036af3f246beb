#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::types::{PageIdx, ReclaimError, Result};

struct FreeInner {
    pages: Vec<PageIdx>,
    waiters: u32,
}

/// Global free-page list and the rendezvous point for blocked allocators.
///
/// The count is readable without the lock; it is only written with the lock
/// held.
pub struct FreeList {
    inner: Mutex<FreeInner>,
    available: Condvar,
    count: AtomicU32,
    waiters: AtomicU32,
}

impl FreeList {
    /// Starts with every page in `0..total` free.
    pub fn new(total: u32) -> Self {
        // Lowest indices are handed out first.
        let pages: Vec<PageIdx> = (0..total).rev().map(PageIdx).collect();
        Self {
            inner: Mutex::new(FreeInner { pages, waiters: 0 }),
            available: Condvar::new(),
            count: AtomicU32::new(total),
            waiters: AtomicU32::new(0),
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Threads blocked waiting for a free page.
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }

    pub fn try_grab(&self) -> Option<PageIdx> {
        let mut inner = self.inner.lock();
        let page = inner.pages.pop()?;
        self.count.store(inner.pages.len() as u32, Ordering::Release);
        Some(page)
    }

    /// Takes a free page, blocking while none is available.
    ///
    /// `on_empty` runs each time the caller is about to sleep, with the free
    /// lock held; it must not block. Returns `Exhausted` once `timeout`
    /// elapses and `ShuttingDown` when `stop` is raised.
    pub fn grab_blocking(
        &self,
        timeout: Duration,
        stop: &AtomicBool,
        mut on_empty: impl FnMut(),
    ) -> Result<PageIdx> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(page) = inner.pages.pop() {
                self.count.store(inner.pages.len() as u32, Ordering::Release);
                return Ok(page);
            }
            if stop.load(Ordering::Acquire) {
                return Err(ReclaimError::ShuttingDown);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReclaimError::Exhausted);
            }
            on_empty();
            inner.waiters += 1;
            self.waiters.store(inner.waiters, Ordering::Release);
            trace!(waiters = inner.waiters, "freelist.wait");
            // Short slices so a raised stop flag is noticed promptly.
            let slice = (deadline - now).min(Duration::from_millis(10));
            self.available.wait_for(&mut inner, slice);
            inner.waiters -= 1;
            self.waiters.store(inner.waiters, Ordering::Release);
        }
    }

    /// Returns pages to the list and wakes blocked allocators.
    pub fn release_batch(&self, batch: &[PageIdx]) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.pages.extend_from_slice(batch);
        self.count.store(inner.pages.len() as u32, Ordering::Release);
        let woken = inner.waiters > 0;
        drop(inner);
        if woken {
            self.available.notify_all();
        }
    }

    /// Wakes every blocked allocator so it can observe shutdown.
    pub fn wake_all(&self) {
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn grabs_lowest_first_and_counts() {
        let free = FreeList::new(4);
        assert_eq!(free.try_grab(), Some(PageIdx(0)));
        assert_eq!(free.count(), 3);
        free.release_batch(&[PageIdx(0)]);
        assert_eq!(free.count(), 4);
    }

    #[test]
    fn blocked_allocator_wakes_on_release() {
        let free = Arc::new(FreeList::new(1));
        let stop = Arc::new(AtomicBool::new(false));
        let page = free.try_grab().expect("one free page");
        let waiter = {
            let free = Arc::clone(&free);
            let stop = Arc::clone(&stop);
            thread::spawn(move || free.grab_blocking(Duration::from_secs(5), &stop, || {}))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while free.waiters() == 0 && Instant::now() < deadline {
            thread::yield_now();
        }
        free.release_batch(&[page]);
        let got = waiter.join().expect("waiter thread").expect("page");
        assert_eq!(got, page);
        assert_eq!(free.waiters(), 0);
    }

    #[test]
    fn empty_list_times_out_or_stops() {
        let free = FreeList::new(0);
        let stop = AtomicBool::new(false);
        let mut rang = 0;
        let err = free.grab_blocking(Duration::from_millis(5), &stop, || rang += 1);
        assert!(matches!(err, Err(ReclaimError::Exhausted)));
        assert!(rang > 0);
        stop.store(true, Ordering::Release);
        let err = free.grab_blocking(Duration::from_secs(5), &stop, || {});
        assert!(matches!(err, Err(ReclaimError::ShuttingDown)));
    }
}
