#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

/// Wake-up channel shared by a pool of threads.
///
/// Each `ring` stores at most one pending token per slot, so a burst of
/// producers wakes at most `capacity` sleepers. A sleeper consumes one token.
#[derive(Clone)]
pub struct Doorbell {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Doorbell {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Wakes one waiter. Returns false when enough wake-ups are already pending.
    pub fn ring(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => false,
        }
    }

    /// Wakes up to `n` waiters.
    pub fn ring_many(&self, n: usize) -> usize {
        (0..n).take_while(|_| self.ring()).count()
    }

    /// Blocks until rung or until `timeout` elapses; returns whether it was rung.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Consumes a pending wake-up without blocking.
    pub fn try_take(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Number of undelivered wake-ups.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Retry policy for opportunistic lock acquisition.
///
/// The first half of the attempts spin, the rest yield the CPU. Nothing here
/// ever blocks on the lock itself.
#[derive(Copy, Clone, Debug)]
pub struct Backoff {
    attempts: u32,
}

impl Backoff {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Calls `f` until it yields a value or the attempts run out.
    pub fn retry<T>(&self, mut f: impl FnMut() -> Option<T>) -> Option<T> {
        for attempt in 0..self.attempts {
            if let Some(value) = f() {
                return Some(value);
            }
            if attempt + 1 == self.attempts {
                break;
            }
            if attempt < self.attempts / 2 {
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
        None
    }
}
