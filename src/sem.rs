//! Counting and binary semaphores with timeouts.
//!
//! Used for the interrupt-to-task handoff, the acknowledge wait of a
//! handshaked write and the request/confirmation rendezvous.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
    max: u32,
}

impl Semaphore {
    /// Binary semaphore, signalling an already signalled semaphore is a
    /// no-op.
    pub fn binary() -> Self {
        Self::with_max(1)
    }

    pub fn counting() -> Self {
        Self::with_max(u32::MAX)
    }

    fn with_max(max: u32) -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
            max,
        }
    }

    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count < self.max {
            *count += 1;
        }
        self.cond.notify_one();
    }

    /// Take the semaphore if it is signalled
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Wait up to `timeout` for the semaphore.  Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .cond
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *count -= 1;
        true
    }

    /// Drop any pending signals
    pub fn clear(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = 0;
    }
}
