// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A wait primitive paired with a monotonically increasing generation
/// counter.
///
/// The counter closes the classic race between deciding to sleep and
/// actually sleeping: a waiter samples the generation with [`load`],
/// re-checks its predicate, and only then parks with [`wait`]. Any
/// [`notify_one`]/[`notify_all`] ordered after the `load` bumps the
/// generation, so the `wait` observes a different value and returns without
/// sleeping. Nothing is lost in the gap.
///
/// The executor parks idle workers and the timer thread on this, and
/// [`Task::wait`] blocks on the promise's finished condition.
///
/// [`load`]: Self::load
/// [`wait`]: Self::wait
/// [`notify_one`]: Self::notify_one
/// [`notify_all`]: Self::notify_all
/// [`Task::wait`]: crate::task::Task::wait
#[derive(Debug, Default)]
pub struct AtomicCondition {
    generation: AtomicU64,
    lock: Mutex<()>,
    waiters: Condvar,
}

// === impl AtomicCondition ===

impl AtomicCondition {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            lock: Mutex::new(()),
            waiters: Condvar::new(),
        }
    }

    /// Samples the current generation.
    #[inline]
    pub fn load(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Parks the calling thread until the generation moves past `observed`.
    ///
    /// Returns immediately if a notification already happened since
    /// `observed` was sampled.
    pub fn wait(&self, observed: u64) {
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.generation.load(Ordering::Acquire) == observed {
            guard = self
                .waiters
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `true` when woken by a notification, `false` when the
    /// timeout elapsed with the generation unchanged.
    pub fn wait_timeout(&self, observed: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.generation.load(Ordering::Acquire) == observed {
            let now = Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return false;
            };
            let (g, _timed_out) = self
                .waiters
                .wait_timeout(guard, remaining)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
        true
    }

    /// Bumps the generation and wakes one parked waiter.
    pub fn notify_one(&self) {
        // The bump has to happen under the lock: a waiter that re-checked
        // its predicate but hasn't reached `Condvar::wait` yet still holds
        // the lock, so the bump (and the wake) cannot slip past it.
        drop(self.lock.lock().unwrap_or_else(|e| e.into_inner()));
        self.generation.fetch_add(1, Ordering::Release);
        self.waiters.notify_one();
    }

    /// Bumps the generation and wakes every parked waiter.
    pub fn notify_all(&self) {
        drop(self.lock.lock().unwrap_or_else(|e| e.into_inner()));
        self.generation.fetch_add(1, Ordering::Release);
        self.waiters.notify_all();
    }
}
