// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::executor::timer::TimerHeap;
use crate::executor::{EnterGuard, ExecutorRef, RawExecutor};
use crate::fiber::{Fiber, FiberOptions, FiberState};
use crate::sync::AtomicCondition;
use crate::work::WorkItem;

/// Configuration for a [`FiberScheduler`].
#[derive(Debug, Clone)]
pub struct FiberSchedulerOptions {
    pub worker_threads: usize,
    /// Fibers pre-allocated into the pool. Bounds how many jobs can hold
    /// a private stack at once.
    pub fibers: usize,
    pub fiber: FiberOptions,
    /// Thread name prefix; workers become `<prefix>.<index>`, the timer
    /// driver `<prefix>.timer`.
    pub name: String,
}

impl Default for FiberSchedulerOptions {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            fibers: 128,
            fiber: FiberOptions::default(),
            name: "ngin.fiber".to_owned(),
        }
    }
}

/// An executor that runs every work item on a stackful fiber.
///
/// A fixed pool of pre-allocated fibers is shared by a few worker
/// threads: each worker pops a ready item, lends it to an idle fiber as
/// that fiber's job, and resumes the fiber. This exists so that work
/// calling into blocking C APIs, or needing a real call stack for
/// unwinding tooling, can still participate in the same task graph; from
/// the outside it is just another [`RawExecutor`].
#[derive(Debug)]
pub struct FiberScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Shared {
    ready: Mutex<VecDeque<WorkItem>>,
    work_cond: AtomicCondition,
    timers: TimerHeap,
    timer_cond: AtomicCondition,
    fibers: Mutex<Vec<Fiber>>,
    fiber_cond: AtomicCondition,
    stop: AtomicBool,
    pinned: AtomicBool,
}

// === impl FiberScheduler ===

impl FiberScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(FiberSchedulerOptions::default())
    }

    #[must_use]
    pub fn with_options(options: FiberSchedulerOptions) -> Self {
        let workers = options.worker_threads.max(1);
        let fibers = options.fibers.max(workers);

        let shared = Arc::new(Shared {
            ready: Mutex::new(VecDeque::new()),
            work_cond: AtomicCondition::new(),
            timers: TimerHeap::new(),
            timer_cond: AtomicCondition::new(),
            fibers: Mutex::new(
                (0..fibers)
                    .map(|_| Fiber::with_options(&options.fiber))
                    .collect(),
            ),
            fiber_cond: AtomicCondition::new(),
            stop: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(workers + 1);
        for index in 0..workers {
            let shared = Arc::clone(&shared);
            threads.push(
                thread::Builder::new()
                    .name(format!("{}.{index}", options.name))
                    .spawn(move || worker_main(&shared, index))
                    .expect("failed to spawn fiber scheduler worker"),
            );
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(
                thread::Builder::new()
                    .name(format!("{}.timer", options.name))
                    .spawn(move || timer_main(&shared))
                    .expect("failed to spawn fiber scheduler timer"),
            );
        }

        Self {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// A schedulable capability for this scheduler; see
    /// [`WorkStealingExecutor::executor`] for the lifetime contract.
    ///
    /// [`WorkStealingExecutor::executor`]: crate::executor::WorkStealingExecutor::executor
    #[must_use]
    pub fn executor(&self) -> ExecutorRef {
        executor_ref(&self.shared)
    }

    /// Discards every queued submission and pending timer. Fibers
    /// mid-resume finish their current job.
    pub fn cancel_all(&self) {
        self.shared
            .ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.shared.timers.clear();
        self.shared.work_cond.notify_all();
        self.shared.timer_cond.notify_all();
    }

    /// Stops the scheduler and joins every thread. Idempotent; also
    /// performed on drop.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.work_cond.notify_all();
        self.shared.timer_cond.notify_all();
        self.shared.fiber_cond.notify_all();

        let threads = core::mem::take(
            &mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Default for FiberScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RawExecutor for FiberScheduler {
    fn execute(&self, item: WorkItem) {
        self.shared.submit(item);
    }

    fn execute_at(&self, item: WorkItem, deadline: Instant) {
        self.shared.submit_at(item, deadline);
    }
}

impl Drop for FiberScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn executor_ref(shared: &Arc<Shared>) -> ExecutorRef {
    if !shared.pinned.swap(true, Ordering::AcqRel) {
        // Leak one strong count so the allocation outlives the scheduler.
        let _ = Arc::into_raw(Arc::clone(shared));
    }
    // Safety: the leaked strong count above keeps the target alive for
    // the rest of the process.
    unsafe { ExecutorRef::new_unchecked(&**shared) }
}

// === impl Shared ===

impl Shared {
    fn submit(&self, item: WorkItem) {
        if self.stop.load(Ordering::Acquire) {
            tracing::trace!(?item, "dropping submission to a stopped fiber scheduler");
            return;
        }
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
        self.work_cond.notify_one();
    }

    fn submit_at(&self, item: WorkItem, deadline: Instant) {
        if deadline <= Instant::now() {
            self.submit(item);
            return;
        }
        if self.stop.load(Ordering::Acquire) {
            return;
        }
        if self.timers.push(item, deadline) {
            self.timer_cond.notify_one();
        }
    }

    fn pop_ready(&self) -> Option<WorkItem> {
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Takes an idle fiber, parking until one is recycled.
    fn acquire_fiber(&self) -> Option<Fiber> {
        loop {
            if self.stop.load(Ordering::Acquire) {
                return None;
            }
            let observed = self.fiber_cond.load();
            if let Some(fiber) = self
                .fibers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop()
            {
                return Some(fiber);
            }
            self.fiber_cond.wait(observed);
        }
    }

    fn release_fiber(&self, fiber: Fiber) {
        self.fibers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fiber);
        self.fiber_cond.notify_one();
    }
}

impl RawExecutor for Shared {
    fn execute(&self, item: WorkItem) {
        self.submit(item);
    }

    fn execute_at(&self, item: WorkItem, deadline: Instant) {
        self.submit_at(item, deadline);
    }
}

// === worker & timer loops ===

fn worker_main(shared: &Arc<Shared>, index: usize) {
    let _span = tracing::debug_span!("fiber worker main loop", worker = index).entered();
    let _guard = EnterGuard::enter(executor_ref(shared));

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        if let Some(mut item) = shared.pop_ready() {
            let Some(mut fiber) = shared.acquire_fiber() else {
                break;
            };
            fiber.set_job(move || item.invoke());

            loop {
                match fiber.resume() {
                    // a job that used `fiber::yield_now` is driven on
                    FiberState::Idle => continue,
                    FiberState::Completed => break,
                    FiberState::Error => {
                        // `WorkItem::invoke` never unwinds, so this is a
                        // bug in the scheduler itself rather than in user
                        // work.
                        tracing::error!(worker = index, "fiber job unwound unexpectedly");
                        let _ = fiber.join();
                        break;
                    }
                    FiberState::Running => unreachable!("resume returned a running fiber"),
                }
            }
            shared.release_fiber(fiber);
            continue;
        }

        let observed = shared.work_cond.load();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if !shared
            .ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
        {
            continue;
        }
        shared.work_cond.wait(observed);
    }
}

fn timer_main(shared: &Arc<Shared>) {
    let _span = tracing::debug_span!("fiber timer main loop").entered();

    let mut due = Vec::new();
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let observed = shared.timer_cond.load();
        let next_deadline = shared.timers.pop_due(Instant::now(), &mut due);
        for item in due.drain(..) {
            shared.submit(item);
        }

        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        match next_deadline {
            None => shared.timer_cond.wait(observed),
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    continue;
                }
                shared.timer_cond.wait_timeout(observed, deadline - now);
            }
        }
    }
}
