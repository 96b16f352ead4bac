// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::executor::queue::{InjectionQueue, WorkerQueue};
use crate::executor::timer::TimerHeap;
use crate::executor::{EnterGuard, ExecutorRef, RawExecutor};
use crate::sync::AtomicCondition;
use crate::work::WorkItem;

/// Configures and spawns a [`WorkStealingExecutor`].
#[derive(Debug, Clone)]
pub struct Builder {
    workers: Option<usize>,
    name: String,
}

/// A fixed pool of worker threads with one run deque per worker, a shared
/// injection queue, and a dedicated timer thread driving a deadline
/// min-heap.
///
/// Work submitted from one of the pool's own workers lands on that
/// worker's deque and runs in LIFO order with respect to that worker's own
/// pushes; everything else goes through the injection queue. Idle workers
/// first drain the injection queue, then steal from their siblings'
/// deques, head first, so stolen work preserves FIFO order from the
/// producer's point of view. No ordering is promised across threads.
#[derive(Debug)]
pub struct WorkStealingExecutor {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Shared {
    workers: Box<[WorkerQueue]>,
    injection: InjectionQueue,
    timers: TimerHeap,
    work_cond: AtomicCondition,
    timer_cond: AtomicCondition,
    stop: AtomicBool,
    steals: AtomicUsize,
    /// One strong count is intentionally leaked the first time an
    /// [`ExecutorRef`] is handed out, pinning this allocation for the rest
    /// of the process so outstanding refs can never dangle. Submissions
    /// after shutdown are dropped.
    pinned: AtomicBool,
}

thread_local! {
    /// Identity of the pool worker running this thread: the `Shared`
    /// allocation it belongs to, plus its worker index.
    static CURRENT_WORKER: Cell<(*const Shared, usize)> = const { Cell::new((ptr::null(), 0)) };
}

// === impl Builder ===

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: None,
            name: "ngin.pool".to_owned(),
        }
    }

    /// Sets the number of worker threads.
    ///
    /// Zero is honored: such a pool runs nothing on its own (apart from
    /// due timers being queued) and is drained by [`run_one`]. When not
    /// set, the hardware concurrency is used, clamped to at least one.
    ///
    /// [`run_one`]: WorkStealingExecutor::run_one
    #[must_use]
    pub fn worker_threads(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Thread name prefix; workers are named `<prefix>.<index>`, the timer
    /// thread `<prefix>.timer`.
    #[must_use]
    pub fn name(mut self, prefix: impl Into<String>) -> Self {
        self.name = prefix.into();
        self
    }

    #[must_use]
    pub fn build(self) -> WorkStealingExecutor {
        let workers = self.workers.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
                .max(1)
        });

        let shared = Arc::new(Shared {
            workers: (0..workers).map(|_| WorkerQueue::new()).collect(),
            injection: InjectionQueue::new(),
            timers: TimerHeap::new(),
            work_cond: AtomicCondition::new(),
            timer_cond: AtomicCondition::new(),
            stop: AtomicBool::new(false),
            steals: AtomicUsize::new(0),
            pinned: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(workers + 1);
        for index in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}.{index}", self.name))
                .spawn(move || worker_main(&shared, index))
                .expect("failed to spawn pool worker thread");
            threads.push(handle);
        }
        {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}.timer", self.name))
                .spawn(move || timer_main(&shared))
                .expect("failed to spawn pool timer thread");
            threads.push(handle);
        }

        WorkStealingExecutor {
            shared,
            threads: Mutex::new(threads),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// === impl WorkStealingExecutor ===

impl WorkStealingExecutor {
    /// Spawns a pool with `workers` worker threads (plus the timer
    /// thread). See [`Builder`] for the remaining knobs.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Builder::new().worker_threads(workers).build()
    }

    /// A schedulable capability for this pool.
    ///
    /// The ref stays callable for the life of the process; once the pool
    /// has been [shut down](Self::shutdown), submissions through it are
    /// silently dropped.
    #[must_use]
    pub fn executor(&self) -> ExecutorRef {
        executor_ref(&self.shared)
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// How many work items have been stolen across workers so far.
    #[must_use]
    pub fn steal_count(&self) -> usize {
        self.shared.steals.load(Ordering::Relaxed)
    }

    /// Dequeues and runs one work item on the calling thread.
    ///
    /// Tries the caller's own deque (if the caller is one of this pool's
    /// workers), then the injection queue, then steals. Returns `false`
    /// when nothing was runnable.
    pub fn run_one(&self) -> bool {
        let Some(mut item) = self.shared.try_dequeue() else {
            return false;
        };
        let _guard = EnterGuard::enter(self.executor());
        item.invoke();
        true
    }

    /// Runs work items on the calling thread until none are immediately
    /// runnable.
    pub fn run_until_idle(&self) {
        while self.run_one() {}
    }

    /// Discards every pending submission: all worker deques, the injection
    /// queue, and the timer heap.
    ///
    /// Work already mid-invocation is not preempted, and cancellation
    /// tokens are not triggered; this only empties the queues.
    pub fn cancel_all(&self) {
        self.shared.injection.clear();
        for worker in &self.shared.workers {
            worker.clear();
        }
        self.shared.timers.clear();
        self.shared.work_cond.notify_all();
        self.shared.timer_cond.notify_all();
    }

    /// Stops the pool and joins every thread. Idempotent; also performed
    /// on drop.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.work_cond.notify_all();
        self.shared.timer_cond.notify_all();

        let threads = core::mem::take(
            &mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl RawExecutor for WorkStealingExecutor {
    fn execute(&self, item: WorkItem) {
        self.shared.submit(item);
    }

    fn execute_at(&self, item: WorkItem, deadline: Instant) {
        self.shared.submit_at(item, deadline);
    }
}

impl Drop for WorkStealingExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn executor_ref(shared: &Arc<Shared>) -> ExecutorRef {
    if !shared.pinned.swap(true, Ordering::AcqRel) {
        // Leak one strong count so the allocation outlives the pool.
        let _ = Arc::into_raw(Arc::clone(shared));
    }
    // Safety: the leaked strong count above keeps the target alive for the
    // rest of the process.
    unsafe { ExecutorRef::new_unchecked(&**shared) }
}

// === impl Shared ===

impl Shared {
    /// The index of the calling thread's deque, when the caller is one of
    /// this pool's workers.
    fn local_worker(&self) -> Option<usize> {
        let (pool, index) = CURRENT_WORKER.with(Cell::get);
        (ptr::eq(pool, self)).then_some(index)
    }

    fn submit(&self, item: WorkItem) {
        if self.stop.load(Ordering::Acquire) {
            tracing::trace!(?item, "dropping submission to a stopped pool");
            return;
        }

        if let Some(index) = self.local_worker() {
            self.workers[index].push(item);
        } else {
            self.injection.push(item);
        }
        self.work_cond.notify_one();
    }

    fn submit_at(&self, item: WorkItem, deadline: Instant) {
        if deadline <= Instant::now() {
            self.submit(item);
            return;
        }
        if self.stop.load(Ordering::Acquire) {
            tracing::trace!(?item, "dropping timed submission to a stopped pool");
            return;
        }
        if self.timers.push(item, deadline) {
            // New soonest deadline, the timer thread must recompute its
            // sleep.
            self.timer_cond.notify_one();
        }
    }

    /// Local pop, then injection drain, then a round-robin stealing sweep
    /// starting at `(self + 1) % N`.
    fn try_dequeue(&self) -> Option<WorkItem> {
        let local = self.local_worker();

        if let Some(index) = local
            && let Some(item) = self.workers[index].pop()
        {
            return Some(item);
        }

        if let Some(item) = self.injection.pop() {
            return Some(item);
        }

        let workers = self.workers.len();
        if workers == 0 {
            return None;
        }
        let start = local.map_or(0, |index| index + 1);
        for offset in 0..workers {
            let victim = (start + offset) % workers;
            if Some(victim) == local {
                continue;
            }
            if let Some(item) = self.workers[victim].steal() {
                self.steals.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(victim, "stole work item");
                return Some(item);
            }
        }

        None
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
    let _span = tracing::debug_span!("worker main loop", worker = index).entered();

    CURRENT_WORKER.with(|current| current.set((Arc::as_ptr(shared), index)));
    let _guard = EnterGuard::enter(executor_ref(shared));

    loop {
        if shared.stop.load(Ordering::Acquire) {
            tracing::debug!(worker = index, "stop signal received, shutting down");
            break;
        }

        if let Some(mut item) = shared.try_dequeue() {
            item.invoke();
            continue;
        }

        // Re-check once after sampling the generation: anything submitted
        // since the sample bumped it, so the park below cannot sleep
        // through it.
        let observed = shared.work_cond.load();
        if let Some(mut item) = shared.try_dequeue() {
            item.invoke();
            continue;
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        tracing::trace!(worker = index, "out of work, parking");
        shared.work_cond.wait(observed);
        tracing::trace!(worker = index, "woke up");
    }

    CURRENT_WORKER.with(|current| current.set((ptr::null(), 0)));
}

fn timer_main(shared: &Arc<Shared>) {
    let _span = tracing::debug_span!("timer main loop").entered();

    let mut due = Vec::new();
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let observed = shared.timer_cond.load();
        let next_deadline = shared.timers.pop_due(Instant::now(), &mut due);

        if !due.is_empty() {
            tracing::trace!(expired = due.len(), "timer entries due");
        }
        // Hand expired entries back through the normal submission path,
        // outside the heap lock.
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
