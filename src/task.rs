// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod state;

use core::any::type_name;
use core::fmt;
use core::mem::{self, ManuallyDrop};
use core::pin::Pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::TaskContext;
use crate::error::{AsyncError, AsyncErrorCode, AsyncResult};
use crate::executor::{self, ExecutorRef};
use crate::sync::{AtomicCondition, PollWaitError, WaitCell};
use crate::task::state::{EndPoll, Lifecycle};
use crate::work::WorkItem;

/// A lazily started asynchronous computation producing an
/// [`AsyncResult<T>`].
///
/// The body never runs on its own: it starts when the task is
/// [scheduled](Self::schedule) onto a [`TaskContext`]'s executor, or when
/// the task is first `.await`ed (which also adopts the awaiting worker's
/// executor if the task has none). Exactly one start wins; later attempts
/// are no-ops.
///
/// The handle is move-only. Awaiting it or calling [`get`](Self::get)
/// takes the result; dropping it detaches the task, which keeps running to
/// completion on its executor.
///
/// Failures are values: the body reports errors by returning
/// `Err(AsyncError)`, a panic inside the body becomes
/// [`AsyncErrorCode::Fault`], and a cancelled suspension point resumes
/// with [`AsyncErrorCode::Canceled`].
///
/// [`get`]: Self::get
pub struct Task<T> {
    core: Arc<Core<T>>,
}

/// A type-erased, reference-counted handle to one resumption of a spawned
/// task.
///
/// The scheduler moves these around instead of the typed promise: queues
/// and wakers would otherwise be monomorphized per task body, which blows
/// up compile time for zero benefit on the hot path.
pub(crate) struct TaskRef(Arc<dyn RawTask>);

pub(crate) trait RawTask: Send + Sync {
    /// Runs the task body until its next suspension point.
    fn poll_task(self: Arc<Self>);
    fn task_id(&self) -> u64;
}

/// The current stage of the task body: the body itself, or its published
/// result.
enum Stage<T> {
    /// The body has not finished.
    Pending(Pin<Box<dyn Future<Output = AsyncResult<T>> + Send>>),
    /// Finished; the result waits for a `get`/`.await` to take it.
    Ready(AsyncResult<T>),
    /// Finished and the result was taken (or was never wanted).
    Consumed,
}

/// The promise: everything the running body, the executor, and the
/// handle-side observers share.
struct Core<T> {
    id: u64,
    /// Scheduling word, see [`state`].
    lifecycle: Lifecycle,
    /// Exactly-once start latch (`try_schedule` / first await).
    started: AtomicBool,
    /// Publication flag: once set (release), `stage` holds the immutable
    /// result.
    finished: AtomicBool,
    has_error: AtomicBool,
    /// `AsyncErrorCode` discriminant, valid while `has_error` is set.
    error_code: AtomicU8,
    /// Body/result slot. Locked only by the single poller (guaranteed by
    /// `lifecycle`) and by result takers after `finished`.
    stage: Mutex<Stage<T>>,
    /// The authoritative executor of this task. The handle holds no copy.
    executor: spin::Mutex<ExecutorRef>,
    /// Continuation slot: the waker of whoever awaits this task.
    join_waker: WaitCell,
    /// Backs the blocking [`Task::wait`].
    finished_cond: AtomicCondition,
    span: tracing::Span,
    #[cfg(feature = "capture-unwind")]
    panic: Mutex<Option<Box<dyn core::any::Any + Send>>>,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

// === impl Task ===

impl<T: Send + 'static> Task<T> {
    /// Creates an unscheduled task with no executor.
    ///
    /// Until it is scheduled through a [`TaskContext`] or awaited from a
    /// pool worker, the task has nowhere to run; scheduling it against an
    /// invalid executor completes it with
    /// [`AsyncErrorCode::InvalidState`].
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = AsyncResult<T>> + Send + 'static,
    {
        Self {
            core: Core::allocate(future, ExecutorRef::invalid()),
        }
    }

    /// Creates an unscheduled task that has already captured `ctx`'s
    /// executor.
    pub fn with_context<F>(ctx: &TaskContext, future: F) -> Self
    where
        F: Future<Output = AsyncResult<T>> + Send + 'static,
    {
        Self {
            core: Core::allocate(future, ctx.executor()),
        }
    }

    /// Starts the task on `ctx`'s executor.
    ///
    /// Only the first call (across `try_schedule`, [`schedule`] and
    /// `.await`) starts the body; later calls return `false`. If `ctx`'s
    /// executor is invalid the task completes synchronously with
    /// [`AsyncErrorCode::InvalidState`] and `false` is returned.
    ///
    /// [`schedule`]: Self::schedule
    pub fn try_schedule(&self, ctx: &TaskContext) -> bool {
        if self
            .core
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let exec = ctx.executor();
        *self.core.executor.lock() = exec;

        if !exec.is_valid() {
            Core::complete_with(&self.core, Err(AsyncError::invalid_state()));
            return false;
        }

        Core::wake(&self.core);
        true
    }

    /// [`try_schedule`](Self::try_schedule), discarding the outcome.
    pub fn schedule(&self, ctx: &TaskContext) {
        let _ = self.try_schedule(ctx);
    }

    /// Blocks the calling thread until the task finishes.
    ///
    /// Must not be called from a pool worker that the task needs to make
    /// progress.
    pub fn wait(&self) {
        while !self.core.finished.load(Ordering::Acquire) {
            let observed = self.core.finished_cond.load();
            if self.core.finished.load(Ordering::Acquire) {
                break;
            }
            self.core.finished_cond.wait(observed);
        }
    }

    /// Blocks until the task finishes and takes its result.
    ///
    /// The result can be taken once; afterwards (and after an `.await`
    /// consumed it) this reports [`AsyncErrorCode::InvalidState`].
    ///
    /// With the `capture-unwind` feature enabled, a panic that faulted the
    /// task is re-raised here instead.
    pub fn get(&self) -> AsyncResult<T> {
        self.wait();

        #[cfg(feature = "capture-unwind")]
        if let Some(payload) = self
            .core
            .panic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            std::panic::resume_unwind(payload);
        }

        Core::take_result(&self.core)
    }

    /// `true` once the result is published. Terminal.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.core.finished.load(Ordering::Acquire)
    }

    /// `true` while the task has started but not yet finished.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.started.load(Ordering::Acquire) && !self.is_completed()
    }

    /// `true` when the task finished with any error.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.core.has_error.load(Ordering::Acquire)
    }

    /// `true` when the task finished with [`AsyncErrorCode::Canceled`].
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.is_faulted()
            && self.core.error_code.load(Ordering::Acquire) == AsyncErrorCode::Canceled as u8
    }

    /// The task's id, unique among currently live tasks.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.core.id
    }
}

impl<T: Send + 'static> Future for Task<T> {
    type Output = AsyncResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let core = &self.core;

        // First await starts the task, adopting the current worker's
        // executor when the task has none of its own.
        if !core.started.load(Ordering::Acquire) {
            Core::start_for_await(core);
        }

        loop {
            if core.finished.load(Ordering::Acquire) {
                return Poll::Ready(Core::take_result(core));
            }

            match core.join_waker.poll_wait(cx) {
                Poll::Pending => {
                    // Registered. Re-check so a completion that slipped in
                    // between the check above and the registration cannot
                    // strand us.
                    if core.finished.load(Ordering::Acquire) {
                        return Poll::Ready(Core::take_result(core));
                    }
                    return Poll::Pending;
                }
                // a wakeup was already pending, consume it and re-check
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(PollWaitError::Busy)) => {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Poll::Ready(Err(PollWaitError::Closed)) => {
                    return Poll::Ready(Core::take_result(core));
                }
            }
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("started", &self.core.started.load(Ordering::Relaxed))
            .field("finished", &self.core.finished.load(Ordering::Relaxed))
            .finish()
    }
}

// === impl Core ===

impl<T: Send + 'static> Core<T> {
    fn allocate<F>(future: F, executor: ExecutorRef) -> Arc<Self>
    where
        F: Future<Output = AsyncResult<T>> + Send + 'static,
    {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::trace_span!(
            "task",
            task.id = id,
            task.output = %type_name::<T>(),
        );

        Arc::new(Self {
            id,
            lifecycle: Lifecycle::new(),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            has_error: AtomicBool::new(false),
            error_code: AtomicU8::new(AsyncErrorCode::Ok as u8),
            stage: Mutex::new(Stage::Pending(Box::pin(future))),
            executor: spin::Mutex::new(executor),
            join_waker: WaitCell::new(),
            finished_cond: AtomicCondition::new(),
            span,
            #[cfg(feature = "capture-unwind")]
            panic: Mutex::new(None),
        })
    }

    /// Start triggered by the first `.await` rather than an explicit
    /// schedule.
    fn start_for_await(this: &Arc<Self>) {
        if this
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let exec = {
            let mut slot = this.executor.lock();
            if !slot.is_valid() {
                // Inherit the executor of whoever awaits first.
                *slot = executor::current();
            }
            *slot
        };

        if exec.is_valid() {
            Self::wake(this);
        } else {
            Self::complete_with(this, Err(AsyncError::invalid_state()));
        }
    }

    /// Requests a resumption: on success the task is enqueued on its
    /// executor, or resumed inline when it never captured one.
    fn wake(this: &Arc<Self>) {
        if !this.lifecycle.transition_to_scheduled() {
            return;
        }

        let exec = *this.executor.lock();
        if exec.is_valid() {
            exec.execute(WorkItem::task(TaskRef::new(Arc::clone(this) as Arc<dyn RawTask>)));
        } else {
            Self::poll_body(Arc::clone(this));
        }
    }

    /// Runs the body until its next suspension point. Called through
    /// [`WorkItem::invoke`]; harmless on completed tasks.
    fn poll_body(self: Arc<Self>) {
        if !self.lifecycle.transition_to_polling() {
            return;
        }

        let _entered = self.span.clone().entered();
        tracing::trace!(task.id = self.id, "polling task body");

        // Safety: the vtable below upholds the RawWaker contract; the
        // cloned Arc's count is owned by the waker and released by its
        // drop fn.
        let waker = unsafe { Waker::from_raw(Self::raw_waker(Arc::clone(&self))) };
        let mut cx = Context::from_waker(&waker);

        let completion = {
            let mut stage = self.stage.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *stage {
                Stage::Pending(future) => {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| {
                        future.as_mut().poll(&mut cx)
                    })) {
                        Ok(Poll::Pending) => None,
                        Ok(Poll::Ready(result)) => Some(result),
                        Err(payload) => {
                            tracing::warn!(task.id = self.id, "task body panicked");
                            #[cfg(feature = "capture-unwind")]
                            {
                                *self.panic.lock().unwrap_or_else(|e| e.into_inner()) =
                                    Some(payload);
                            }
                            #[cfg(not(feature = "capture-unwind"))]
                            drop(payload);
                            Some(Err(AsyncError::fault()))
                        }
                    }
                }
                _ => None,
            }
        };

        match completion {
            Some(result) => Self::complete_with(&self, result),
            None => {
                if self.lifecycle.transition_from_polling() == EndPoll::Reschedule {
                    let exec = *self.executor.lock();
                    if exec.is_valid() {
                        exec.execute(WorkItem::task(TaskRef::new(
                            Arc::clone(&self) as Arc<dyn RawTask>,
                        )));
                    } else {
                        Self::poll_body(self);
                    }
                }
            }
        }
    }

    /// Publishes the result. The single publication point: stores the
    /// result, flips `finished` (release), unblocks synchronous waiters
    /// and wakes the continuation, in that order.
    fn complete_with(this: &Arc<Self>, result: AsyncResult<T>) {
        {
            let mut stage = this.stage.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*stage, Stage::Ready(_) | Stage::Consumed) {
                return;
            }
            if let Err(err) = &result {
                this.error_code.store(err.code as u8, Ordering::Release);
                this.has_error.store(true, Ordering::Release);
            }
            *stage = Stage::Ready(result);
        }

        this.lifecycle.transition_to_complete();
        this.finished.store(true, Ordering::Release);
        this.finished_cond.notify_all();
        this.join_waker.wake();

        tracing::trace!(task.id = this.id, "task finished");
    }

    /// Takes the published result; a second take reports `InvalidState`.
    fn take_result(this: &Arc<Self>) -> AsyncResult<T> {
        let mut stage = this.stage.lock().unwrap_or_else(|e| e.into_inner());
        match &*stage {
            Stage::Ready(_) => match mem::replace(&mut *stage, Stage::Consumed) {
                Stage::Ready(result) => result,
                _ => unreachable!(),
            },
            _ => Err(AsyncError::invalid_state()),
        }
    }

    // === waker vtable ===

    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::waker_clone,
        Self::waker_wake,
        Self::waker_wake_by_ref,
        Self::waker_drop,
    );

    // `Waker::will_wake` compares data and vtable pointers; if this gets
    // inlined, every clone may observe a different vtable address and
    // callers re-register wakers over and over. The `inline(never)` is
    // load-bearing.
    #[inline(never)]
    fn raw_waker(this: Arc<Self>) -> RawWaker {
        RawWaker::new(Arc::into_raw(this).cast::<()>(), &Self::WAKER_VTABLE)
    }

    unsafe fn waker_clone(raw: *const ()) -> RawWaker {
        // Safety: `raw` came out of `Arc::into_raw` in `raw_waker`
        unsafe { Arc::increment_strong_count(raw.cast::<Self>()) };
        RawWaker::new(raw, &Self::WAKER_VTABLE)
    }

    unsafe fn waker_wake(raw: *const ()) {
        // Safety: consumes the count owned by this waker
        let this = unsafe { Arc::from_raw(raw.cast::<Self>()) };
        Self::wake(&this);
    }

    unsafe fn waker_wake_by_ref(raw: *const ()) {
        // Safety: borrows the count owned by the waker without consuming it
        let this = unsafe { ManuallyDrop::new(Arc::from_raw(raw.cast::<Self>())) };
        Self::wake(&this);
    }

    unsafe fn waker_drop(raw: *const ()) {
        // Safety: releases the count owned by this waker
        drop(unsafe { Arc::from_raw(raw.cast::<Self>()) });
    }
}

impl<T: Send + 'static> RawTask for Core<T> {
    fn poll_task(self: Arc<Self>) {
        self.poll_body();
    }

    fn task_id(&self) -> u64 {
        self.id
    }
}

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn new(raw: Arc<dyn RawTask>) -> Self {
        Self(raw)
    }

    /// Runs the referenced task until its next suspension point.
    pub(crate) fn poll(self) {
        let TaskRef(raw) = self;
        raw.poll_task();
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.0.task_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::WorkStealingExecutor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn pool_ctx(workers: usize) -> (WorkStealingExecutor, TaskContext) {
        let pool = WorkStealingExecutor::new(workers);
        let ctx = TaskContext::new(pool.executor());
        (pool, ctx)
    }

    #[test]
    fn schedule_runs_the_body_and_publishes_the_result() {
        let (_pool, ctx) = pool_ctx(1);

        let task = Task::new(async { Ok(2 + 2) });
        assert!(task.try_schedule(&ctx));
        assert_eq!(task.get(), Ok(4));
        assert!(task.is_completed());
        assert!(!task.is_faulted());
    }

    #[test]
    fn schedule_is_exactly_once() {
        let (_pool, ctx) = pool_ctx(1);

        let task = Task::new(async { Ok(()) });
        assert!(task.try_schedule(&ctx));
        assert!(!task.try_schedule(&ctx));
        assert!(!task.try_schedule(&ctx));
        assert_eq!(task.get(), Ok(()));
    }

    #[test]
    fn invalid_executor_faults_the_task() {
        let ctx = TaskContext::new(ExecutorRef::invalid());

        let task: Task<()> = Task::new(async {
            panic!("the body of an unschedulable task must never run");
        });
        assert!(!task.try_schedule(&ctx));
        assert!(task.is_completed());
        assert!(task.is_faulted());
        assert_eq!(task.get(), Err(AsyncError::invalid_state()));
    }

    #[test]
    fn result_can_be_taken_only_once() {
        let (_pool, ctx) = pool_ctx(1);

        let task = Task::new(async { Ok(1) });
        task.schedule(&ctx);
        assert_eq!(task.get(), Ok(1));
        assert_eq!(task.get(), Err(AsyncError::invalid_state()));
    }

    #[test]
    fn awaiting_a_child_lends_it_the_awaiters_executor() {
        let (_pool, ctx) = pool_ctx(2);

        let outer = ctx.run(async {
            // never scheduled explicitly and has no executor of its own
            let child = Task::new(async { Ok(7) });
            child.await
        });

        assert_eq!(outer.get(), Ok(7));
    }

    #[test]
    fn panicking_body_reports_fault() {
        let (_pool, ctx) = pool_ctx(1);

        let task: Task<()> = Task::new(async {
            panic!("boom");
        });
        task.schedule(&ctx);

        let err = task.get().unwrap_err();
        assert_eq!(err.code, AsyncErrorCode::Fault);
        assert!(task.is_faulted());
        assert!(!task.is_canceled());
    }

    #[test]
    fn dropping_the_handle_detaches_the_task() {
        let (_pool, ctx) = pool_ctx(1);
        let hits = Arc::new(AtomicUsize::new(0));

        let task = ctx.run({
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::Release);
                Ok(())
            }
        });
        drop(task);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::Acquire) == 0 {
            assert!(std::time::Instant::now() < deadline, "detached task never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn wait_blocks_until_completion() {
        let (_pool, ctx) = pool_ctx(1);

        let task = ctx.run(async {
            std::thread::sleep(Duration::from_millis(50));
            Ok(42)
        });
        task.wait();
        assert!(task.is_completed());
        assert_eq!(task.get(), Ok(42));
    }
}
