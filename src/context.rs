// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use pin_project::pin_project;

use crate::cancel::{CancellationRegistration, CancellationToken};
use crate::error::{AsyncError, AsyncResult};
use crate::executor::ExecutorRef;
use crate::sync::{PollWaitError, WaitCell};
use crate::task::Task;
use crate::work::WorkItem;

/// Everything a task body needs to interact with its runtime: the executor
/// it lives on and the cancellation token it observes.
///
/// Contexts are cheap to clone and to derive
/// ([`with_token`](Self::with_token)); the convenience producers
/// ([`run`](Self::run), [`delay`](Self::delay),
/// [`yield_now`](Self::yield_now)) build task/awaiter pairs rooted on the
/// same executor.
#[derive(Clone, Debug, Default)]
pub struct TaskContext {
    executor: ExecutorRef,
    token: CancellationToken,
}

// === impl TaskContext ===

impl TaskContext {
    #[must_use]
    pub fn new(executor: ExecutorRef) -> Self {
        Self {
            executor,
            token: CancellationToken::none(),
        }
    }

    /// The same executor observed through a different cancellation token.
    #[must_use]
    pub fn with_token(&self, token: CancellationToken) -> Self {
        Self {
            executor: self.executor,
            token,
        }
    }

    #[must_use]
    pub fn executor(&self) -> ExecutorRef {
        self.executor
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.token.is_cancellation_requested()
    }

    /// Creates a task from `future` and immediately schedules it here.
    pub fn run<T, F>(&self, future: F) -> Task<T>
    where
        T: Send + 'static,
        F: Future<Output = AsyncResult<T>> + Send + 'static,
    {
        let task = Task::with_context(self, future);
        task.schedule(self);
        task
    }

    /// An awaiter that reschedules the running task and lets other ready
    /// work run first.
    #[must_use]
    pub fn yield_now(&self) -> Yield {
        Yield { yielded: false }
    }

    /// An awaiter completing `duration` from the moment it is first
    /// polled, or earlier with [`Canceled`] if this context's token fires.
    ///
    /// A zero duration completes on the next scheduling tick.
    ///
    /// [`Canceled`]: crate::AsyncErrorCode::Canceled
    #[must_use]
    pub fn delay(&self, duration: Duration) -> Delay {
        Delay {
            executor: self.executor,
            token: self.token.clone(),
            duration,
            state: None,
            registration: CancellationRegistration::default(),
        }
    }
}

// === impl Yield ===

/// Awaiter returned by [`TaskContext::yield_now`]. Suspends exactly once.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Yield {
    yielded: bool,
}

impl Future for Yield {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        // Waking ourselves mid-poll re-posts the task through its executor
        // once the body suspends, handing the worker back to the
        // scheduling loop in between.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

// === impl Delay ===

const DELAY_PENDING: u8 = 0;
const DELAY_ELAPSED: u8 = 1;
const DELAY_CANCELED: u8 = 2;

#[derive(Debug)]
struct DelayState {
    /// Settled exactly once, by whichever of {timer firing, cancellation
    /// callback} wins the compare-exchange.
    outcome: AtomicU8,
    cell: WaitCell,
}

/// Awaiter returned by [`TaskContext::delay`].
///
/// Arms itself on first poll: the deadline is sampled from the monotonic
/// clock *then*, the timer entry is registered through
/// [`ExecutorRef::execute_at`], and a cancellation callback races it on a
/// shared outcome slot. Whichever side wins settles the result, the loser
/// is a no-op.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Delay {
    executor: ExecutorRef,
    token: CancellationToken,
    duration: Duration,
    state: Option<Arc<DelayState>>,
    registration: CancellationRegistration,
}

impl Future for Delay {
    type Output = AsyncResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if this.state.is_none() {
            if this.token.is_cancellation_requested() {
                return Poll::Ready(Err(AsyncError::canceled()));
            }

            let state = Arc::new(DelayState {
                outcome: AtomicU8::new(DELAY_PENDING),
                cell: WaitCell::new(),
            });

            this.registration = this.token.register(cx.waker().clone(), {
                let state = Arc::clone(&state);
                move || {
                    if state
                        .outcome
                        .compare_exchange(
                            DELAY_PENDING,
                            DELAY_CANCELED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        state.cell.wake();
                        true
                    } else {
                        // the timer already fired, suppress the wake
                        false
                    }
                }
            });

            let deadline = Instant::now() + this.duration;
            this.executor.execute_at(
                WorkItem::job({
                    let state = Arc::clone(&state);
                    move || {
                        if state
                            .outcome
                            .compare_exchange(
                                DELAY_PENDING,
                                DELAY_ELAPSED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            state.cell.wake();
                        }
                    }
                }),
                deadline,
            );

            this.state = Some(state);
        }

        let state = this.state.as_ref().expect("delay state was just armed");
        loop {
            match state.outcome.load(Ordering::Acquire) {
                DELAY_PENDING => {}
                DELAY_ELAPSED => {
                    this.registration.reset();
                    return Poll::Ready(Ok(()));
                }
                _ => {
                    this.registration.reset();
                    return Poll::Ready(Err(AsyncError::canceled()));
                }
            }

            match state.cell.poll_wait(cx) {
                Poll::Pending => {
                    // close the settle-after-check race before parking
                    if state.outcome.load(Ordering::Acquire) != DELAY_PENDING {
                        continue;
                    }
                    return Poll::Pending;
                }
                Poll::Ready(Ok(())) => continue,
                Poll::Ready(Err(PollWaitError::Busy)) => {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Poll::Ready(Err(PollWaitError::Closed)) => return Poll::Pending,
            }
        }
    }
}

// === race ===

/// First-ready-wins composition of two futures with the same output.
///
/// `a` is polled first, so when both sides are ready in the same tick, `a`
/// provides the result.
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) struct Race<A, B> {
    #[pin]
    a: A,
    #[pin]
    b: B,
}

pub(crate) fn race<A, B>(a: A, b: B) -> Race<A, B>
where
    A: Future,
    B: Future<Output = A::Output>,
{
    Race { a, b }
}

impl<A, B> Future for Race<A, B>
where
    A: Future,
    B: Future<Output = A::Output>,
{
    type Output = A::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(output) = this.a.poll(cx) {
            return Poll::Ready(output);
        }
        this.b.poll(cx)
    }
}

// === ContinueWith ===

impl<T: Send + 'static> Task<T> {
    /// Composes `self` → `f(value)` → child into one task, wiring
    /// cancellation through a single shared race so that a token firing at
    /// any point collapses the whole chain with [`Canceled`].
    ///
    /// The parent is scheduled by the chain if it has not started yet; the
    /// first error to settle (parent's, child's, or the cancellation) is
    /// the chain's result.
    ///
    /// [`Canceled`]: crate::AsyncErrorCode::Canceled
    pub fn continue_with<R, F>(self, ctx: &TaskContext, f: F) -> Task<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> Task<R> + Send + 'static,
    {
        let token = ctx.cancellation_token();
        let chain_ctx = ctx.clone();

        ctx.run(async move {
            let chain = async move {
                if chain_ctx.is_cancellation_requested() {
                    return Err(AsyncError::canceled());
                }

                self.schedule(&chain_ctx);
                let value = self.await?;

                if chain_ctx.is_cancellation_requested() {
                    return Err(AsyncError::canceled());
                }

                let next = f(value);
                next.schedule(&chain_ctx);
                next.await
            };

            let cancelled = async move {
                token.cancelled().await;
                Err(AsyncError::canceled())
            };

            race(cancelled, chain).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use crate::error::AsyncErrorCode;
    use crate::executor::WorkStealingExecutor;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn pool_ctx(workers: usize) -> (WorkStealingExecutor, TaskContext) {
        let pool = WorkStealingExecutor::new(workers);
        let ctx = TaskContext::new(pool.executor());
        (pool, ctx)
    }

    #[test]
    fn three_parallel_delays() {
        let (_pool, ctx) = pool_ctx(2);
        let begin = Instant::now();

        let t1 = ctx.run({
            let ctx = ctx.clone();
            async move {
                ctx.delay(Duration::from_millis(150)).await?;
                Ok(1)
            }
        });
        let t2 = ctx.run({
            let ctx = ctx.clone();
            async move {
                ctx.delay(Duration::from_millis(300)).await?;
                Ok(2)
            }
        });
        let t3 = ctx.run({
            let ctx = ctx.clone();
            async move {
                ctx.delay(Duration::from_millis(450)).await?;
                Ok(3)
            }
        });

        let results = (t1.get(), t2.get(), t3.get());
        let elapsed = begin.elapsed();

        assert_eq!(results, (Ok(1), Ok(2), Ok(3)));
        assert!(t1.is_completed() && t2.is_completed() && t3.is_completed());
        // the delays overlap: at least the longest, well under the serial
        // sum of 900ms
        assert!(elapsed >= Duration::from_millis(450), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "elapsed {elapsed:?}");
    }

    #[test]
    fn yield_fairness() {
        const TASKS: usize = 10;
        const YIELDS: usize = 100;

        let (_pool, ctx) = pool_ctx(2);
        let ticks = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..TASKS)
            .map(|_| {
                let ctx2 = ctx.clone();
                let ticks = Arc::clone(&ticks);
                ctx.run(async move {
                    for _ in 0..YIELDS {
                        ticks.fetch_add(1, Ordering::Relaxed);
                        ctx2.yield_now().await;
                    }
                    Ok(())
                })
            })
            .collect();

        for task in &tasks {
            assert_eq!(task.get(), Ok(()));
        }
        assert_eq!(ticks.load(Ordering::Relaxed), TASKS * YIELDS);
    }

    #[test]
    fn delay_completes_no_earlier_than_requested() {
        let (_pool, ctx) = pool_ctx(1);
        let begin = Instant::now();

        let task = ctx.run({
            let ctx = ctx.clone();
            async move { ctx.delay(Duration::from_millis(100)).await }
        });

        assert_eq!(task.get(), Ok(()));
        assert!(begin.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn zero_delay_completes_on_the_next_tick() {
        let (_pool, ctx) = pool_ctx(1);
        let begin = Instant::now();

        let task = ctx.run({
            let ctx = ctx.clone();
            async move { ctx.delay(Duration::ZERO).await }
        });

        assert_eq!(task.get(), Ok(()));
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cancelled_delay_reports_canceled_promptly() {
        let (_pool, ctx) = pool_ctx(2);
        let source = CancellationSource::new();
        let ctx = ctx.with_token(source.token());

        let task = ctx.run({
            let ctx = ctx.clone();
            async move { ctx.delay(Duration::from_secs(1)).await }
        });

        std::thread::sleep(Duration::from_millis(100));
        let cancel_at = Instant::now();
        source.cancel();

        let err = task.get().unwrap_err();
        let latency = cancel_at.elapsed();

        assert_eq!(err.code, AsyncErrorCode::Canceled);
        assert!(task.is_canceled());
        assert!(
            latency < Duration::from_millis(100),
            "cancellation took {latency:?} to propagate"
        );
    }

    #[test]
    fn cancellation_racing_the_timer_settles_exactly_once() {
        let (_pool, ctx) = pool_ctx(2);

        for _ in 0..16 {
            let source = CancellationSource::new();
            let ctx = ctx.with_token(source.token());

            let task = ctx.run({
                let ctx = ctx.clone();
                async move { ctx.delay(Duration::from_millis(10)).await }
            });

            std::thread::sleep(Duration::from_millis(10));
            source.cancel();

            // either side may win, but exactly one outcome is observed
            match task.get() {
                Ok(()) => assert!(!task.is_canceled()),
                Err(err) => assert_eq!(err.code, AsyncErrorCode::Canceled),
            }
        }
    }

    #[test]
    fn continue_with_chains_value_through() {
        let (_pool, ctx) = pool_ctx(2);

        let parent = Task::new(async { Ok(21) });
        let chained = parent.continue_with(&ctx, |value| Task::new(async move { Ok(value * 2) }));

        assert_eq!(chained.get(), Ok(42));
    }

    #[test]
    fn continue_with_short_circuits_on_a_cancelled_token() {
        let (_pool, ctx) = pool_ctx(1);
        let source = CancellationSource::new();
        let ctx = ctx.with_token(source.token());
        source.cancel();

        let ran = Arc::new(AtomicBool::new(false));
        let parent: Task<i32> = Task::new({
            let ran = Arc::clone(&ran);
            async move {
                ran.store(true, Ordering::Release);
                Ok(1)
            }
        });

        let chained = parent.continue_with(&ctx, |_| Task::new(async { Ok(2) }));
        let err = chained.get().unwrap_err();

        assert_eq!(err.code, AsyncErrorCode::Canceled);
        assert!(!ran.load(Ordering::Acquire), "parent body ran after cancel");
    }

    #[test]
    fn continue_with_collapses_mid_chain() {
        let (_pool, ctx) = pool_ctx(2);
        let source = CancellationSource::new();
        let ctx = ctx.with_token(source.token());

        let parent: Task<()> = Task::with_context(&ctx, {
            let ctx = ctx.clone();
            async move { ctx.delay(Duration::from_secs(5)).await }
        });
        let chained = parent.continue_with(&ctx, |()| Task::new(async { Ok(1) }));

        std::thread::sleep(Duration::from_millis(50));
        let cancel_at = Instant::now();
        source.cancel();

        let err = chained.get().unwrap_err();
        assert_eq!(err.code, AsyncErrorCode::Canceled);
        assert!(cancel_at.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn continue_with_propagates_the_parent_error() {
        let (_pool, ctx) = pool_ctx(1);

        let parent: Task<i32> = Task::new(async { Err(AsyncError::timed_out()) });
        let reached = Arc::new(AtomicBool::new(false));

        let chained = parent.continue_with(&ctx, {
            let reached = Arc::clone(&reached);
            move |_| {
                reached.store(true, Ordering::Release);
                Task::new(async { Ok(0) })
            }
        });

        assert_eq!(chained.get().unwrap_err().code, AsyncErrorCode::TimedOut);
        assert!(!reached.load(Ordering::Acquire));
    }
}
