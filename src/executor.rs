// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod pool;
mod queue;
pub(crate) mod timer;

use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use std::time::Instant;

use static_assertions::assert_impl_all;

use crate::work::WorkItem;

pub use pool::{Builder, WorkStealingExecutor};

/// The two capabilities every executor in this crate provides: run a work
/// item as soon as possible, or no earlier than a given point of the
/// monotonic clock.
///
/// Implementors must tolerate being called from any thread.
pub trait RawExecutor: Send + Sync {
    /// Enqueues `item` for immediate execution.
    fn execute(&self, item: WorkItem);

    /// Parks `item` until `deadline` (of the monotonic clock), then runs it
    /// through the normal submission path. A deadline in the past degrades
    /// to [`execute`](Self::execute).
    fn execute_at(&self, item: WorkItem, deadline: Instant);
}

/// A virtual function pointer table (vtable) that customizes the behavior
/// of an [`ExecutorRef`].
///
/// The pointer passed to both functions is the `data` pointer of the
/// enclosing [`ExecutorRef`]. The functions are only intended to be called
/// with the `data` pointer of a properly constructed ref; calling them with
/// any other pointer is undefined behavior.
///
/// # Thread safety
///
/// Both vtable functions must be thread-safe: an `ExecutorRef` is
/// `Send + Sync` and *will* be invoked from arbitrary threads.
#[derive(Copy, Clone)]
pub struct ExecutorVTable {
    execute: unsafe fn(*const (), WorkItem),
    execute_at: unsafe fn(*const (), WorkItem, Instant),
}

/// A non-owning, copy-cheap capability to schedule work on "some" executor.
///
/// This is what the task promise captures, what awaiters post their
/// continuations through, and what the reactor hands completed waiters to.
/// It is nullable: operations on an [`invalid`](Self::invalid) ref silently
/// drop the work instead of failing.
///
/// # Lifetime
///
/// The ref does not keep its executor alive. The holder must either outlive
/// the pointed-to executor or stop calling through the ref once the
/// executor is torn down; the safe constructor enforces this with a
/// `'static` bound.
#[derive(Copy, Clone)]
pub struct ExecutorRef {
    data: *const (),
    vtable: Option<&'static ExecutorVTable>,
}

assert_impl_all!(ExecutorRef: Send, Sync);

// === impl ExecutorVTable ===

impl ExecutorVTable {
    #[must_use]
    pub const fn new(
        execute: unsafe fn(*const (), WorkItem),
        execute_at: unsafe fn(*const (), WorkItem, Instant),
    ) -> Self {
        Self {
            execute,
            execute_at,
        }
    }
}

impl fmt::Debug for ExecutorVTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorVTable").finish_non_exhaustive()
    }
}

// === impl ExecutorRef ===

struct VTableOf<E>(PhantomData<E>);

impl<E: RawExecutor> VTableOf<E> {
    const VTABLE: ExecutorVTable = ExecutorVTable {
        execute: Self::execute,
        execute_at: Self::execute_at,
    };

    unsafe fn execute(data: *const (), item: WorkItem) {
        // Safety: `data` was derived from an `&E` by the constructors below
        // and the ref's lifetime contract keeps it alive.
        unsafe { (*data.cast::<E>()).execute(item) }
    }

    unsafe fn execute_at(data: *const (), item: WorkItem, deadline: Instant) {
        // Safety: as above
        unsafe { (*data.cast::<E>()).execute_at(item, deadline) }
    }
}

impl ExecutorRef {
    /// The null capability; both operations drop their work item.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            data: core::ptr::null(),
            vtable: None,
        }
    }

    /// Creates a ref to `executor`.
    ///
    /// The `'static` bound makes this safe: the target can never be torn
    /// down while refs to it exist.
    #[must_use]
    pub fn new<E: RawExecutor>(executor: &'static E) -> Self {
        Self {
            data: core::ptr::from_ref(executor).cast(),
            vtable: Some(&VTableOf::<E>::VTABLE),
        }
    }

    /// Creates a ref to an executor of arbitrary lifetime.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the referenced executor outlives
    /// every call made through the returned ref (and every copy of it).
    #[must_use]
    pub unsafe fn new_unchecked<E: RawExecutor>(executor: &E) -> Self {
        Self {
            data: core::ptr::from_ref(executor).cast(),
            vtable: Some(&VTableOf::<E>::VTABLE),
        }
    }

    /// Creates a ref from a raw `data` pointer and vtable.
    ///
    /// # Safety
    ///
    /// The behavior of the returned ref is undefined if the contract
    /// described in [`ExecutorVTable`]'s documentation is not upheld.
    #[must_use]
    pub const unsafe fn from_raw(data: *const (), vtable: &'static ExecutorVTable) -> Self {
        Self {
            data,
            vtable: Some(vtable),
        }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.vtable.is_some()
    }

    /// Enqueues `item` for immediate execution; drops it if the ref is
    /// invalid.
    pub fn execute(&self, item: WorkItem) {
        match self.vtable {
            // Safety: `data`/`vtable` only pair up through the constructors
            Some(vtable) => unsafe { (vtable.execute)(self.data, item) },
            None => tracing::trace!(?item, "dropping work submitted to an invalid executor ref"),
        }
    }

    /// Parks `item` on the executor's timer until `deadline`; drops it if
    /// the ref is invalid.
    pub fn execute_at(&self, item: WorkItem, deadline: Instant) {
        match self.vtable {
            // Safety: `data`/`vtable` only pair up through the constructors
            Some(vtable) => unsafe { (vtable.execute_at)(self.data, item, deadline) },
            None => tracing::trace!(?item, "dropping work submitted to an invalid executor ref"),
        }
    }
}

impl Default for ExecutorRef {
    fn default() -> Self {
        Self::invalid()
    }
}

// Safety: the constructors only accept `RawExecutor` targets, which are
// `Send + Sync`; all the ref ever does is form an `&E` out of `data`.
unsafe impl Send for ExecutorRef {}
// Safety: see above
unsafe impl Sync for ExecutorRef {}

impl fmt::Debug for ExecutorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRef")
            .field("data", &self.data)
            .field("valid", &self.is_valid())
            .finish()
    }
}

// === current executor ===

thread_local! {
    static CURRENT: Cell<ExecutorRef> = const { Cell::new(ExecutorRef::invalid()) };
}

/// The executor whose worker is running the current thread, or an invalid
/// ref anywhere else.
///
/// Awaiting an unscheduled task adopts this, which is how a child task
/// inherits the executor of whoever awaits it first.
pub(crate) fn current() -> ExecutorRef {
    CURRENT.with(Cell::get)
}

/// Marks the current thread as belonging to `exec` for the guard's
/// lifetime. Worker loops hold one of these for their entire run.
pub(crate) struct EnterGuard {
    prev: ExecutorRef,
}

impl EnterGuard {
    pub(crate) fn enter(exec: ExecutorRef) -> Self {
        let prev = CURRENT.with(|current| current.replace(exec));
        Self { prev }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.prev));
    }
}

// === impl InlineExecutor ===

/// Executor that runs every item inline on the submitting thread.
///
/// `execute` invokes immediately; `execute_at` blocks until the deadline
/// and then invokes. Useful for tests and for code that wants task
/// semantics without any threads.
#[derive(Debug, Default)]
pub struct InlineExecutor(());

static INLINE: InlineExecutor = InlineExecutor(());

impl InlineExecutor {
    #[must_use]
    pub const fn new() -> Self {
        Self(())
    }

    /// A ref to the process-wide inline executor.
    #[must_use]
    pub fn executor() -> ExecutorRef {
        ExecutorRef::new(&INLINE)
    }
}

impl RawExecutor for InlineExecutor {
    fn execute(&self, mut item: WorkItem) {
        item.invoke();
    }

    fn execute_at(&self, mut item: WorkItem, deadline: Instant) {
        let now = Instant::now();
        if let Some(wait) = deadline.checked_duration_since(now) {
            std::thread::sleep(wait);
        }
        item.invoke();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        immediate: AtomicUsize,
        timed: AtomicUsize,
    }

    impl RawExecutor for Recording {
        fn execute(&self, _item: WorkItem) {
            self.immediate.fetch_add(1, Ordering::Relaxed);
        }
        fn execute_at(&self, _item: WorkItem, _deadline: Instant) {
            self.timed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn ref_routes_to_target() {
        let target = Recording::default();
        // Safety: `target` outlives `exec`, both are dropped at scope end.
        let exec = unsafe { ExecutorRef::new_unchecked(&target) };

        assert!(exec.is_valid());
        exec.execute(WorkItem::job(|| {}));
        exec.execute_at(WorkItem::job(|| {}), Instant::now());

        assert_eq!(target.immediate.load(Ordering::Relaxed), 1);
        assert_eq!(target.timed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn invalid_ref_drops_work() {
        let exec = ExecutorRef::invalid();
        assert!(!exec.is_valid());
        // must not panic, must not run the job
        exec.execute(WorkItem::job(|| panic!("ran on an invalid ref")));
        exec.execute_at(
            WorkItem::job(|| panic!("ran on an invalid ref")),
            Instant::now(),
        );
    }

    #[test]
    fn inline_executor_runs_immediately() {
        let hits = std::sync::Arc::new(AtomicUsize::new(0));
        let exec = InlineExecutor::executor();

        exec.execute(WorkItem::job({
            let hits = std::sync::Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        }));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn inline_executor_waits_for_deadline() {
        let begin = Instant::now();
        InlineExecutor::executor().execute_at(
            WorkItem::job(|| {}),
            Instant::now() + Duration::from_millis(50),
        );
        assert!(begin.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn current_is_scoped_by_guard() {
        assert!(!current().is_valid());
        {
            let _guard = EnterGuard::enter(InlineExecutor::executor());
            assert!(current().is_valid());
        }
        assert!(!current().is_valid());
    }
}
