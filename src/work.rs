// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::mem;
use std::panic::{self, AssertUnwindSafe};

use crate::task::TaskRef;

/// The unit of scheduling: either one resumption of a spawned task, or a
/// plain nullary job.
///
/// A `WorkItem` is move-only and fires at most once: [`invoke`] takes the
/// payload out, leaving [`WorkKind::None`] behind, so invoking an empty or
/// already-invoked item is a no-op. Invoking a `Task` item polls the
/// referenced task exactly one step; the task's own state machine makes
/// that harmless if the task has already completed.
///
/// The distinction between the two variants matters on the hot path: a
/// task resumption is a refcount bump plus one indirect call into the
/// promise, while a job goes through the boxed callable.
///
/// [`invoke`]: Self::invoke
#[derive(Default)]
pub struct WorkItem(Repr);

/// Discriminant of a [`WorkItem`], see [`WorkItem::kind`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WorkKind {
    None,
    Task,
    Job,
}

#[derive(Default)]
enum Repr {
    #[default]
    None,
    Task(TaskRef),
    Job(Box<dyn FnOnce() + Send>),
}

// === impl WorkItem ===

impl WorkItem {
    /// An empty item; invoking it does nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self(Repr::None)
    }

    /// Wraps a nullary job.
    #[must_use]
    pub fn job<F>(job: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Repr::Job(Box::new(job)))
    }

    /// Wraps one resumption of `task`.
    #[must_use]
    pub(crate) fn task(task: TaskRef) -> Self {
        Self(Repr::Task(task))
    }

    #[must_use]
    pub fn kind(&self) -> WorkKind {
        match self.0 {
            Repr::None => WorkKind::None,
            Repr::Task(_) => WorkKind::Task,
            Repr::Job(_) => WorkKind::Job,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.0, Repr::None)
    }

    /// Runs the item, consuming its payload.
    ///
    /// Failures never cross this boundary: a panic inside a task body is
    /// caught by the promise and reported as a `Fault` result, and a panic
    /// escaping a plain job aborts the process. The worker loops that call
    /// this never unwind.
    pub fn invoke(&mut self) {
        match mem::take(&mut self.0) {
            Repr::None => {}
            Repr::Task(task) => task.poll(),
            Repr::Job(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("job panicked on the executor; aborting");
                    std::process::abort();
                }
            }
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_tuple("WorkItem");
        match &self.0 {
            Repr::None => s.field(&"None"),
            Repr::Task(task) => s.field(task),
            Repr::Job(_) => s.field(&"Job"),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn job_runs_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut item = WorkItem::job({
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert_eq!(item.kind(), WorkKind::Job);
        item.invoke();
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        // the payload is gone, a second invoke is a no-op
        assert_eq!(item.kind(), WorkKind::None);
        item.invoke();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn moved_from_item_is_none() {
        let mut item = WorkItem::job(|| {});
        let mut moved = std::mem::take(&mut item);

        assert!(item.is_empty());
        item.invoke();

        assert_eq!(moved.kind(), WorkKind::Job);
        moved.invoke();
    }

    #[test]
    fn empty_invoke_is_a_noop() {
        let mut item = WorkItem::none();
        assert_eq!(item.kind(), WorkKind::None);
        item.invoke();
        item.invoke();
    }
}
