// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful fibers: cooperative execution contexts with a private call
//! stack.
//!
//! Fibers exist for jobs that cannot live inside a stackless task body:
//! calls into blocking C APIs, code that needs a real stack for unwinding
//! tooling, deep recursion. A [`Fiber`] owns its stack and an optional
//! job; [`resume`] switches into it and [`yield_now`] switches back out.
//! The per-thread "main" record that anchors the switching is created
//! lazily the first time a thread resumes a fiber.
//!
//! [`resume`]: Fiber::resume
//! [`yield_now`]: yield_now

mod scheduler;

use core::any::Any;
use core::cell::RefCell;
use core::fmt;
use std::panic::AssertUnwindSafe;

use context::stack::{FixedSizeStack, ProtectedFixedSizeStack, Stack};
use context::{Context, Transfer};

pub use scheduler::{FiberScheduler, FiberSchedulerOptions};

/// Default fiber stack size.
pub const DEFAULT_FIBER_STACK_SIZE: usize = 128 * 1024;

/// Configuration for a [`Fiber`]'s stack.
#[derive(Debug, Clone)]
pub struct FiberOptions {
    pub stack_size: usize,
    /// Place a guard page below the stack so an overflow faults instead
    /// of corrupting adjacent memory.
    pub guarded: bool,
}

impl Default for FiberOptions {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_FIBER_STACK_SIZE,
            guarded: true,
        }
    }
}

/// Lifecycle of a [`Fiber`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FiberState {
    /// Holding (or awaiting) a job; resumable.
    Idle,
    /// Currently executing on its own stack.
    Running,
    /// The last job returned normally. Assign a new job to reuse the
    /// fiber.
    Completed,
    /// The last job panicked; the payload is held for [`Fiber::join`].
    Error,
}

type Job = Box<dyn FnOnce() + Send>;

/// A cooperative execution context with its own stack.
///
/// Moved, never copied. A fiber suspended in the middle of a job must be
/// driven to completion before it may be dropped.
pub struct Fiber {
    stack: StackMemory,
    /// Switch target; `None` only transiently during a resume.
    resume_context: Option<Context>,
    state: FiberState,
    /// Set while the current job gave up the thread via [`yield_now`]
    /// without finishing.
    suspended: bool,
    job: Option<Job>,
    panic: Option<Box<dyn Any + Send>>,
}

enum StackMemory {
    Guarded(ProtectedFixedSizeStack),
    Plain(FixedSizeStack),
}

impl StackMemory {
    fn stack(&self) -> &Stack {
        match self {
            StackMemory::Guarded(stack) => stack,
            StackMemory::Plain(stack) => stack,
        }
    }
}

/// Per-resume bookkeeping shared between the host side and the fiber
/// side of a switch. Lives in a thread-local stack so nested resumes
/// compose.
struct ActiveRecord {
    /// The context to switch back to; taken while either side is mid-switch.
    caller: Option<Context>,
    panic: Option<Box<dyn Any + Send>>,
}

thread_local! {
    /// The lazily initialized "main fiber" anchor of this thread: one
    /// record per resume in progress.
    static ACTIVE: RefCell<Vec<ActiveRecord>> = const { RefCell::new(Vec::new()) };
}

// What a switch back to the host means, passed as the transfer payload.
const SIGNAL_YIELD: usize = 1;
const SIGNAL_COMPLETE: usize = 2;
const SIGNAL_PANIC: usize = 3;

/// `true` while the calling code runs on a fiber's private stack.
#[must_use]
pub fn in_fiber() -> bool {
    ACTIVE.with(|active| !active.borrow().is_empty())
}

/// Suspends the running fiber and returns control to whoever resumed it.
///
/// The fiber stays [`Idle`](FiberState::Idle) and suspended until the next
/// [`Fiber::resume`] continues the job where it left off.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn yield_now() {
    let caller = ACTIVE.with(|active| {
        active
            .borrow_mut()
            .last_mut()
            .expect("yield_now called outside a fiber")
            .caller
            .take()
            .expect("fiber has no suspended caller")
    });

    // Safety: `caller` is the live context of the thread that resumed us,
    // parked inside `Fiber::resume`.
    let transfer = unsafe { caller.resume(SIGNAL_YIELD) };

    ACTIVE.with(|active| {
        active
            .borrow_mut()
            .last_mut()
            .expect("fiber record vanished across a yield")
            .caller = Some(transfer.context);
    });
}

// === impl Fiber ===

impl Fiber {
    /// Creates an idle fiber with a default-sized guarded stack.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(&FiberOptions::default())
    }

    /// # Panics
    ///
    /// Panics when the stack cannot be allocated.
    #[must_use]
    pub fn with_options(options: &FiberOptions) -> Self {
        let stack = if options.guarded {
            StackMemory::Guarded(
                ProtectedFixedSizeStack::new(options.stack_size)
                    .expect("failed to allocate guarded fiber stack"),
            )
        } else {
            StackMemory::Plain(
                FixedSizeStack::new(options.stack_size).expect("failed to allocate fiber stack"),
            )
        };

        // Safety: the stack outlives the context; both live and die with
        // this `Fiber`.
        let resume_context = unsafe { Context::new(stack.stack(), fiber_entry) };

        Self {
            stack,
            resume_context: Some(resume_context),
            state: FiberState::Idle,
            suspended: false,
            job: None,
            panic: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> FiberState {
        self.state
    }

    /// `true` while a job is parked mid-execution on this fiber's stack.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Assigns the next job, readying the fiber for [`resume`](Self::resume).
    ///
    /// # Panics
    ///
    /// Panics if the fiber is running or suspended mid-job.
    pub fn set_job<F>(&mut self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            !self.suspended && self.state != FiberState::Running,
            "cannot assign a job to a busy fiber"
        );
        self.job = Some(Box::new(job));
        self.panic = None;
        self.state = FiberState::Idle;
    }

    /// Switches onto the fiber's stack until the job completes, fails, or
    /// yields. Returns the state after the switch.
    ///
    /// # Panics
    ///
    /// Panics when the fiber is running, finished without a new job, or
    /// idle with no job assigned.
    pub fn resume(&mut self) -> FiberState {
        assert!(
            self.state == FiberState::Idle,
            "attempt to resume a fiber in state {:?}",
            self.state
        );
        assert!(
            self.suspended || self.job.is_some(),
            "attempt to resume a fiber without a job"
        );

        let context = self
            .resume_context
            .take()
            .expect("idle fiber without a resume context");

        // A fresh start reads the job through this pointer; a resumption
        // of a suspended job ignores the payload.
        let data = if self.suspended {
            0
        } else {
            core::ptr::from_mut(&mut self.job) as usize
        };

        ACTIVE.with(|active| {
            active.borrow_mut().push(ActiveRecord {
                caller: None,
                panic: None,
            });
        });
        self.state = FiberState::Running;

        // Safety: the context was created over this fiber's stack, which
        // is alive and not executing.
        let transfer = unsafe { context.resume(data) };

        let record = ACTIVE.with(|active| {
            active
                .borrow_mut()
                .pop()
                .expect("fiber record vanished across a resume")
        });

        self.resume_context = Some(transfer.context);
        match transfer.data {
            SIGNAL_YIELD => {
                self.suspended = true;
                self.state = FiberState::Idle;
            }
            SIGNAL_COMPLETE => {
                self.suspended = false;
                self.state = FiberState::Completed;
            }
            _ => {
                debug_assert_eq!(transfer.data, SIGNAL_PANIC);
                self.suspended = false;
                self.panic = record.panic;
                self.state = FiberState::Error;
            }
        }
        self.state
    }

    /// Reaps the last job's outcome: `Ok` after a normal completion, the
    /// panic payload after a failure.
    ///
    /// # Panics
    ///
    /// Panics if the fiber has not finished its job.
    pub fn join(&mut self) -> std::thread::Result<()> {
        match self.state {
            FiberState::Completed => Ok(()),
            FiberState::Error => Err(self
                .panic
                .take()
                .expect("errored fiber is missing its panic payload")),
            state => panic!("attempt to join a fiber in state {state:?}"),
        }
    }
}

impl Default for Fiber {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // A stack with a half-finished job on it cannot be reclaimed
        // safely.
        assert!(
            !self.suspended,
            "fiber dropped while suspended in the middle of a job"
        );
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("state", &self.state)
            .field("suspended", &self.suspended)
            .finish_non_exhaustive()
    }
}

// Safety: a fiber that is not running is inert stack memory plus a `Send`
// job; the thread-local switching state is only touched while running.
unsafe impl Send for Fiber {}

extern "C" fn fiber_entry(transfer: Transfer) -> ! {
    // Panics in the switching machinery itself must never unwind off the
    // foreign stack frame.
    let _ = std::panic::catch_unwind(AssertUnwindSafe(move || run_fiber(transfer)));
    std::process::abort();
}

fn run_fiber(mut transfer: Transfer) -> ! {
    loop {
        // On a fresh start the payload points at the host's job slot.
        // Safety: `Fiber::resume` keeps the slot alive across the switch.
        let job = unsafe { (*(transfer.data as *mut Option<Job>)).take() }
            .expect("fiber started without a job");

        ACTIVE.with(|active| {
            active
                .borrow_mut()
                .last_mut()
                .expect("fiber entered without an active record")
                .caller = Some(transfer.context);
        });

        let result = std::panic::catch_unwind(AssertUnwindSafe(job));

        let (caller, signal) = ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            let record = active
                .last_mut()
                .expect("fiber record vanished during a job");
            let caller = record
                .caller
                .take()
                .expect("fiber has no caller to return to");
            match result {
                Ok(()) => (caller, SIGNAL_COMPLETE),
                Err(payload) => {
                    record.panic = Some(payload);
                    (caller, SIGNAL_PANIC)
                }
            }
        });

        // Safety: `caller` is the context parked inside `Fiber::resume`.
        transfer = unsafe { caller.resume(signal) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn job_runs_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut fiber = Fiber::new();

        fiber.set_job({
            let hits = Arc::clone(&hits);
            move || {
                assert!(in_fiber());
                hits.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert_eq!(fiber.state(), FiberState::Idle);
        assert_eq!(fiber.resume(), FiberState::Completed);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(fiber.join().is_ok());
        assert!(!in_fiber());
    }

    #[test]
    fn yield_suspends_and_resume_continues() {
        let steps = Arc::new(AtomicUsize::new(0));
        let mut fiber = Fiber::new();

        fiber.set_job({
            let steps = Arc::clone(&steps);
            move || {
                steps.fetch_add(1, Ordering::Relaxed);
                yield_now();
                steps.fetch_add(1, Ordering::Relaxed);
                yield_now();
                steps.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert_eq!(fiber.resume(), FiberState::Idle);
        assert!(fiber.is_suspended());
        assert_eq!(steps.load(Ordering::Relaxed), 1);

        assert_eq!(fiber.resume(), FiberState::Idle);
        assert_eq!(steps.load(Ordering::Relaxed), 2);

        assert_eq!(fiber.resume(), FiberState::Completed);
        assert_eq!(steps.load(Ordering::Relaxed), 3);
        assert!(!fiber.is_suspended());
    }

    #[test]
    fn panicking_job_parks_the_payload_for_join() {
        let mut fiber = Fiber::new();
        fiber.set_job(|| panic!("fiber job failed"));

        assert_eq!(fiber.resume(), FiberState::Error);
        let payload = fiber.join().unwrap_err();
        let message = payload.downcast_ref::<&str>().copied();
        assert_eq!(message, Some("fiber job failed"));
    }

    #[test]
    fn fiber_is_reusable_after_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut fiber = Fiber::new();

        for _ in 0..3 {
            fiber.set_job({
                let hits = Arc::clone(&hits);
                move || {
                    hits.fetch_add(1, Ordering::Relaxed);
                }
            });
            assert_eq!(fiber.resume(), FiberState::Completed);
        }
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn fiber_is_reusable_after_an_error() {
        let mut fiber = Fiber::new();
        fiber.set_job(|| panic!("first job fails"));
        assert_eq!(fiber.resume(), FiberState::Error);
        let _ = fiber.join();

        fiber.set_job(|| {});
        assert_eq!(fiber.resume(), FiberState::Completed);
    }

    #[test]
    fn nested_fibers_interleave() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut outer = Fiber::new();

        outer.set_job({
            let order = Arc::clone(&order);
            move || {
                order.lock().unwrap().push("outer begin");

                let mut inner = Fiber::new();
                inner.set_job({
                    let order = Arc::clone(&order);
                    move || {
                        order.lock().unwrap().push("inner");
                    }
                });
                assert_eq!(inner.resume(), FiberState::Completed);

                order.lock().unwrap().push("outer end");
            }
        });

        assert_eq!(outer.resume(), FiberState::Completed);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer begin", "inner", "outer end"]
        );
    }

    #[test]
    fn fibers_move_between_threads() {
        let mut fiber = Fiber::new();
        fiber.set_job(|| {
            yield_now();
        });
        assert_eq!(fiber.resume(), FiberState::Idle);

        // finish the suspended job on another thread
        let handle = std::thread::spawn(move || {
            let mut fiber = fiber;
            assert_eq!(fiber.resume(), FiberState::Completed);
        });
        handle.join().unwrap();
    }
}
