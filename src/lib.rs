// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous execution core of the NGIN engine-support library.
//!
//! Four pieces that only make sense together:
//!
//! - [`Task`]: a lazily started, suspendable computation with a typed
//!   result, value-based errors and cooperative cancellation.
//! - [`WorkStealingExecutor`]: a fixed pool of workers with per-worker
//!   deques, a shared injection queue and a timer thread.
//! - [`Reactor`] (Unix): a readiness multiplexer that parks tasks on raw
//!   OS handles.
//! - [`fiber`]: a stackful execution substrate for jobs that need a
//!   private call stack.
//!
//! The hard part is their interaction: racing a task's completion against
//! a cancellation signal against a timer deadline against an I/O
//! completion without losing wakeups, double-scheduling, or leaking
//! suspended state. The pieces that enforce this are small and shared:
//! the promise lifecycle word in [`task`], the settle-once
//! compare-exchange used by [`context::Delay`] and the reactor waiters,
//! and the generation conditions in [`sync`].
//!
//! [`Task`]: task::Task
//! [`WorkStealingExecutor`]: executor::WorkStealingExecutor
//! [`Reactor`]: reactor::Reactor

pub mod cancel;
pub mod context;
mod error;
pub mod executor;
pub mod fiber;
pub(crate) mod loom;
#[cfg(unix)]
pub mod reactor;
pub mod sync;
pub mod task;
pub mod work;

pub use cancel::{CancellationRegistration, CancellationSource, CancellationToken};
pub use context::TaskContext;
pub use error::{AsyncError, AsyncErrorCode, AsyncResult};
pub use executor::{ExecutorRef, InlineExecutor, RawExecutor, WorkStealingExecutor};
#[cfg(unix)]
pub use reactor::Reactor;
pub use task::Task;
pub use work::{WorkItem, WorkKind};
