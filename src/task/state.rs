// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use bitflags::bitflags;

use crate::loom::sync::atomic::{AtomicUsize, Ordering};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct State: usize {
        /// A resumption of this task sits in some run queue.
        const SCHEDULED = 0b0001;
        /// A worker is inside the task body right now.
        const POLLING = 0b0010;
        /// A wakeup arrived while POLLING was set; the poller re-enqueues
        /// itself once the body suspends.
        const REPOLL = 0b0100;
        /// Terminal. The result is published and immutable.
        const COMPLETE = 0b1000;
    }
}

/// The promise's lifecycle word.
///
/// The transitions below are what make the scheduling contract hold:
/// a task is enqueued at most once at a time (no double-scheduling), a
/// wakeup that races the body being polled is coalesced into exactly one
/// re-enqueue (no lost wakeups), and everything after COMPLETE is a no-op.
#[derive(Debug)]
pub(crate) struct Lifecycle(AtomicUsize);

/// What the poller must do after its poll returned `Pending`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum EndPoll {
    /// Park; whoever holds the waker will re-schedule the task.
    Idle,
    /// A wakeup arrived mid-poll; re-enqueue now.
    Reschedule,
}

// === impl Lifecycle ===

impl Lifecycle {
    pub(crate) const fn new() -> Self {
        Self(AtomicUsize::new(State::empty().bits()))
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.load().contains(State::COMPLETE)
    }

    /// A wakeup. Returns `true` when the caller must enqueue the task.
    ///
    /// Wakes of a completed or already-scheduled task are no-ops; a wake
    /// during a poll only marks REPOLL and leaves the enqueue to the
    /// poller.
    pub(crate) fn transition_to_scheduled(&self) -> bool {
        let mut current = self.load();
        loop {
            if current.intersects(State::COMPLETE | State::SCHEDULED) {
                return false;
            }

            let next = if current.contains(State::POLLING) {
                if current.contains(State::REPOLL) {
                    // already coalesced into a pending re-enqueue
                    return false;
                }
                current | State::REPOLL
            } else {
                current | State::SCHEDULED
            };

            match self.compare_exchange(current, next) {
                Ok(_) => return !current.contains(State::POLLING),
                Err(actual) => current = actual,
            }
        }
    }

    /// Claims the queued resumption. Returns `false` when there is nothing
    /// to do (the task completed, or this resumption was superseded).
    pub(crate) fn transition_to_polling(&self) -> bool {
        let mut current = self.load();
        loop {
            if current.contains(State::COMPLETE) || !current.contains(State::SCHEDULED) {
                return false;
            }

            let next = (current - State::SCHEDULED) | State::POLLING;
            match self.compare_exchange(current, next) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Ends a poll whose body suspended.
    pub(crate) fn transition_from_polling(&self) -> EndPoll {
        let mut current = self.load();
        loop {
            debug_assert!(
                current.contains(State::POLLING),
                "transition_from_polling outside a poll"
            );

            let (next, verdict) = if current.contains(State::REPOLL) {
                (
                    (current - State::POLLING - State::REPOLL) | State::SCHEDULED,
                    EndPoll::Reschedule,
                )
            } else {
                (current - State::POLLING, EndPoll::Idle)
            };

            match self.compare_exchange(current, next) {
                Ok(_) => return verdict,
                Err(actual) => current = actual,
            }
        }
    }

    /// Publishes completion. Pending REPOLL/SCHEDULED marks are discarded,
    /// later wakes become no-ops.
    pub(crate) fn transition_to_complete(&self) {
        self.0.store(State::COMPLETE.bits(), Ordering::Release);
    }

    #[inline(always)]
    fn load(&self) -> State {
        State::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    #[inline(always)]
    fn compare_exchange(&self, current: State, new: State) -> Result<State, State> {
        self.0
            .compare_exchange(
                current.bits(),
                new.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_enqueues_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.transition_to_scheduled());
        // second wake coalesces with the queued resumption
        assert!(!lifecycle.transition_to_scheduled());
    }

    #[test]
    fn wake_during_poll_defers_to_the_poller() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.transition_to_scheduled());
        assert!(lifecycle.transition_to_polling());

        // wakes mid-poll never enqueue directly
        assert!(!lifecycle.transition_to_scheduled());
        assert!(!lifecycle.transition_to_scheduled());

        // the poller carries the coalesced wake out as one reschedule
        assert_eq!(lifecycle.transition_from_polling(), EndPoll::Reschedule);
        assert!(lifecycle.transition_to_polling());
        assert_eq!(lifecycle.transition_from_polling(), EndPoll::Idle);
    }

    #[test]
    fn complete_is_terminal() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.transition_to_scheduled());
        assert!(lifecycle.transition_to_polling());
        lifecycle.transition_to_complete();

        assert!(lifecycle.is_complete());
        assert!(!lifecycle.transition_to_scheduled());
        assert!(!lifecycle.transition_to_polling());
    }

    #[test]
    fn spurious_invoke_is_rejected() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.transition_to_polling());
    }
}
