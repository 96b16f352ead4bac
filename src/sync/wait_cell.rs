// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::task::{Context, Poll, Waker};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};

/// An atomically registered [`Waker`].
///
/// This cell stores the [`Waker`] of a single task. A waker is stored by
/// polling [`poll_wait`] from a future's `poll`; once stored, it can be
/// woken from any thread by calling [`wake`]. The promise uses one of these
/// as its continuation slot, the delay and reactor waiters use it to hand
/// their wakeup over to whichever side of the race wins.
///
/// The synchronization strategy follows Tokio's `AtomicWaker`: a small
/// state word arbitrates between the registering side and the waking side,
/// and whichever loses a conflict re-issues the wake itself, so a wakeup
/// that races a registration is never dropped.
///
/// [`poll_wait`]: Self::poll_wait
/// [`wake`]: Self::wake
pub struct WaitCell {
    state: AtomicUsize,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct State: usize {
        const WAITING = 0b0000;
        const REGISTERING = 0b0001;
        const WAKING = 0b0010;
        const WOKEN = 0b0100;
        const CLOSED = 0b1000;
    }
}
// WAITING must be the all-clear state
const_assert_eq!(State::WAITING.bits(), 0);

/// Error returned by [`WaitCell::poll_wait`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollWaitError {
    /// The cell was [closed](WaitCell::close); no further wakeups will be
    /// delivered.
    Closed,
    /// Another task was concurrently storing its own [`Waker`]; yield and
    /// retry.
    Busy,
}

// === impl WaitCell ===

impl WaitCell {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(State::WAITING.bits()),
            waker: UnsafeCell::new(None),
        }
    }

    /// Registers the waker from `cx`, or completes immediately if a wakeup
    /// already arrived.
    ///
    /// Returns [`Poll::Pending`] once the waker is stored; the stored waker
    /// is invoked by the next [`wake`](Self::wake). A caller observing
    /// [`PollWaitError::Busy`] should wake itself and retry on the next
    /// poll.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), PollWaitError>> {
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::CLOSED) => {
                return Poll::Ready(Err(PollWaitError::Closed));
            }
            Err(actual) if actual.contains(State::WOKEN) => {
                // consume the pending wakeup
                self.fetch_and(!State::WOKEN, Ordering::Release);
                return Poll::Ready(Ok(()));
            }
            // a wake is in flight right now, don't go to sleep
            Err(actual) if actual.contains(State::WAKING) => {
                return Poll::Ready(Ok(()));
            }
            Err(_) => return Poll::Ready(Err(PollWaitError::Busy)),
            Ok(_) => {}
        }

        if let Some(prev_waker) = self.replace_waker(cx.waker().clone()) {
            // An old waker was evicted, it must not starve.
            prev_waker.wake();
        }

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
        {
            // A wake or close raced our registration. Since REGISTERING is
            // still set, the waking side did not touch the slot, so we own
            // it: take our waker back out and report the event directly.
            tracing::trace!(state = ?actual, "woken while registering");

            // Safety: REGISTERING is set, excluding every other accessor.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });

            // Reset to WAITING, preserving only a CLOSED bit.
            let state = self.fetch_and(State::CLOSED, Ordering::AcqRel);
            debug_assert!(
                state == actual || state == actual | State::CLOSED,
                "state changed unexpectedly while registering!"
            );

            if let Some(waker) = waker {
                waker.wake();
            }

            if state.contains(State::CLOSED) {
                return Poll::Ready(Err(PollWaitError::Closed));
            }
            return Poll::Ready(Ok(()));
        }

        Poll::Pending
    }

    /// Stores `waker` directly, outside of a poll.
    ///
    /// Delivery is at-least-once: if a wakeup already arrived, or races the
    /// registration, `waker` is invoked on the spot instead of being
    /// stored.
    pub fn register(&self, waker: Waker) {
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::WOKEN) => {
                self.fetch_and(!State::WOKEN, Ordering::Release);
                waker.wake();
                return;
            }
            // a wake/close is in flight or another registration holds the
            // slot; deliver conservatively rather than risk losing it
            Err(_) => {
                waker.wake();
                return;
            }
            Ok(_) => {}
        }

        if let Some(prev_waker) = self.replace_waker(waker) {
            prev_waker.wake();
        }

        if self
            .compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
            .is_err()
        {
            // Woken or closed while we were registering; we still own the
            // slot (see poll_wait), so hand the wakeup over ourselves.
            // Safety: REGISTERING is set, excluding every other accessor.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });
            self.fetch_and(State::CLOSED, Ordering::AcqRel);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    /// Wakes the stored waker, if any.
    ///
    /// Returns `true` if a waker was invoked. A wake that arrives while no
    /// waker is registered is remembered (WOKEN bit) and consumed by the
    /// next [`poll_wait`](Self::poll_wait).
    pub fn wake(&self) -> bool {
        if let Some(waker) = self.take_waker(false) {
            waker.wake();
            true
        } else {
            false
        }
    }

    /// Closes the cell, waking the stored waker.
    ///
    /// Subsequent [`poll_wait`](Self::poll_wait) calls report
    /// [`PollWaitError::Closed`].
    pub fn close(&self) -> bool {
        if let Some(waker) = self.take_waker(true) {
            waker.wake();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.current_state().contains(State::CLOSED)
    }

    fn take_waker(&self, close: bool) -> Option<Waker> {
        let state = {
            let mut bits = State::WAKING | State::WOKEN;
            if close {
                bits |= State::CLOSED;
            }
            self.fetch_or(bits, Ordering::AcqRel)
        };

        // Only touch the slot if no one else is.
        if !state.intersects(State::WAKING | State::REGISTERING | State::CLOSED) {
            // Safety: WAKING is set and nobody held the slot, so we have
            // exclusive access until we clear WAKING below.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });

            // release the slot
            self.fetch_and(!State::WAKING, Ordering::Release);

            if let Some(waker) = waker {
                tracing::trace!(?close, "took waker");
                return Some(waker);
            }
        }

        None
    }

    fn replace_waker(&self, waker: Waker) -> Option<Waker> {
        // Safety: only called with REGISTERING held (see poll_wait), which
        // keeps the waking side out of the slot.
        self.waker.with_mut(|slot| unsafe {
            match &mut *slot {
                Some(old_waker) if waker.will_wake(old_waker) => None,
                old => old.replace(waker),
            }
        })
    }

    #[inline(always)]
    fn compare_exchange(
        &self,
        current: State,
        new: State,
        success: Ordering,
    ) -> Result<State, State> {
        self.state
            .compare_exchange(current.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_and(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_and(state.bits(), order))
    }

    #[inline(always)]
    fn fetch_or(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_or(state.bits(), order))
    }

    #[inline(always)]
    fn current_state(&self) -> State {
        State::from_bits_retain(self.state.load(Ordering::Acquire))
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        WaitCell::new()
    }
}

// Safety: `WaitCell` synchronizes all accesses through the state word
unsafe impl Send for WaitCell {}
// Safety: `WaitCell` synchronizes all accesses through the state word
unsafe impl Sync for WaitCell {}

impl fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCell")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl CountingWaker {
        fn new() -> Arc<Self> {
            Arc::new(Self(AtomicUsize::new(0)))
        }

        fn count(&self) -> usize {
            self.0.load(Ordering::Acquire)
        }
    }

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::Release);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::Release);
        }
    }

    #[test]
    fn wake_invokes_registered_waker() {
        let cell = WaitCell::new();
        let counter = CountingWaker::new();
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);

        assert!(cell.poll_wait(&mut cx).is_pending());
        assert!(cell.wake());
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn wake_before_register_is_remembered() {
        let cell = WaitCell::new();

        // no waker stored yet, but the wakeup must stick
        assert!(!cell.wake());

        let counter = CountingWaker::new();
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);

        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn close_reports_closed() {
        let cell = WaitCell::new();
        let counter = CountingWaker::new();
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);

        assert!(cell.poll_wait(&mut cx).is_pending());
        cell.close();
        assert_eq!(counter.count(), 1);
        assert_eq!(
            cell.poll_wait(&mut cx),
            Poll::Ready(Err(PollWaitError::Closed))
        );
        assert!(cell.is_closed());
    }

    #[test]
    fn direct_register_delivers_raced_wakeups() {
        let cell = WaitCell::new();
        let counter = CountingWaker::new();

        cell.register(Waker::from(Arc::clone(&counter)));
        assert!(cell.wake());
        assert_eq!(counter.count(), 1);

        // wake first, then register: delivered inline instead of stored
        let cell = WaitCell::new();
        assert!(!cell.wake());
        cell.register(Waker::from(Arc::clone(&counter)));
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn reregistering_same_waker_is_cheap() {
        let cell = WaitCell::new();
        let counter = CountingWaker::new();
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);

        assert!(cell.poll_wait(&mut cx).is_pending());
        assert!(cell.poll_wait(&mut cx).is_pending());
        // re-registering the same waker must not have woken it
        assert_eq!(counter.count(), 0);

        assert!(cell.wake());
        assert_eq!(counter.count(), 1);
    }
}
