// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::sync::WaitCell;

/// Owner side of a cancellation domain.
///
/// [`cancel`](Self::cancel) is edge-triggered and idempotent: the first
/// call sets the flag and fires every live registration's callback in
/// registration order; later calls do nothing. Cancellation is
/// cooperative, nothing is preempted.
#[derive(Debug, Default)]
pub struct CancellationSource {
    inner: Arc<SourceInner>,
}

/// A weak, copyable view on a [`CancellationSource`].
///
/// Tokens flow through [`TaskContext`]s into awaiters. A token whose
/// source is gone behaves as never-cancelled.
///
/// [`TaskContext`]: crate::context::TaskContext
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Weak<SourceInner>,
}

/// Handle to one registered cancellation callback.
///
/// The callback fires at most once. [`reset`](Self::reset) (or dropping
/// the registration) detaches it atomically: a detached callback never
/// runs, even if a `cancel` is racing the reset.
#[derive(Default)]
pub struct CancellationRegistration {
    entry: Option<Arc<RegistrationEntry>>,
}

/// Future returned by [`CancellationToken::cancelled`]; completes once the
/// token's source fires. Never completes for a detached token.
#[derive(Debug)]
pub struct Cancelled {
    token: CancellationToken,
    registration: Option<CancellationRegistration>,
}

type Callback = Box<dyn FnOnce() -> bool + Send>;

#[derive(Debug, Default)]
struct SourceInner {
    cancelled: AtomicBool,
    registrations: Mutex<Vec<Weak<RegistrationEntry>>>,
}

struct RegistrationEntry {
    /// Arbitrates cancel vs. reset vs. the guarded operation finishing on
    /// its own: whoever flips this first wins, everyone else is a no-op.
    done: AtomicBool,
    callback: Mutex<Option<Callback>>,
    /// The bound continuation; woken when the callback asks for it.
    waker: WaitCell,
}

// === impl CancellationSource ===

impl CancellationSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token observing this source.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation.
    ///
    /// The first call fires the registered callbacks, in registration
    /// order, each at most once; callbacks that return `true` get their
    /// bound continuation woken. Returns `false` on every call but the
    /// first.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::trace!("cancellation requested");

        let entries = {
            let mut registrations = self
                .inner
                .registrations
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            core::mem::take(&mut *registrations)
        };
        for entry in entries {
            if let Some(entry) = entry.upgrade() {
                entry.fire();
            }
        }
        true
    }
}

// === impl CancellationToken ===

impl CancellationToken {
    /// A token bound to nothing; never reports cancellation.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.cancelled.load(Ordering::Acquire))
    }

    /// Registers `callback` to run when the source cancels, binding
    /// `waker` as the continuation to wake if the callback returns `true`
    /// (meaning it won the race against regular completion).
    ///
    /// If cancellation already happened, the callback fires synchronously
    /// right here. On a detached token the registration is inert.
    pub fn register<F>(&self, waker: Waker, callback: F) -> CancellationRegistration
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        let Some(inner) = self.inner.upgrade() else {
            return CancellationRegistration::default();
        };

        let entry = Arc::new(RegistrationEntry {
            done: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback) as Callback)),
            waker: WaitCell::new(),
        });
        // Park the continuation up front; `fire` retrieves it through the
        // cell, so a wake can never slip between registration and arming.
        entry.waker.register(waker);

        {
            let mut registrations = inner
                .registrations
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if inner.cancelled.load(Ordering::Acquire) {
                // lost to an in-flight cancel; fire without enlisting
                drop(registrations);
                entry.fire();
            } else {
                registrations.push(Arc::downgrade(&entry));
            }
        }

        CancellationRegistration { entry: Some(entry) }
    }

    /// A future that completes when this token is cancelled.
    #[must_use]
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
            registration: None,
        }
    }
}

// === impl CancellationRegistration ===

impl CancellationRegistration {
    /// Detaches the callback: after this returns it will never run.
    ///
    /// Returns `true` when the registration was still armed, `false` when
    /// the callback already fired (or the registration was inert).
    pub fn reset(&mut self) -> bool {
        let Some(entry) = self.entry.take() else {
            return false;
        };
        if entry
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // drop the callback so captured state is released promptly
        entry
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        true
    }

    fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<()> {
        match &self.entry {
            Some(entry) => entry.waker.poll_wait(cx).map(|_| ()),
            None => Poll::Pending,
        }
    }
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        self.reset();
    }
}

impl fmt::Debug for CancellationRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationRegistration")
            .field("armed", &self.entry.is_some())
            .finish()
    }
}

// === impl RegistrationEntry ===

impl RegistrationEntry {
    fn fire(&self) {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // the guarded operation completed (or the registration was
            // reset) first
            return;
        }

        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let proceed = callback.map(|callback| callback()).unwrap_or(true);
        if proceed {
            self.waker.wake();
        }
    }
}

impl fmt::Debug for RegistrationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationEntry")
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl Cancelled ===

impl Future for Cancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.token.is_cancellation_requested() {
            return Poll::Ready(());
        }

        if self.registration.is_none() {
            let registration = self.token.register(cx.waker().clone(), || true);
            self.registration = Some(registration);
            // the registration may have fired synchronously
            if self.token.is_cancellation_requested() {
                return Poll::Ready(());
            }
            return Poll::Pending;
        }

        // refresh the bound continuation
        if let Some(registration) = &self.registration {
            let _ = registration.poll_wait(cx);
        }
        if self.token.is_cancellation_requested() {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn cancel_fires_callbacks_once_in_order() {
        let source = CancellationSource::new();
        let token = source.token();
        let order = Arc::new(Mutex::new(Vec::new()));
        let waker = Waker::from(CountingWaker::new());

        let _a = token.register(waker.clone(), {
            let order = Arc::clone(&order);
            move || {
                order.lock().unwrap().push("a");
                true
            }
        });
        let _b = token.register(waker, {
            let order = Arc::clone(&order);
            move || {
                order.lock().unwrap().push("b");
                true
            }
        });

        assert!(source.cancel());
        assert!(!source.cancel());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn winning_callback_wakes_the_continuation() {
        let source = CancellationSource::new();
        let counter = CountingWaker::new();

        let _registration = source
            .token()
            .register(Waker::from(Arc::clone(&counter)), || true);
        source.cancel();
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn losing_callback_suppresses_the_wake() {
        let source = CancellationSource::new();
        let counter = CountingWaker::new();

        // the callback reports that the operation already completed
        let _registration = source
            .token()
            .register(Waker::from(Arc::clone(&counter)), || false);
        source.cancel();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn reset_detaches_the_callback() {
        let source = CancellationSource::new();
        let fired = Arc::new(AtomicBool::new(false));

        let mut registration = source.token().register(Waker::from(CountingWaker::new()), {
            let fired = Arc::clone(&fired);
            move || {
                fired.store(true, Ordering::Release);
                true
            }
        });
        assert!(registration.reset());
        assert!(!registration.reset());

        source.cancel();
        assert!(!fired.load(Ordering::Acquire));
    }

    #[test]
    fn registering_on_a_cancelled_source_fires_immediately() {
        let source = CancellationSource::new();
        source.cancel();

        let fired = Arc::new(AtomicBool::new(false));
        let _registration = source.token().register(Waker::from(CountingWaker::new()), {
            let fired = Arc::clone(&fired);
            move || {
                fired.store(true, Ordering::Release);
                true
            }
        });
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn detached_token_is_never_cancelled() {
        let token = {
            let source = CancellationSource::new();
            source.token()
        };
        assert!(!token.is_cancellation_requested());

        let fired = Arc::new(AtomicBool::new(false));
        let _registration = token.register(Waker::from(CountingWaker::new()), {
            let fired = Arc::clone(&fired);
            move || {
                fired.store(true, Ordering::Release);
                true
            }
        });
        assert!(!fired.load(Ordering::Acquire));
    }

    #[test]
    fn none_token_is_inert() {
        let token = CancellationToken::none();
        assert!(!token.is_cancellation_requested());
    }
}
