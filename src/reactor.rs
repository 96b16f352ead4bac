// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness reactor: bridges blocking OS handles into the task graph.
//!
//! Callers register an interest in a file descriptor becoming readable or
//! writable and get back a [`Task`] that completes on readiness or
//! cancellation, whichever fires first. The reactor itself never surfaces
//! I/O errors: an errored fd is reported as *ready* and the subsequent
//! syscall made by the socket layer observes the real error. Readiness is
//! level-triggered: after resumption the data (or buffer space) that
//! triggered the wakeup is still there.
//!
//! The platform backend is picked at runtime: epoll on Linux and kqueue on
//! the BSDs/macOS, each falling back to the portable `select` path when
//! the preferred facility cannot be set up.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))] {
        mod kqueue;
    }
}
mod select;

use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::{CancellationRegistration, CancellationToken};
use crate::context::TaskContext;
use crate::error::{AsyncError, AsyncResult};
use crate::sync::{PollWaitError, WaitCell};
use crate::task::Task;

/// Configuration for a [`Reactor`].
#[derive(Debug, Clone)]
pub struct ReactorOptions {
    /// Upper bound on one blocking poll; also the idle sleep when no
    /// waiter is registered. Registration latency is at most one interval.
    pub poll_interval: Duration,
    /// Spawn an owned driver thread that pumps [`Reactor::poll_once`].
    /// When disabled the caller is responsible for pumping.
    pub driver_thread: bool,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            driver_thread: true,
        }
    }
}

/// A readiness multiplexer over raw OS handles.
pub struct Reactor {
    inner: Arc<Inner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    waiters: Mutex<Vec<Arc<Waiter>>>,
    backend: Backend,
    stop: AtomicBool,
    poll_interval: Duration,
}

/// One registered readiness interest.
///
/// `outcome` is settled exactly once by whichever of {poller observing
/// readiness, cancellation callback} wins the compare-exchange; the loser
/// backs off. The fd itself stays owned by the caller, who must keep it
/// open until the wait resolves.
pub(crate) struct Waiter {
    fd: RawFd,
    want_read: bool,
    want_write: bool,
    outcome: AtomicU8,
    cell: WaitCell,
}

const WAIT_PENDING: u8 = 0;
const WAIT_READY: u8 = 1;
const WAIT_CANCELED: u8 = 2;

enum Backend {
    #[cfg(target_os = "linux")]
    Epoll(epoll::Epoll),
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))]
    Kqueue(kqueue::Kqueue),
    Select(select::Select),
}

// === impl Backend ===

impl Backend {
    fn new() -> Self {
        #[cfg(target_os = "linux")]
        match epoll::Epoll::new() {
            Ok(backend) => return Backend::Epoll(backend),
            Err(err) => tracing::warn!("epoll unavailable ({err}), falling back to select"),
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
        ))]
        match kqueue::Kqueue::new() {
            Ok(backend) => return Backend::Kqueue(backend),
            Err(err) => tracing::warn!("kqueue unavailable ({err}), falling back to select"),
        }

        Backend::Select(select::Select::new())
    }

    fn add_interest(&self, fd: RawFd, read: bool, write: bool) {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(backend) => backend.add_interest(fd, read, write),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            ))]
            Backend::Kqueue(backend) => backend.add_interest(fd, read, write),
            Backend::Select(_) => {}
        }
    }

    fn remove_interest(&self, fd: RawFd, read: bool, write: bool) {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(backend) => backend.remove_interest(fd, read, write),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            ))]
            Backend::Kqueue(backend) => backend.remove_interest(fd, read, write),
            Backend::Select(_) => {}
        }
    }

    /// Blocks up to `timeout` and returns the waiters from `snapshot`
    /// whose requested readiness arrived.
    fn poll(&self, snapshot: &[Arc<Waiter>], timeout: Duration) -> Vec<Arc<Waiter>> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(backend) => backend.poll(snapshot, timeout),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            ))]
            Backend::Kqueue(backend) => backend.poll(snapshot, timeout),
            Backend::Select(backend) => backend.poll(snapshot, timeout),
        }
    }
}

// === impl Reactor ===

impl Reactor {
    /// Creates a reactor with the default [`ReactorOptions`].
    ///
    /// # Errors
    ///
    /// Fails only when the driver thread cannot be spawned; backend setup
    /// failures degrade to the `select` path instead.
    pub fn new() -> io::Result<Self> {
        Self::with_options(ReactorOptions::default())
    }

    pub fn with_options(options: ReactorOptions) -> io::Result<Self> {
        let inner = Arc::new(Inner {
            waiters: Mutex::new(Vec::new()),
            backend: Backend::new(),
            stop: AtomicBool::new(false),
            poll_interval: options.poll_interval,
        });

        let driver = if options.driver_thread {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name("ngin.reactor".to_owned())
                .spawn(move || driver_main(&inner))?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            inner,
            driver: Mutex::new(driver),
        })
    }

    /// Runs one poll step on the calling thread, blocking at most
    /// `timeout`. Returns how many waiters completed.
    ///
    /// Only needed when the reactor was built without a driver thread.
    pub fn poll_once(&self, timeout: Duration) -> usize {
        self.inner.poll_once(timeout)
    }

    /// A task that completes once `fd` is readable, or with [`Canceled`]
    /// when `token` fires first.
    ///
    /// The caller must keep `fd` open until the task resolves. The data
    /// that made the fd readable is left untouched.
    ///
    /// [`Canceled`]: crate::AsyncErrorCode::Canceled
    pub fn wait_until_readable(
        &self,
        ctx: &TaskContext,
        fd: RawFd,
        token: CancellationToken,
    ) -> Task<()> {
        self.wait_until_ready(ctx, fd, token, true, false)
    }

    /// A task that completes once `fd` is writable, or with [`Canceled`]
    /// when `token` fires first.
    ///
    /// [`Canceled`]: crate::AsyncErrorCode::Canceled
    pub fn wait_until_writable(
        &self,
        ctx: &TaskContext,
        fd: RawFd,
        token: CancellationToken,
    ) -> Task<()> {
        self.wait_until_ready(ctx, fd, token, false, true)
    }

    fn wait_until_ready(
        &self,
        ctx: &TaskContext,
        fd: RawFd,
        token: CancellationToken,
        want_read: bool,
        want_write: bool,
    ) -> Task<()> {
        Task::with_context(
            ctx,
            Readiness {
                inner: Arc::clone(&self.inner),
                fd,
                want_read,
                want_write,
                token,
                waiter: None,
                registration: CancellationRegistration::default(),
            },
        )
    }

    /// Stops the driver thread, if any. Also performed on drop.
    pub fn shutdown(&self) {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn driver_main(inner: &Arc<Inner>) {
    let _span = tracing::debug_span!("reactor driver loop").entered();
    while !inner.stop.load(Ordering::Acquire) {
        inner.poll_once(inner.poll_interval);
    }
}

// === impl Inner ===

impl Inner {
    fn register(&self, waiter: &Arc<Waiter>) {
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(waiter));
        self.backend
            .add_interest(waiter.fd, waiter.want_read, waiter.want_write);
    }

    /// Drops the backend interest of a settled waiter. The list entry is
    /// pruned by the next poll sweep.
    fn release(&self, waiter: &Waiter) {
        self.backend
            .remove_interest(waiter.fd, waiter.want_read, waiter.want_write);
    }

    fn poll_once(&self, timeout: Duration) -> usize {
        // Snapshot under the lock, pruning entries that settled since the
        // last sweep; the backend then operates on the snapshot without
        // holding it.
        let snapshot: Vec<Arc<Waiter>> = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.retain(|waiter| waiter.outcome.load(Ordering::Acquire) == WAIT_PENDING);
            waiters.clone()
        };

        if snapshot.is_empty() {
            if !timeout.is_zero() {
                std::thread::sleep(timeout);
            }
            return 0;
        }

        let ready = self.backend.poll(&snapshot, timeout);

        let mut completed = 0;
        for waiter in ready {
            if waiter
                .outcome
                .compare_exchange(
                    WAIT_PENDING,
                    WAIT_READY,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.release(&waiter);
                waiter.cell.wake();
                completed += 1;
            }
        }
        completed
    }
}

// === impl Readiness ===

/// Future behind [`Reactor::wait_until_readable`]/`_writable`.
struct Readiness {
    inner: Arc<Inner>,
    fd: RawFd,
    want_read: bool,
    want_write: bool,
    token: CancellationToken,
    waiter: Option<Arc<Waiter>>,
    registration: CancellationRegistration,
}

impl Future for Readiness {
    type Output = AsyncResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if this.waiter.is_none() {
            if this.token.is_cancellation_requested() {
                return Poll::Ready(Err(AsyncError::canceled()));
            }

            let waiter = Arc::new(Waiter {
                fd: this.fd,
                want_read: this.want_read,
                want_write: this.want_write,
                outcome: AtomicU8::new(WAIT_PENDING),
                cell: WaitCell::new(),
            });
            this.inner.register(&waiter);

            this.registration = this.token.register(cx.waker().clone(), {
                let waiter = Arc::clone(&waiter);
                let inner = Arc::clone(&this.inner);
                move || {
                    if waiter
                        .outcome
                        .compare_exchange(
                            WAIT_PENDING,
                            WAIT_CANCELED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        inner.release(&waiter);
                        waiter.cell.wake();
                        true
                    } else {
                        // readiness won the race, suppress the wake
                        false
                    }
                }
            });

            this.waiter = Some(waiter);
        }

        let waiter = this.waiter.as_ref().expect("waiter was just registered");
        loop {
            match waiter.outcome.load(Ordering::Acquire) {
                WAIT_PENDING => {}
                WAIT_READY => {
                    this.registration.reset();
                    return Poll::Ready(Ok(()));
                }
                _ => {
                    this.registration.reset();
                    return Poll::Ready(Err(AsyncError::canceled()));
                }
            }

            match waiter.cell.poll_wait(cx) {
                Poll::Pending => {
                    if waiter.outcome.load(Ordering::Acquire) != WAIT_PENDING {
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

impl Drop for Readiness {
    fn drop(&mut self) {
        // An abandoned wait must not leave its interest behind.
        if let Some(waiter) = &self.waiter
            && waiter
                .outcome
                .compare_exchange(
                    WAIT_PENDING,
                    WAIT_CANCELED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.inner.release(waiter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use crate::error::AsyncErrorCode;
    use crate::executor::WorkStealingExecutor;
    use std::time::Instant;

    struct Pipe {
        read: RawFd,
        write: RawFd,
    }

    impl Pipe {
        fn new() -> Self {
            let mut fds = [0 as libc::c_int; 2];
            // Safety: plain pipe(2) call with a valid out-pointer
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            assert_eq!(rc, 0, "pipe(2) failed");
            Self {
                read: fds[0],
                write: fds[1],
            }
        }

        fn write_byte(&self) {
            let byte = [0x2au8];
            // Safety: writing one byte from a valid buffer to an open fd
            let written = unsafe { libc::write(self.write, byte.as_ptr().cast(), 1) };
            assert_eq!(written, 1);
        }

        fn read_byte(&self) -> u8 {
            let mut byte = [0u8];
            // Safety: reading one byte into a valid buffer from an open fd
            let read = unsafe { libc::read(self.read, byte.as_mut_ptr().cast(), 1) };
            assert_eq!(read, 1, "expected one byte to be buffered");
            byte[0]
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            // Safety: closing fds owned by this struct
            unsafe {
                libc::close(self.read);
                libc::close(self.write);
            }
        }
    }

    fn harness() -> (WorkStealingExecutor, TaskContext, Reactor) {
        let pool = WorkStealingExecutor::new(2);
        let ctx = TaskContext::new(pool.executor());
        let reactor = Reactor::new().expect("failed to start reactor");
        (pool, ctx, reactor)
    }

    #[test]
    fn readable_wait_resumes_on_write() {
        let (_pool, ctx, reactor) = harness();
        let pipe = Pipe::new();

        let task = reactor.wait_until_readable(&ctx, pipe.read, CancellationToken::none());
        task.schedule(&ctx);

        std::thread::sleep(Duration::from_millis(50));
        let written_at = Instant::now();
        pipe.write_byte();

        assert_eq!(task.get(), Ok(()));
        assert!(written_at.elapsed() < Duration::from_secs(1));

        // level-triggered: the byte is still there
        assert_eq!(pipe.read_byte(), 0x2a);
    }

    #[test]
    fn writable_wait_completes_for_an_empty_pipe() {
        let (_pool, ctx, reactor) = harness();
        let pipe = Pipe::new();

        let task = reactor.wait_until_writable(&ctx, pipe.write, CancellationToken::none());
        task.schedule(&ctx);
        assert_eq!(task.get(), Ok(()));
    }

    #[test]
    fn cancellation_resumes_a_parked_waiter() {
        let (_pool, ctx, reactor) = harness();
        let pipe = Pipe::new();
        let source = CancellationSource::new();

        let task = reactor.wait_until_readable(&ctx, pipe.read, source.token());
        task.schedule(&ctx);

        std::thread::sleep(Duration::from_millis(50));
        let cancel_at = Instant::now();
        source.cancel();

        let err = task.get().unwrap_err();
        assert_eq!(err.code, AsyncErrorCode::Canceled);
        assert!(cancel_at.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn completion_and_cancellation_race_settles_once() {
        for _ in 0..16 {
            let (_pool, ctx, reactor) = harness();
            let pipe = Pipe::new();
            let source = CancellationSource::new();

            let task = reactor.wait_until_readable(&ctx, pipe.read, source.token());
            task.schedule(&ctx);

            std::thread::sleep(Duration::from_millis(5));
            pipe.write_byte();
            source.cancel();

            // either outcome is valid, but exactly one is observed
            match task.get() {
                Ok(()) => assert!(!task.is_canceled()),
                Err(err) => assert_eq!(err.code, AsyncErrorCode::Canceled),
            }
        }
    }

    #[test]
    fn manual_pumping_without_a_driver_thread() {
        let pool = WorkStealingExecutor::new(1);
        let ctx = TaskContext::new(pool.executor());
        let reactor = Reactor::with_options(ReactorOptions {
            driver_thread: false,
            ..ReactorOptions::default()
        })
        .expect("failed to build reactor");

        let pipe = Pipe::new();
        let task = reactor.wait_until_readable(&ctx, pipe.read, CancellationToken::none());
        task.schedule(&ctx);

        // nothing happens until we pump
        assert_eq!(reactor.poll_once(Duration::ZERO), 0);
        pipe.write_byte();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut completed = 0;
        while completed == 0 && Instant::now() < deadline {
            completed = reactor.poll_once(Duration::from_millis(10));
        }
        assert_eq!(completed, 1);
        assert_eq!(task.get(), Ok(()));
    }
}
