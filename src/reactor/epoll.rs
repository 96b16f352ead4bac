// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::Waiter;

/// Level-triggered epoll backend.
///
/// The interest set is refcounted per fd so independent read and write
/// waiters on the same descriptor compose: the epoll registration is the
/// union of everything outstanding, updated as waiters come and go.
pub(super) struct Epoll {
    epfd: RawFd,
    interest: Mutex<HashMap<RawFd, Interest>>,
}

#[derive(Default)]
struct Interest {
    readers: usize,
    writers: usize,
}

impl Interest {
    fn events(&self) -> u32 {
        let mut events = 0u32;
        if self.readers > 0 {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.writers > 0 {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn is_empty(&self) -> bool {
        self.readers == 0 && self.writers == 0
    }
}

// === impl Epoll ===

impl Epoll {
    pub(super) fn new() -> io::Result<Self> {
        // Safety: plain epoll_create1(2) call
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            interest: Mutex::new(HashMap::new()),
        })
    }

    pub(super) fn add_interest(&self, fd: RawFd, read: bool, write: bool) {
        let mut interest = self.interest.lock().unwrap_or_else(|e| e.into_inner());
        let entry = interest.entry(fd).or_default();
        let known = !entry.is_empty();
        if read {
            entry.readers += 1;
        }
        if write {
            entry.writers += 1;
        }

        let mut event = libc::epoll_event {
            events: entry.events(),
            u64: fd as u64,
        };
        let op = if known {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        // Safety: valid epoll fd and a properly initialized event
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc != 0 {
            tracing::warn!(
                fd,
                err = %io::Error::last_os_error(),
                "epoll_ctl failed; waiter will rely on the poll sweep"
            );
            if op == libc::EPOLL_CTL_ADD {
                interest.remove(&fd);
            }
        }
    }

    pub(super) fn remove_interest(&self, fd: RawFd, read: bool, write: bool) {
        let mut interest = self.interest.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = interest.get_mut(&fd) else {
            return;
        };
        if read {
            entry.readers = entry.readers.saturating_sub(1);
        }
        if write {
            entry.writers = entry.writers.saturating_sub(1);
        }

        if entry.is_empty() {
            interest.remove(&fd);
            // Safety: removing a previously added fd; the event argument
            // is ignored for EPOLL_CTL_DEL
            unsafe {
                libc::epoll_ctl(
                    self.epfd,
                    libc::EPOLL_CTL_DEL,
                    fd,
                    core::ptr::null_mut(),
                );
            }
        } else {
            let mut event = libc::epoll_event {
                events: entry.events(),
                u64: fd as u64,
            };
            // Safety: valid epoll fd and a properly initialized event
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event);
            }
        }
    }

    pub(super) fn poll(&self, snapshot: &[Arc<Waiter>], timeout: Duration) -> Vec<Arc<Waiter>> {
        const CAPACITY: usize = 64;
        // Safety: epoll_event is plain-old-data, the kernel overwrites it
        let mut events: [libc::epoll_event; CAPACITY] = unsafe { core::mem::zeroed() };

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        // Safety: valid epoll fd and an event buffer of CAPACITY entries
        let ready = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                CAPACITY as libc::c_int,
                timeout_ms,
            )
        };
        if ready <= 0 {
            return Vec::new();
        }

        // Union the readiness per fd, then walk the snapshot.
        let mut ready_events: HashMap<RawFd, u32> = HashMap::with_capacity(ready as usize);
        for event in events.iter().take(ready as usize) {
            *ready_events.entry(event.u64 as RawFd).or_insert(0) |= event.events;
        }

        const READ_MASK: u32 = (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLRDHUP) as u32;
        const WRITE_MASK: u32 = (libc::EPOLLOUT | libc::EPOLLERR) as u32;

        snapshot
            .iter()
            .filter(|waiter| {
                let Some(mask) = ready_events.get(&waiter.fd) else {
                    return false;
                };
                (waiter.want_read && mask & READ_MASK != 0)
                    || (waiter.want_write && mask & WRITE_MASK != 0)
            })
            .cloned()
            .collect()
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // Safety: closing the fd this struct owns
        unsafe {
            libc::close(self.epfd);
        }
    }
}
