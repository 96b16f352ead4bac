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

/// kqueue backend for the BSDs and macOS.
///
/// Read and write filters are separate kevents, refcounted per
/// `(fd, filter)` so overlapping waiters on the same descriptor compose.
pub(super) struct Kqueue {
    kqfd: RawFd,
    interest: Mutex<HashMap<(RawFd, i16), usize>>,
}

// === impl Kqueue ===

impl Kqueue {
    pub(super) fn new() -> io::Result<Self> {
        // Safety: plain kqueue(2) call
        let kqfd = unsafe { libc::kqueue() };
        if kqfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            kqfd,
            interest: Mutex::new(HashMap::new()),
        })
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) {
        let change = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: core::ptr::null_mut(),
        };
        // Safety: one properly initialized change entry, no event buffer
        let rc = unsafe { libc::kevent(self.kqfd, &change, 1, core::ptr::null_mut(), 0, core::ptr::null()) };
        if rc != 0 {
            tracing::warn!(
                fd,
                filter,
                err = %io::Error::last_os_error(),
                "kevent change failed; waiter will rely on the poll sweep"
            );
        }
    }

    fn update(&self, fd: RawFd, filter: i16, delta: isize) {
        let mut interest = self.interest.lock().unwrap_or_else(|e| e.into_inner());
        let count = interest.entry((fd, filter)).or_insert(0);
        match delta {
            1 => {
                *count += 1;
                if *count == 1 {
                    self.change(fd, filter, libc::EV_ADD | libc::EV_ENABLE);
                }
            }
            _ => {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    interest.remove(&(fd, filter));
                    self.change(fd, filter, libc::EV_DELETE);
                }
            }
        }
    }

    pub(super) fn add_interest(&self, fd: RawFd, read: bool, write: bool) {
        if read {
            self.update(fd, libc::EVFILT_READ, 1);
        }
        if write {
            self.update(fd, libc::EVFILT_WRITE, 1);
        }
    }

    pub(super) fn remove_interest(&self, fd: RawFd, read: bool, write: bool) {
        if read {
            self.update(fd, libc::EVFILT_READ, -1);
        }
        if write {
            self.update(fd, libc::EVFILT_WRITE, -1);
        }
    }

    pub(super) fn poll(&self, snapshot: &[Arc<Waiter>], timeout: Duration) -> Vec<Arc<Waiter>> {
        const CAPACITY: usize = 64;
        // Safety: kevent is plain-old-data, the kernel overwrites it
        let mut events: [libc::kevent; CAPACITY] = unsafe { core::mem::zeroed() };

        let timeout = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(timeout.subsec_nanos()),
        };
        // Safety: valid kqueue fd and an event buffer of CAPACITY entries
        let ready = unsafe {
            libc::kevent(
                self.kqfd,
                core::ptr::null(),
                0,
                events.as_mut_ptr(),
                CAPACITY as libc::c_int,
                &timeout,
            )
        };
        if ready <= 0 {
            return Vec::new();
        }

        #[derive(Default, Clone, Copy)]
        struct Ready {
            read: bool,
            write: bool,
        }

        let mut ready_events: HashMap<RawFd, Ready> = HashMap::with_capacity(ready as usize);
        for event in events.iter().take(ready as usize) {
            let entry = ready_events.entry(event.ident as RawFd).or_default();
            if event.filter == libc::EVFILT_READ {
                entry.read = true;
            }
            if event.filter == libc::EVFILT_WRITE {
                entry.write = true;
            }
            if event.flags & (libc::EV_EOF | libc::EV_ERROR) != 0 {
                entry.read = true;
                entry.write = true;
            }
        }

        snapshot
            .iter()
            .filter(|waiter| {
                let Some(ready) = ready_events.get(&waiter.fd) else {
                    return false;
                };
                (waiter.want_read && ready.read) || (waiter.want_write && ready.write)
            })
            .cloned()
            .collect()
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        // Safety: closing the fd this struct owns
        unsafe {
            libc::close(self.kqfd);
        }
    }
}
