// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use super::Waiter;

/// Portable `select(2)` backend.
///
/// Keeps no interest state: the fd sets are rebuilt from the waiter
/// snapshot on every poll. Descriptors at or above `FD_SETSIZE` cannot be
/// watched on this path and are skipped with a warning.
pub(super) struct Select(());

// === impl Select ===

impl Select {
    pub(super) fn new() -> Self {
        Self(())
    }

    pub(super) fn poll(&self, snapshot: &[Arc<Waiter>], timeout: Duration) -> Vec<Arc<Waiter>> {
        // Safety: fd_set is plain-old-data and FD_ZERO initializes it
        let mut read_set: libc::fd_set = unsafe { core::mem::zeroed() };
        // Safety: as above
        let mut write_set: libc::fd_set = unsafe { core::mem::zeroed() };
        // Safety: zeroed sets are valid arguments to FD_ZERO
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
        }

        let mut max_fd: RawFd = -1;
        for waiter in snapshot {
            if waiter.fd < 0 || waiter.fd >= libc::FD_SETSIZE as RawFd {
                tracing::warn!(fd = waiter.fd, "fd out of select range, not watched");
                continue;
            }
            // Safety: fd checked against FD_SETSIZE above
            unsafe {
                if waiter.want_read {
                    libc::FD_SET(waiter.fd, &mut read_set);
                }
                if waiter.want_write {
                    libc::FD_SET(waiter.fd, &mut write_set);
                }
            }
            max_fd = max_fd.max(waiter.fd);
        }
        if max_fd < 0 {
            if !timeout.is_zero() {
                std::thread::sleep(timeout);
            }
            return Vec::new();
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        // Safety: the sets were built above, nfds is max_fd + 1
        let ready = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                core::ptr::null_mut(),
                &mut tv,
            )
        };
        if ready <= 0 {
            return Vec::new();
        }

        snapshot
            .iter()
            .filter(|waiter| {
                if waiter.fd < 0 || waiter.fd >= libc::FD_SETSIZE as RawFd {
                    return false;
                }
                // Safety: fd checked against FD_SETSIZE above
                unsafe {
                    (waiter.want_read && libc::FD_ISSET(waiter.fd, &read_set))
                        || (waiter.want_write && libc::FD_ISSET(waiter.fd, &write_set))
                }
            })
            .cloned()
            .collect()
    }
}
