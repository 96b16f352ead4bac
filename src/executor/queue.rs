// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::work::WorkItem;

/// One worker's run queue.
///
/// The owning worker pushes and pops at the tail (LIFO, cache-warm);
/// thieves take from the head (FIFO from the producer's point of view).
/// A short critical section under a spin lock covers every access, the
/// stolen prefix of the buffer is compacted away once the head has walked
/// past half of it.
///
/// Invariant: only the owning worker pushes.
#[derive(Debug, Default)]
pub(super) struct WorkerQueue {
    buffer: spin::Mutex<Buffer>,
}

#[derive(Debug, Default)]
struct Buffer {
    items: Vec<WorkItem>,
    head: usize,
}

/// The shared FIFO for producers outside the pool.
///
/// Any thread pushes, any worker whose own deque is empty drains it.
#[derive(Debug, Default)]
pub(super) struct InjectionQueue {
    items: Mutex<VecDeque<WorkItem>>,
}

// === impl WorkerQueue ===

impl WorkerQueue {
    // Don't bother compacting tiny buffers.
    const COMPACT_MIN: usize = 64;

    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Appends `item` at the tail. Owner only.
    pub(super) fn push(&self, item: WorkItem) {
        self.buffer.lock().items.push(item);
    }

    /// Pops from the tail (the owner's end).
    pub(super) fn pop(&self) -> Option<WorkItem> {
        let mut buffer = self.buffer.lock();
        if buffer.items.len() <= buffer.head {
            return None;
        }
        let item = buffer.items.pop();
        if buffer.items.len() <= buffer.head {
            buffer.items.clear();
            buffer.head = 0;
        }
        item
    }

    /// Takes one item from the head (the thieves' end).
    pub(super) fn steal(&self) -> Option<WorkItem> {
        let mut buffer = self.buffer.lock();
        if buffer.items.len() <= buffer.head {
            return None;
        }
        let head = buffer.head;
        let item = core::mem::take(&mut buffer.items[head]);
        buffer.head += 1;

        if buffer.head >= buffer.items.len() {
            buffer.items.clear();
            buffer.head = 0;
        } else if buffer.head > Self::COMPACT_MIN && buffer.head * 2 > buffer.items.len() {
            // Compact occasionally to bound memory usage.
            let head = buffer.head;
            buffer.items.drain(..head);
            buffer.head = 0;
        }

        Some(item)
    }

    pub(super) fn clear(&self) {
        let mut buffer = self.buffer.lock();
        buffer.items.clear();
        buffer.head = 0;
    }
}

// === impl InjectionQueue ===

impl InjectionQueue {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn push(&self, item: WorkItem) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
    }

    pub(super) fn pop(&self) -> Option<WorkItem> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub(super) fn clear(&self) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn marker(order: &Arc<Mutex<Vec<usize>>>, n: usize) -> WorkItem {
        let order = Arc::clone(order);
        WorkItem::job(move || {
            order.lock().unwrap().push(n);
        })
    }

    #[test]
    fn owner_pops_lifo() {
        let queue = WorkerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            queue.push(marker(&order, n));
        }
        while let Some(mut item) = queue.pop() {
            item.invoke();
        }

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn thief_steals_fifo() {
        let queue = WorkerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            queue.push(marker(&order, n));
        }
        while let Some(mut item) = queue.steal() {
            item.invoke();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn compaction_loses_nothing() {
        let queue = WorkerQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));

        const TOTAL: usize = 500;
        for _ in 0..TOTAL {
            let hits = Arc::clone(&hits);
            queue.push(WorkItem::job(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
        }

        // Steal enough to drive the head across the compaction threshold,
        // then drain the rest from both ends.
        for _ in 0..(TOTAL / 2) {
            let mut item = queue.steal().expect("queue should not be empty yet");
            item.invoke();
        }
        loop {
            let Some(mut item) = queue.pop() else { break };
            item.invoke();
            let Some(mut item) = queue.steal() else {
                continue;
            };
            item.invoke();
        }

        assert_eq!(hits.load(Ordering::Relaxed), TOTAL);
        assert!(queue.pop().is_none());
        assert!(queue.steal().is_none());
    }

    #[test]
    fn injection_is_fifo() {
        let queue = InjectionQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..4 {
            let order = Arc::clone(&order);
            queue.push(WorkItem::job(move || order.lock().unwrap().push(n)));
        }
        while let Some(mut item) = queue.pop() {
            item.invoke();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn clear_discards_pending_items() {
        let queue = WorkerQueue::new();
        queue.push(WorkItem::job(|| panic!("cleared item must not run")));
        queue.clear();
        assert!(queue.pop().is_none());
    }
}
