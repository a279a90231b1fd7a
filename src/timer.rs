//! Indexed binary min-heap of inactivity timers.
//!
//! Each node carries a timer id (the connection's fd), an expiry instant,
//! and a boxed callback. A side map tracks the heap slot of every live id,
//! so refreshing a connection's deadline on each I/O event is O(log n)
//! without searching. Only the reactor thread touches the heap.
//!
//! Comparisons are strict on the expiry instant; nodes with equal expiries
//! may fire in either order and callers must not depend on ordering among
//! ties. Callbacks are removed from the heap before they run, so a callback
//! may safely re-add its own id.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Callback invoked when a timer fires or is worked explicitly.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: RawFd,
    expires: Instant,
    cb: Option<TimerCallback>,
}

/// Min-heap of timers keyed by expiry, indexed by id.
///
/// Invariants: the array is a binary min-heap on `expires`; `slots[id] == i`
/// iff `heap[i].id == id`; every live id appears exactly once.
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    slots: HashMap<RawFd, usize>,
}

impl TimerHeap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            slots: HashMap::with_capacity(64),
        }
    }

    /// Number of live timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if no timers are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Inserts a timer for `id`, or refreshes an existing one.
    ///
    /// For a new id the node is appended and sifted up. For an existing id
    /// the expiry and callback are overwritten in place (last write wins)
    /// and the node is sifted down, falling back to a sift up if it did not
    /// move.
    pub fn add(&mut self, id: RawFd, timeout: Duration, cb: TimerCallback) {
        let expires = Instant::now() + timeout;
        if let Some(&i) = self.slots.get(&id) {
            self.heap[i].expires = expires;
            self.heap[i].cb = Some(cb);
            let n = self.heap.len();
            if !self.sift_down(i, n) {
                self.sift_up(i);
            }
        } else {
            let i = self.heap.len();
            self.slots.insert(id, i);
            self.heap.push(TimerNode {
                id,
                expires,
                cb: Some(cb),
            });
            self.sift_up(i);
        }
    }

    /// Postpones the deadline of an existing timer; the callback stays.
    ///
    /// Unknown ids are ignored.
    pub fn adjust(&mut self, id: RawFd, timeout: Duration) {
        let Some(&i) = self.slots.get(&id) else {
            return;
        };
        self.heap[i].expires = Instant::now() + timeout;
        let n = self.heap.len();
        self.sift_down(i, n);
    }

    /// Runs the callback of `id` (if it is live) and deletes the node.
    pub fn do_work(&mut self, id: RawFd) {
        let Some(&i) = self.slots.get(&id) else {
            return;
        };
        let cb = self.heap[i].cb.take();
        self.delete(i);
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Deletes the root without running its callback.
    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.delete(0);
        }
    }

    /// Fires every expired timer, earliest first.
    pub fn tick(&mut self) {
        let now = Instant::now();
        loop {
            let expired = self.heap.first().is_some_and(|root| root.expires <= now);
            if !expired {
                break;
            }
            let cb = self.heap[0].cb.take();
            self.delete(0);
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    /// Fires expired timers, then reports the time until the next expiry.
    ///
    /// Returns `None` when no timers remain.
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.tick();
        let now = Instant::now();
        self.heap
            .first()
            .map(|node| node.expires.saturating_duration_since(now))
    }

    /// Drops every timer without firing anything.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
    }

    /// Removes slot `i`: swap with the last element, re-sift the
    /// replacement, then drop the tail node.
    fn delete(&mut self, i: usize) {
        debug_assert!(i < self.heap.len());
        let last = self.heap.len() - 1;
        if i < last {
            self.swap_nodes(i, last);
            if !self.sift_down(i, last) {
                self.sift_up(i);
            }
        }
        let node = self.heap.pop().expect("delete on empty heap");
        self.slots.remove(&node.id);
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.slots.insert(self.heap[i].id, i);
        self.slots.insert(self.heap[j].id, j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires < self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Sifts slot `index` down within `heap[..n]`. Returns true if the node
    /// moved.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires < self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > index
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHeap")
            .field("len", &self.heap.len())
            .finish()
    }
}
