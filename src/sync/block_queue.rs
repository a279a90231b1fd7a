//! Bounded blocking deque.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A thread-safe bounded deque with blocking push/pop and close semantics.
///
/// Producers block while the queue is full, consumers block while it is
/// empty. [`close`](Self::close) clears the contents, marks the queue
/// closed, and wakes every waiter: subsequent pushes are rejected and pops
/// return `None` once the queue drains (which is immediately, since close
/// clears).
///
/// # Example
///
/// ```
/// use hearth::sync::BlockQueue;
///
/// let q = BlockQueue::new(4);
/// assert!(q.push_back("line".to_string()));
/// assert_eq!(q.pop(), Some("line".to_string()));
/// ```
pub struct BlockQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BlockQueue<T> {
    /// Creates a queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Appends an item, blocking while the queue is full.
    ///
    /// Returns false if the queue is (or becomes) closed; the item is
    /// dropped in that case.
    pub fn push_back(&self, item: T) -> bool {
        let mut state = self.lock();
        while state.items.len() >= self.capacity && !state.closed {
            state = self.not_full.wait(state).expect("queue lock poisoned");
        }
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Prepends an item, blocking while the queue is full.
    ///
    /// Returns false if the queue is (or becomes) closed.
    pub fn push_front(&self, item: T) -> bool {
        let mut state = self.lock();
        while state.items.len() >= self.capacity && !state.closed {
            state = self.not_full.wait(state).expect("queue lock poisoned");
        }
        if state.closed {
            return false;
        }
        state.items.push_front(item);
        self.not_empty.notify_one();
        true
    }

    /// Removes the front item, blocking while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        while state.items.is_empty() && !state.closed {
            state = self.not_empty.wait(state).expect("queue lock poisoned");
        }
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Like [`pop`](Self::pop), but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.items.is_empty() && !state.closed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self
                .not_empty
                .wait_timeout(state, remaining)
                .expect("queue lock poisoned");
            state = guard;
            if result.timed_out() && state.items.is_empty() {
                return None;
            }
        }
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Wakes one consumer without enqueueing anything.
    pub fn flush(&self) {
        self.not_empty.notify_one();
    }

    /// Discards all queued items.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.items.clear();
        self.not_full.notify_all();
    }

    /// Clears the queue, marks it closed, and releases every waiter.
    ///
    /// Closing an already-closed queue is a no-op.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.items.clear();
            state.closed = true;
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Current number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Returns true if the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.lock().items.len() >= self.capacity
    }

    /// The fixed capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().expect("queue lock poisoned")
    }
}

impl<T> Drop for BlockQueue<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> std::fmt::Debug for BlockQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BlockQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}
