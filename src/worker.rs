//! Fixed-size worker thread pool.
//!
//! Workers drain a shared FIFO of boxed tasks, parking on a condition
//! variable while it is empty. Shutdown marks the pool closed and wakes
//! everyone; each worker drains whatever is still queued and exits when it
//! next finds the queue empty. Tasks must not assume any ordering across
//! connections or any worker affinity.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::log_error;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// A fixed pool of worker threads executing no-argument tasks.
///
/// # Example
///
/// ```
/// use hearth::worker::WorkerPool;
///
/// let pool = WorkerPool::new(2);
/// pool.submit(|| println!("on a worker"));
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `count` worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `count` is 0.
    #[must_use]
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "worker count must be positive");

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("hearth-worker-{i}"))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            shared,
            handles: Mutex::new(handles),
        }
    }

    /// Enqueues a task and wakes one worker.
    ///
    /// Returns false (dropping the task) if the pool is shut down.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock().expect("worker pool lock poisoned");
            if state.closed {
                return false;
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.cond.notify_one();
        true
    }

    /// Number of tasks waiting for a worker.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("worker pool lock poisoned")
            .tasks
            .len()
    }

    /// Closes the queue, wakes every worker, and joins them.
    ///
    /// Queued tasks are drained before the workers exit. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("worker pool lock poisoned");
            state.closed = true;
        }
        self.shared.cond.notify_all();
        let mut handles = self.handles.lock().expect("worker pool lock poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &PoolShared) {
    let mut state = shared.state.lock().expect("worker pool lock poisoned");
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            // A panicking task must not take the worker down with it; the
            // owning connection is closed by the error paths inside the task.
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                log_error!("worker task panicked");
            }
            state = shared.state.lock().expect("worker pool lock poisoned");
        } else if state.closed {
            break;
        } else {
            state = shared.cond.wait(state).expect("worker pool lock poisoned");
        }
    }
}
