//! Blocking counting semaphore.
//!
//! A semaphore controls access to a finite number of resources through
//! permits. [`acquire`](Semaphore::acquire) parks the calling thread until a
//! permit is available; [`release`](Semaphore::release) posts one back. The
//! database pool initializes the count to its handle count, so a worker can
//! only pop a handle it is guaranteed to find.

use std::sync::{Condvar, Mutex};

/// A counting semaphore for limiting concurrent access.
///
/// # Example
///
/// ```
/// use hearth::sync::Semaphore;
///
/// let sem = Semaphore::new(2);
/// sem.acquire();
/// assert_eq!(sem.available_permits(), 1);
/// sem.release();
/// assert_eq!(sem.available_permits(), 2);
/// ```
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with the given number of permits.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Takes one permit, blocking until one is available.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock().expect("semaphore lock poisoned");
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .expect("semaphore lock poisoned");
        }
        *permits -= 1;
    }

    /// Takes one permit without blocking; returns false if none is free.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().expect("semaphore lock poisoned");
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Posts one permit back and wakes a waiter.
    pub fn release(&self) {
        let mut permits = self.permits.lock().expect("semaphore lock poisoned");
        *permits += 1;
        drop(permits);
        self.available.notify_one();
    }

    /// Number of permits currently available.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        *self.permits.lock().expect("semaphore lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_and_release_track_permits() {
        let sem = Semaphore::new(3);
        sem.acquire();
        sem.acquire();
        assert_eq!(sem.available_permits(), 1);
        sem.release();
        assert_eq!(sem.available_permits(), 2);
    }

    #[test]
    fn try_acquire_fails_at_zero() {
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert!(sem.try_acquire());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.acquire();
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        sem.release();
        waiter.join().unwrap();
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn contended_acquire_release_balances() {
        let sem = Arc::new(Semaphore::new(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let sem = Arc::clone(&sem);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    sem.acquire();
                    sem.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sem.available_permits(), 4);
    }
}
