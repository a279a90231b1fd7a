//! SQLite connection pool and user-table queries.
//!
//! [`DbPool`] owns a fixed set of database handles behind a counting
//! [`Semaphore`]: `acquire` blocks on the semaphore and then pops a handle
//! under the mutex, so the queue can never be empty at that point. The
//! returned [`PooledDb`] guard hands the handle back and posts exactly one
//! permit when dropped, on every path.
//!
//! The login and registration endpoints consult a single `user` table:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS user (
//!     username TEXT PRIMARY KEY,
//!     password TEXT NOT NULL
//! );
//! ```

use std::collections::VecDeque;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::sync::Semaphore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS user (
    username TEXT PRIMARY KEY,
    password TEXT NOT NULL
)";

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The row was inserted.
    Created,
    /// The username already exists.
    UsernameTaken,
}

struct PoolShared {
    handles: Mutex<VecDeque<Connection>>,
    sem: Semaphore,
    capacity: usize,
}

/// Fixed-size pool of SQLite handles.
///
/// Clones share the same pool. Handles live for the lifetime of the pool
/// and are only closed by [`close`](DbPool::close) at server shutdown.
#[derive(Clone)]
pub struct DbPool {
    shared: Arc<PoolShared>,
    path: PathBuf,
}

impl DbPool {
    /// Opens `capacity` handles on the database at `path`, creating the
    /// file and the `user` table if needed.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> rusqlite::Result<Self> {
        assert!(capacity > 0, "pool capacity must be positive");
        let path = path.as_ref().to_path_buf();

        let mut handles = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            if i == 0 {
                conn.execute_batch(SCHEMA)?;
            }
            handles.push_back(conn);
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                handles: Mutex::new(handles),
                sem: Semaphore::new(capacity),
                capacity,
            }),
            path,
        })
    }

    /// Borrows a handle, blocking until one is free.
    #[must_use]
    pub fn acquire(&self) -> PooledDb {
        self.shared.sem.acquire();
        let conn = self
            .shared
            .handles
            .lock()
            .expect("db pool lock poisoned")
            .pop_front()
            .expect("semaphore permit without pooled handle");
        PooledDb {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of handles currently idle in the pool.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.shared
            .handles
            .lock()
            .expect("db pool lock poisoned")
            .len()
    }

    /// Total number of handles this pool was opened with.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes every idle handle. Call only at shutdown, after the workers
    /// have stopped; handles still borrowed are closed when their guard
    /// drops back into the drained pool.
    pub fn close(&self) {
        let mut handles = self.shared.handles.lock().expect("db pool lock poisoned");
        handles.clear();
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("capacity", &self.shared.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}

/// RAII guard for a borrowed database handle.
///
/// Dereferences to [`rusqlite::Connection`]; dropping it returns the handle
/// and posts the semaphore permit.
pub struct PooledDb {
    conn: Option<Connection>,
    shared: Arc<PoolShared>,
}

impl Deref for PooledDb {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("pooled handle already returned")
    }
}

impl Drop for PooledDb {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared
                .handles
                .lock()
                .expect("db pool lock poisoned")
                .push_back(conn);
        }
        self.shared.sem.release();
    }
}

impl std::fmt::Debug for PooledDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledDb").finish_non_exhaustive()
    }
}

/// Checks `username`/`password` against the `user` table.
pub fn verify_login(conn: &Connection, username: &str, password: &str) -> rusqlite::Result<bool> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT password FROM user WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stored.is_some_and(|p| p == password))
}

/// Inserts a new user unless the name is taken.
pub fn register_user(
    conn: &Connection,
    username: &str,
    password: &str,
) -> rusqlite::Result<RegisterOutcome> {
    let taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM user WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Ok(RegisterOutcome::UsernameTaken);
    }
    conn.execute(
        "INSERT INTO user (username, password) VALUES (?1, ?2)",
        params![username, password],
    )?;
    Ok(RegisterOutcome::Created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn temp_pool(capacity: usize) -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(dir.path().join("test.db"), capacity).unwrap();
        (dir, pool)
    }

    #[test]
    fn open_creates_schema() {
        let (_dir, pool) = temp_pool(2);
        let conn = pool.acquire();
        assert!(!verify_login(&conn, "nobody", "nothing").unwrap());
    }

    #[test]
    fn free_count_plus_in_use_is_constant() {
        let (_dir, pool) = temp_pool(3);
        assert_eq!(pool.free_count(), 3);

        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.shared.sem.available_permits(), 1);

        drop(a);
        assert_eq!(pool.free_count(), 2);
        drop(b);
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.shared.sem.available_permits(), 3);
    }

    #[test]
    fn acquire_blocks_when_exhausted() {
        let (_dir, pool) = temp_pool(1);
        let guard = pool.acquire();

        let contender = {
            let pool = pool.clone();
            thread::spawn(move || {
                let _g = pool.acquire();
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!contender.is_finished());

        drop(guard);
        contender.join().unwrap();
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn guard_returns_handle_on_error_paths() {
        let (_dir, pool) = temp_pool(1);
        {
            let conn = pool.acquire();
            // A failing statement must not leak the handle.
            assert!(conn.execute("INSERT INTO missing VALUES (1)", []).is_err());
        }
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn register_then_login_round_trip() {
        let (_dir, pool) = temp_pool(2);
        let conn = pool.acquire();

        assert_eq!(
            register_user(&conn, "alice", "secret").unwrap(),
            RegisterOutcome::Created
        );
        assert!(verify_login(&conn, "alice", "secret").unwrap());
        assert!(!verify_login(&conn, "alice", "wrong").unwrap());
        assert!(!verify_login(&conn, "bob", "secret").unwrap());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (_dir, pool) = temp_pool(1);
        let conn = pool.acquire();

        assert_eq!(
            register_user(&conn, "alice", "one").unwrap(),
            RegisterOutcome::Created
        );
        assert_eq!(
            register_user(&conn, "alice", "two").unwrap(),
            RegisterOutcome::UsernameTaken
        );
        // The original password survives the rejected attempt.
        assert!(verify_login(&conn, "alice", "one").unwrap());
    }

    #[test]
    fn concurrent_borrowers_stay_balanced() {
        let (_dir, pool) = temp_pool(4);
        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for j in 0..20 {
                    let conn = pool.acquire();
                    let name = format!("user-{i}-{j}");
                    register_user(&conn, &name, "pw").unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.free_count(), 4);
    }
}
