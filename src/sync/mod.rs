//! Blocking synchronization primitives.
//!
//! # Primitives
//!
//! - [`BlockQueue`]: bounded blocking deque with close semantics; feeds the
//!   async logger's writer thread
//! - [`Semaphore`]: counting semaphore gating the database pool
//!
//! Everything here parks on condition variables; there is no async runtime
//! underneath. Workers block only on kernel calls and on these primitives.

mod block_queue;
mod semaphore;

pub use block_queue::BlockQueue;
pub use semaphore::Semaphore;
