//! Hearth: an event-driven HTTP/1.1 server for static files and form login.
//!
//! # Overview
//!
//! Hearth serves a document root over HTTP/1.1 keep-alive connections and
//! handles two form-encoded POST endpoints (`/login`, `/register`) backed by
//! an embedded SQLite database. The engine is a single reactor thread over
//! epoll with one-shot arming, a fixed pool of worker threads that parse
//! requests and compose responses against per-connection byte buffers, an
//! indexed min-heap of inactivity timers, and a semaphore-gated database
//! connection pool.
//!
//! # Module Structure
//!
//! - [`buffer`]: growable byte buffer with read/write cursors and vectored I/O
//! - [`sync`]: blocking primitives (bounded queue, counting semaphore)
//! - [`logger`]: process-wide leveled logger with an async writer thread
//! - [`db`]: SQLite connection pool and the user-table queries
//! - [`worker`]: fixed-size worker thread pool
//! - [`reactor`]: epoll wrapper (readiness events, one-shot arming, wake)
//! - [`timer`]: indexed binary min-heap of inactivity timers
//! - [`http`]: request parser, response composer, connection state machine
//! - [`server`]: listener, event loop, and lifecycle
//!
//! # Example
//!
//! ```no_run
//! use hearth::server::{Server, ServerConfig};
//!
//! let config = ServerConfig::default().port(8080).workers(4);
//! let handle = Server::spawn(config).expect("server start");
//! // ... later:
//! handle.stop();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod buffer;
pub mod db;
pub mod error;
pub mod http;
pub mod logger;
pub mod reactor;
pub mod server;
pub mod sync;
pub mod timer;
pub mod worker;

pub use buffer::Buffer;
pub use error::{Result, ServerError};
pub use logger::{Level, Logger};
pub use server::{Server, ServerConfig, ServerHandle};
