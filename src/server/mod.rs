//! Server composition: listener, event loop, and lifecycle.
//!
//! One reactor thread owns the epoll instance, the listener, and the timer
//! heap. Each loop iteration fires expired inactivity timers, waits for
//! readiness with the next deadline as the timeout, and dispatches: accepts
//! on the listener (rejecting with a short busy notice at the connection
//! cap), closes on peer-shutdown/hangup/error, and hands read and write
//! events to the worker pool after extending the connection's timer.
//!
//! Workers drive the per-connection state machine and re-arm the one-shot
//! registration themselves; because a disarmed descriptor cannot fire
//! again until re-armed, at most one worker touches a connection at any
//! instant and the reactor's control-plane calls stay race-free.
//!
//! Shutdown: [`ServerHandle::stop`] sets the closing flag and wakes the
//! reactor, which closes the listener and every connection, drains the
//! worker pool, and closes the database pool.

mod config;

pub use config::ServerConfig;

use std::collections::HashMap;
use std::io::Write as _;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::db::DbPool;
use crate::error::Result;
use crate::http::Connection;
use crate::logger::Logger;
use crate::reactor::{Epoller, EventSet, Events};
use crate::timer::TimerHeap;
use crate::worker::WorkerPool;
use crate::{log_error, log_info, log_warn};

/// Listen backlog.
const BACKLOG: i32 = 6;

/// Capacity of the per-wait event buffer.
const MAX_EVENTS: usize = 1024;

/// Body sent to connections rejected at the cap, written raw to the socket.
const BUSY_NOTICE: &[u8] = b"Server busy!";

/// State shared between the reactor thread and the workers.
struct ServerInner {
    listener: TcpListener,
    listen_fd: RawFd,
    epoller: Epoller,
    connections: Mutex<HashMap<RawFd, Arc<Mutex<Connection>>>>,
    workers: WorkerPool,
    db: DbPool,
    doc_root: PathBuf,
    user_count: Arc<AtomicUsize>,
    max_connections: usize,
    timeout: Option<Duration>,
    conn_events: EventSet,
    listen_edge: bool,
    conn_edge: bool,
    closing: AtomicBool,
}

impl ServerInner {
    fn connection(&self, fd: RawFd) -> Option<Arc<Mutex<Connection>>> {
        self.connections
            .lock()
            .expect("connection table poisoned")
            .get(&fd)
            .cloned()
    }

    /// Unregisters and closes `fd`. Tolerates connections that are already
    /// gone (timer callbacks may outlive their connection).
    fn close_conn(&self, fd: RawFd) {
        let conn = self
            .connections
            .lock()
            .expect("connection table poisoned")
            .remove(&fd);
        let Some(conn) = conn else {
            return;
        };
        let _ = self.epoller.delete(fd);
        let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
        guard.close();
        log_info!(
            "client[{fd}] quit ({} live)",
            self.user_count.load(Ordering::Relaxed)
        );
    }

    /// Worker entry for a readable event.
    fn on_read(&self, fd: RawFd, conn: &Arc<Mutex<Connection>>) {
        let close = {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.is_closed() {
                return;
            }
            match guard.read() {
                Ok(true) => self.process_and_rearm(fd, &mut guard),
                Ok(false) => true,
                Err(e) => {
                    log_warn!("read error on client[{fd}]: {e}");
                    true
                }
            }
        };
        if close {
            self.close_conn(fd);
        }
    }

    /// Worker entry for a writable event.
    fn on_write(&self, fd: RawFd, conn: &Arc<Mutex<Connection>>) {
        let close = {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.is_closed() {
                return;
            }
            match guard.write() {
                Ok(0) => {
                    if guard.is_keep_alive() {
                        // The next pipelined request may already be
                        // buffered; otherwise this re-arms readable.
                        self.process_and_rearm(fd, &mut guard)
                    } else {
                        true
                    }
                }
                Ok(_remaining) => self.rearm(fd, EventSet::WRITABLE),
                Err(e) => {
                    log_warn!("write error on client[{fd}]: {e}");
                    true
                }
            }
        };
        if close {
            self.close_conn(fd);
        }
    }

    /// Runs the parse/compose step and re-arms the descriptor for the
    /// direction it needs next. Returns true when the connection must be
    /// closed instead.
    fn process_and_rearm(&self, fd: RawFd, conn: &mut Connection) -> bool {
        let response_ready = conn.process(&self.doc_root, &self.db);
        let interest = if response_ready {
            EventSet::WRITABLE
        } else {
            EventSet::READABLE
        };
        self.rearm(fd, interest)
    }

    /// Re-arms the one-shot registration. Returns true on failure (the
    /// registration is gone, so the connection gets closed).
    fn rearm(&self, fd: RawFd, interest: EventSet) -> bool {
        match self.epoller.modify(fd, interest | self.conn_events) {
            Ok(()) => false,
            Err(e) => {
                log_warn!("re-arm failed for client[{fd}]: {e}");
                true
            }
        }
    }
}

/// The composed server. Create with [`Server::bind`], then either call
/// [`run`](Server::run) on the current thread or use [`Server::spawn`].
pub struct Server {
    inner: Arc<ServerInner>,
    timer: TimerHeap,
    events: Events,
    port: u16,
}

impl Server {
    /// Validates the configuration, opens the database pool, binds the
    /// listener, and registers it with the reactor.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        if config.log_enabled {
            Logger::init(
                crate::logger::LogConfig::default()
                    .level(config.log_level)
                    .dir(&config.log_dir)
                    .queue_size(config.log_queue_size),
            )?;
        }

        let db = DbPool::open(&config.db_path, config.db_pool_size)?;

        // Bit 0 arms connections edge-triggered, bit 1 the listener;
        // values above 3 arm both.
        let mut listen_events = EventSet::PEER_CLOSED;
        let mut conn_events = EventSet::ONESHOT | EventSet::PEER_CLOSED;
        match config.trig_mode {
            0 => {}
            1 => conn_events |= EventSet::EDGE,
            2 => listen_events |= EventSet::EDGE,
            _ => {
                listen_events |= EventSet::EDGE;
                conn_events |= EventSet::EDGE;
            }
        }
        let listen_edge = listen_events.contains(EventSet::EDGE);
        let conn_edge = conn_events.contains(EventSet::EDGE);

        let listener = make_listener(config.port, config.linger)?;
        let listen_fd = listener.as_raw_fd();

        let epoller = Epoller::new()?;
        epoller.add(listen_fd, listen_events | EventSet::READABLE)?;

        if !config.doc_root.is_dir() {
            log_warn!(
                "document root {} does not exist; static requests will 404",
                config.doc_root.display()
            );
        }

        let inner = Arc::new(ServerInner {
            listener,
            listen_fd,
            epoller,
            connections: Mutex::new(HashMap::new()),
            workers: WorkerPool::new(config.workers),
            db,
            doc_root: config.doc_root.clone(),
            user_count: Arc::new(AtomicUsize::new(0)),
            max_connections: config.max_connections,
            timeout: (config.timeout_ms > 0).then(|| Duration::from_millis(config.timeout_ms)),
            conn_events,
            listen_edge,
            conn_edge,
            closing: AtomicBool::new(false),
        });

        log_info!("========== server init ==========");
        log_info!("port: {}, linger: {}", config.port, config.linger);
        log_info!(
            "listen mode: {}, conn mode: {}",
            if listen_edge { "ET" } else { "LT" },
            if conn_edge { "ET" } else { "LT" }
        );
        log_info!("doc root: {}", config.doc_root.display());
        log_info!(
            "db pool: {}, workers: {}",
            config.db_pool_size,
            config.workers
        );

        Ok(Self {
            inner,
            timer: TimerHeap::new(),
            events: Events::with_capacity(MAX_EVENTS),
            port: config.port,
        })
    }

    /// The configured listen port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Binds and runs the server on a dedicated reactor thread.
    pub fn spawn(config: ServerConfig) -> Result<ServerHandle> {
        let server = Self::bind(config)?;
        let inner = Arc::clone(&server.inner);
        let thread = thread::Builder::new()
            .name("hearth-reactor".to_string())
            .spawn(move || server.run())
            .expect("failed to spawn reactor thread");
        Ok(ServerHandle {
            inner,
            thread: Some(thread),
        })
    }

    /// Runs the event loop on the current thread until stopped.
    pub fn run(mut self) {
        log_info!("========== server start (port {}) ==========", self.port);
        while !self.inner.closing.load(Ordering::Acquire) {
            let timeout = if self.inner.timeout.is_some() {
                self.timer.next_tick()
            } else {
                None
            };
            let count = match self.inner.epoller.wait(&mut self.events, timeout) {
                Ok(count) => count,
                Err(e) => {
                    log_error!("epoll wait failed: {e}");
                    continue;
                }
            };
            for i in 0..count {
                let fd = self.events.fd(i);
                let set = self.events.set(i);
                if fd == self.inner.listen_fd {
                    self.deal_listen();
                } else if set.is_closed_or_error() {
                    self.inner.close_conn(fd);
                } else if set.is_readable() {
                    self.deal_read(fd);
                } else if set.is_writable() {
                    self.deal_write(fd);
                } else {
                    log_error!("unexpected event {set:?} on fd {fd}");
                }
            }
        }
        self.shutdown();
    }

    /// Accepts pending clients; at the cap, rejects with the busy notice.
    fn deal_listen(&mut self) {
        loop {
            match self.inner.listener.accept() {
                Ok((stream, addr)) => {
                    if self.inner.user_count.load(Ordering::Relaxed) >= self.inner.max_connections
                    {
                        send_busy(stream, addr);
                        return;
                    }
                    self.add_client(stream, addr);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log_error!("accept failed: {e}");
                    return;
                }
            }
            if !self.inner.listen_edge {
                return;
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            log_error!("failed to set client non-blocking: {e}");
            return;
        }
        let conn = Connection::new(
            stream,
            addr,
            self.inner.conn_edge,
            Arc::clone(&self.inner.user_count),
        );
        let fd = conn.fd();
        self.inner
            .connections
            .lock()
            .expect("connection table poisoned")
            .insert(fd, Arc::new(Mutex::new(conn)));

        if let Some(timeout) = self.inner.timeout {
            let inner = Arc::clone(&self.inner);
            self.timer
                .add(fd, timeout, Box::new(move || inner.close_conn(fd)));
        }

        if let Err(e) = self
            .inner
            .epoller
            .add(fd, EventSet::READABLE | self.inner.conn_events)
        {
            log_error!("failed to register client[{fd}]: {e}");
            self.inner.close_conn(fd);
            return;
        }
        log_info!(
            "client[{fd}] from {addr} in ({} live)",
            self.inner.user_count.load(Ordering::Relaxed)
        );
    }

    fn deal_read(&mut self, fd: RawFd) {
        let Some(conn) = self.inner.connection(fd) else {
            return;
        };
        self.extend_timer(fd);
        let inner = Arc::clone(&self.inner);
        self.inner.workers.submit(move || inner.on_read(fd, &conn));
    }

    fn deal_write(&mut self, fd: RawFd) {
        let Some(conn) = self.inner.connection(fd) else {
            return;
        };
        self.extend_timer(fd);
        let inner = Arc::clone(&self.inner);
        self.inner.workers.submit(move || inner.on_write(fd, &conn));
    }

    /// Postpones the connection's inactivity deadline.
    fn extend_timer(&mut self, fd: RawFd) {
        if let Some(timeout) = self.inner.timeout {
            self.timer.adjust(fd, timeout);
        }
    }

    fn shutdown(&mut self) {
        log_info!("========== server shutting down ==========");
        let _ = self.inner.epoller.delete(self.inner.listen_fd);

        let fds: Vec<RawFd> = self
            .inner
            .connections
            .lock()
            .expect("connection table poisoned")
            .keys()
            .copied()
            .collect();
        for fd in fds {
            self.inner.close_conn(fd);
        }
        self.timer.clear();

        self.inner.workers.shutdown();
        self.inner.db.close();
        if let Some(logger) = Logger::global() {
            logger.flush();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Handle to a server running on its reactor thread.
pub struct ServerHandle {
    inner: Arc<ServerInner>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Requests shutdown and interrupts the reactor's wait.
    pub fn stop(&self) {
        self.inner.closing.store(true, Ordering::Release);
        let _ = self.inner.epoller.wake();
    }

    /// Requests shutdown and waits for the reactor thread to finish.
    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Number of currently live connections.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.inner.user_count.load(Ordering::Relaxed)
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.listener.local_addr()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("live_connections", &self.live_connections())
            .finish_non_exhaustive()
    }
}

/// Builds the non-blocking listen socket with `SO_REUSEADDR` and optional
/// lingering close.
fn make_listener(port: u16, linger: bool) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if linger {
        socket.set_linger(Some(Duration::from_secs(1)))?;
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Writes the busy notice to an over-cap client and closes it.
fn send_busy(mut stream: TcpStream, addr: SocketAddr) {
    log_warn!("connection cap reached, rejecting {addr}");
    if let Err(e) = stream.write_all(BUSY_NOTICE) {
        log_warn!("failed to send busy notice to {addr}: {e}");
    }
}
