//! Per-client connection state machine.
//!
//! A [`Connection`] owns the socket, an input and an output [`Buffer`], the
//! incremental parser, and the composed [`Response`]. Workers drive it
//! through three entry points: [`read`](Connection::read) drains the socket
//! into the input buffer, [`process`](Connection::process) parses and
//! composes, and [`write`](Connection::write) issues the two-segment
//! gathered write (headers in the buffer, file body as a mapped region).
//!
//! One-shot arming in the reactor guarantees at most one worker touches a
//! connection at a time; the server re-arms the descriptor for the
//! opposite direction after every step. Under edge-triggered mode the read
//! and write loops run until the socket reports would-block; under
//! level-triggered mode a single attempt is made and the next event is
//! trusted.
//!
//! [`close`](Connection::close) is idempotent and decrements the process
//! live-connection counter exactly once.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::request::{ParseStatus, Request, RequestParser};
use super::response::Response;
use super::types::Method;
use crate::buffer::Buffer;
use crate::db::{self, DbPool, RegisterOutcome};
use crate::{log_debug, log_error, log_warn};

/// Under level-triggered mode, keep writing without a fresh event while
/// more than this many bytes remain.
const WRITE_DRAIN_THRESHOLD: usize = 10_240;

/// Per-client connection state.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    fd: RawFd,
    in_buf: Buffer,
    out_buf: Buffer,
    parser: RequestParser,
    response: Option<Response>,
    file_written: usize,
    keep_alive: bool,
    edge_triggered: bool,
    closed: bool,
    user_count: Arc<AtomicUsize>,
    created_at: Instant,
}

impl Connection {
    /// Wraps an accepted socket and increments the live-connection counter.
    #[must_use]
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        edge_triggered: bool,
        user_count: Arc<AtomicUsize>,
    ) -> Self {
        user_count.fetch_add(1, Ordering::Relaxed);
        let fd = stream.as_raw_fd();
        Self {
            stream,
            peer_addr,
            fd,
            in_buf: Buffer::new(),
            out_buf: Buffer::new(),
            parser: RequestParser::new(),
            response: None,
            file_written: 0,
            keep_alive: false,
            edge_triggered,
            closed: false,
            user_count,
            created_at: Instant::now(),
        }
    }

    /// The connection's file descriptor (also its timer id).
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The peer's address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the current response leaves the connection open.
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// When the connection was accepted.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Bytes still owed to the peer (headers plus unmapped file remainder).
    #[must_use]
    pub fn to_write_bytes(&self) -> usize {
        let file_remaining = self
            .response
            .as_ref()
            .map_or(0, |r| r.file_segment().len() - self.file_written);
        self.out_buf.readable_bytes() + file_remaining
    }

    /// Shuts the socket down and decrements the live-connection counter.
    ///
    /// Idempotent; only the first call counts.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.user_count.fetch_sub(1, Ordering::Relaxed);
        let _ = self.stream.shutdown(Shutdown::Both);
        log_debug!("client[{}] from {} closed", self.fd, self.peer_addr);
    }

    /// Returns true once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drains the socket into the input buffer.
    ///
    /// Returns `Ok(false)` on clean end-of-stream. Would-block is not an
    /// error: the socket is simply empty for now. Under edge-triggered
    /// mode the loop runs until would-block; under level-triggered mode a
    /// single read is issued.
    pub fn read(&mut self) -> io::Result<bool> {
        loop {
            match self.in_buf.read_from(&mut self.stream) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    if !self.edge_triggered {
                        return Ok(true);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Issues the gathered write for both response segments.
    ///
    /// Returns the bytes still to write: 0 means the response is fully on
    /// the wire. A would-block condition stops the loop with the remainder
    /// reported, so the caller re-arms for writable.
    pub fn write(&mut self) -> io::Result<usize> {
        if self.to_write_bytes() == 0 {
            return Ok(0);
        }
        loop {
            let head_len = self.out_buf.readable_bytes();
            let file = self
                .response
                .as_ref()
                .map_or(&[][..], Response::file_segment);
            let n = match self
                .out_buf
                .write_gathered(&mut self.stream, &file[self.file_written..])
            {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(self.to_write_bytes())
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted no bytes",
                ));
            }
            if n > head_len {
                self.file_written += n - head_len;
            }

            let remaining = self.to_write_bytes();
            if remaining == 0 {
                return Ok(0);
            }
            if !self.edge_triggered && remaining <= WRITE_DRAIN_THRESHOLD {
                return Ok(remaining);
            }
        }
    }

    /// Parses buffered input and, when a request is complete, composes the
    /// response.
    ///
    /// Returns true when a response is ready to write (the server re-arms
    /// the descriptor writable), false when more input is needed.
    pub fn process(&mut self, root: &Path, db: &DbPool) -> bool {
        if self.in_buf.readable_bytes() == 0 {
            return false;
        }
        match self.parser.parse(&mut self.in_buf) {
            Ok(ParseStatus::NeedMore) => false,
            Ok(ParseStatus::Complete) => {
                let request = self.parser.take_request();
                self.keep_alive = request.is_keep_alive();
                log_debug!(
                    "{} {} from {} (keep-alive: {})",
                    request.method,
                    request.path,
                    self.peer_addr,
                    self.keep_alive
                );
                let (path, status) = route(&request, db);
                self.install_response(Response::build(root, &path, self.keep_alive, status));
                true
            }
            Err(e) => {
                log_warn!("bad request from {}: {}", self.peer_addr, e);
                self.keep_alive = false;
                self.parser.reset();
                self.in_buf.retrieve_all();
                self.install_response(Response::build(root, "/", false, 400));
                true
            }
        }
    }

    fn install_response(&mut self, response: Response) {
        let mut buf = std::mem::take(&mut self.out_buf);
        response.compose(&mut buf);
        self.out_buf = buf;
        self.response = Some(response);
        self.file_written = 0;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer_addr)
            .field("keep_alive", &self.keep_alive)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Maps a request to the page to serve and the status verdict.
///
/// POST to the login or registration page consults the database; every
/// other request is served as a static file. A database failure keeps the
/// connection usable and reports a 500.
fn route(request: &Request, db: &DbPool) -> (String, u16) {
    let is_login = request.path == "/login.html";
    let is_register = request.path == "/register.html";
    if request.method != Method::Post || (!is_login && !is_register) {
        return (request.path.clone(), 200);
    }

    let form = request.form();
    let (Some(username), Some(password)) = (form.get("username"), form.get("password")) else {
        return ("/error.html".to_owned(), 200);
    };

    let handle = db.acquire();
    let verdict = if is_login {
        db::verify_login(&handle, username, password)
    } else {
        db::register_user(&handle, username, password).map(|o| o == RegisterOutcome::Created)
    };
    drop(handle);

    match verdict {
        Ok(true) => ("/welcome.html".to_owned(), 200),
        Ok(false) => ("/error.html".to_owned(), 200),
        Err(e) => {
            log_error!("database failure handling {}: {e}", request.path);
            ("/error.html".to_owned(), 500)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::time::Duration;

    struct Fixture {
        _root_dir: tempfile::TempDir,
        _db_dir: tempfile::TempDir,
        root: std::path::PathBuf,
        db: DbPool,
        user_count: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let root_dir = tempfile::tempdir().unwrap();
        std::fs::write(root_dir.path().join("index.html"), b"<html>home</html>").unwrap();
        std::fs::write(root_dir.path().join("welcome.html"), b"<html>welcome</html>").unwrap();
        std::fs::write(root_dir.path().join("error.html"), b"<html>error</html>").unwrap();

        let db_dir = tempfile::tempdir().unwrap();
        let db = DbPool::open(db_dir.path().join("t.db"), 1).unwrap();

        Fixture {
            root: root_dir.path().to_path_buf(),
            _root_dir: root_dir,
            _db_dir: db_dir,
            db,
            user_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accepted server-side connection plus the client socket driving it.
    fn socket_pair(fx: &Fixture) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = Connection::new(server, peer, true, Arc::clone(&fx.user_count));
        (conn, client)
    }

    fn drive_response(conn: &mut Connection, client: &mut TcpStream) -> String {
        while conn.write().unwrap() > 0 {}
        client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut response = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    break
                }
                Err(e) => panic!("client read failed: {e}"),
            }
        }
        String::from_utf8_lossy(&response).into_owned()
    }

    #[test]
    fn user_count_tracks_lifecycle_exactly_once() {
        let fx = fixture();
        let (mut conn, _client) = socket_pair(&fx);
        assert_eq!(fx.user_count.load(Ordering::Relaxed), 1);

        conn.close();
        assert_eq!(fx.user_count.load(Ordering::Relaxed), 0);
        conn.close();
        assert_eq!(fx.user_count.load(Ordering::Relaxed), 0, "close twice");
        drop(conn);
        assert_eq!(fx.user_count.load(Ordering::Relaxed), 0, "drop after close");
    }

    #[test]
    fn static_get_round_trip() {
        let fx = fixture();
        let (mut conn, mut client) = socket_pair(&fx);

        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(conn.read().unwrap());
        assert!(conn.process(&fx.root, &fx.db));
        assert!(conn.is_keep_alive());
        assert!(conn.to_write_bytes() > 0);

        let response = drive_response(&mut conn, &mut client);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 17\r\n"));
        assert!(response.ends_with("<html>home</html>"));
        assert_eq!(conn.to_write_bytes(), 0);
    }

    #[test]
    fn malformed_request_produces_400_and_drops_keep_alive() {
        let fx = fixture();
        let (mut conn, mut client) = socket_pair(&fx);

        client.write_all(b"NONSENSE\r\n\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(conn.read().unwrap());
        assert!(conn.process(&fx.root, &fx.db));
        assert!(!conn.is_keep_alive());

        let response = drive_response(&mut conn, &mut client);
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn partial_request_reports_not_ready() {
        let fx = fixture();
        let (mut conn, mut client) = socket_pair(&fx);

        client.write_all(b"GET /index.html HT").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(conn.read().unwrap());
        assert!(!conn.process(&fx.root, &fx.db));
    }

    #[test]
    fn eof_from_peer_reports_closed_stream() {
        let fx = fixture();
        let (mut conn, client) = socket_pair(&fx);
        drop(client);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!conn.read().unwrap());
    }

    #[test]
    fn login_route_hits_database() {
        let fx = fixture();
        {
            let handle = fx.db.acquire();
            db::register_user(&handle, "alice", "secret").unwrap();
        }
        let (mut conn, mut client) = socket_pair(&fx);

        let body = "username=alice&password=secret";
        let request = format!(
            "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        client.write_all(request.as_bytes()).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(conn.read().unwrap());
        assert!(conn.process(&fx.root, &fx.db));

        let response = drive_response(&mut conn, &mut client);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("<html>welcome</html>"));
        assert_eq!(fx.db.free_count(), 1, "handle returned to the pool");
    }

    #[test]
    fn failed_login_serves_error_page() {
        let fx = fixture();
        let (mut conn, mut client) = socket_pair(&fx);

        let body = "username=ghost&password=nope";
        let request = format!(
            "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        client.write_all(request.as_bytes()).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(conn.read().unwrap());
        assert!(conn.process(&fx.root, &fx.db));

        let response = drive_response(&mut conn, &mut client);
        assert!(response.ends_with("<html>error</html>"));
    }
}
