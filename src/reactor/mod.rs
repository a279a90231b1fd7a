//! Epoll wrapper: readiness events, one-shot arming, and a wake channel.
//!
//! [`Epoller`] owns the epoll file descriptor and is a pure multiplexer: it
//! holds no connection state. Registration control-plane calls
//! ([`add`](Epoller::add), [`modify`](Epoller::modify),
//! [`delete`](Epoller::delete)) are safe to issue from worker threads while
//! the reactor thread blocks in [`wait`](Epoller::wait); the kernel
//! serializes them. [`wait`](Epoller::wait) itself must only be called from
//! the reactor thread, which owns the [`Events`] buffer.
//!
//! An `eventfd` is registered internally so [`wake`](Epoller::wake) can
//! interrupt a blocked `wait` (shutdown uses this). Wake notifications are
//! drained inside `wait` and never surface as events.
//!
//! # One-shot arming
//!
//! Connections are registered with [`EventSet::ONESHOT`]: after one
//! delivery the kernel disarms the descriptor until a `modify` re-arms it.
//! This is what guarantees at most one worker drives a given connection at
//! any instant.

#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Bitset of epoll events and arming flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u32);

#[allow(clippy::cast_sign_loss)]
impl EventSet {
    /// No events.
    pub const EMPTY: EventSet = EventSet(0);
    /// The descriptor is readable.
    pub const READABLE: EventSet = EventSet(libc::EPOLLIN as u32);
    /// The descriptor is writable.
    pub const WRITABLE: EventSet = EventSet(libc::EPOLLOUT as u32);
    /// The peer shut down its writing half.
    pub const PEER_CLOSED: EventSet = EventSet(libc::EPOLLRDHUP as u32);
    /// Hangup on the descriptor.
    pub const HANGUP: EventSet = EventSet(libc::EPOLLHUP as u32);
    /// Error condition on the descriptor.
    pub const ERROR: EventSet = EventSet(libc::EPOLLERR as u32);
    /// Edge-triggered delivery.
    pub const EDGE: EventSet = EventSet(libc::EPOLLET as u32);
    /// Disarm after one delivery until re-armed with `modify`.
    pub const ONESHOT: EventSet = EventSet(libc::EPOLLONESHOT as u32);

    /// Builds a set from raw epoll bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw epoll bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Readable bit set?
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.intersects(Self::READABLE)
    }

    /// Writable bit set?
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE)
    }

    /// Peer-shutdown, hangup, or error bit set?
    #[must_use]
    pub const fn is_closed_or_error(self) -> bool {
        self.0 & (Self::PEER_CLOSED.0 | Self::HANGUP.0 | Self::ERROR.0) != 0
    }
}

impl std::ops::BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

/// A single readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    fd: RawFd,
    set: EventSet,
}

impl Event {
    /// The descriptor this event is for.
    #[must_use]
    pub const fn fd(self) -> RawFd {
        self.fd
    }

    /// The readiness bits.
    #[must_use]
    pub const fn set(self) -> EventSet {
        self.set
    }
}

/// Caller-owned buffer for [`Epoller::wait`] results.
pub struct Events {
    raw: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    /// Creates a buffer able to receive up to `capacity` events per wait.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
            len: 0,
        }
    }

    /// Number of events from the last wait.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the last wait produced no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The descriptor of event `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len()`.
    #[must_use]
    pub fn fd(&self, i: usize) -> RawFd {
        assert!(i < self.len);
        let ev = self.raw[i];
        ev.u64 as RawFd
    }

    /// The readiness bits of event `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len()`.
    #[must_use]
    pub fn set(&self, i: usize) -> EventSet {
        assert!(i < self.len);
        let ev = self.raw[i];
        EventSet::from_bits(ev.events)
    }

    /// Iterates over the events of the last wait.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        (0..self.len).map(move |i| Event {
            fd: self.fd(i),
            set: self.set(i),
        })
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events")
            .field("len", &self.len)
            .field("capacity", &self.raw.len())
            .finish()
    }
}

/// The epoll instance plus its wake eventfd.
pub struct Epoller {
    epfd: RawFd,
    wake_fd: RawFd,
}

impl Epoller {
    /// Creates the epoll instance and registers the internal wake channel.
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall; the returned fd is owned by this struct.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: plain syscall; the returned fd is owned by this struct.
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: epfd came from epoll_create1 above.
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let poller = Self { epfd, wake_fd };
        poller.ctl(libc::EPOLL_CTL_ADD, wake_fd, EventSet::READABLE)?;
        Ok(poller)
    }

    /// Registers `fd` for the events in `set`.
    pub fn add(&self, fd: RawFd, set: EventSet) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, set)
    }

    /// Re-arms or changes the registration of `fd`.
    pub fn modify(&self, fd: RawFd, set: EventSet) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, set)
    }

    /// Removes `fd` from the interest list.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, EventSet::EMPTY)
    }

    /// Blocks until events arrive, the timeout elapses, or a wake is posted.
    ///
    /// `None` blocks indefinitely. Returns the number of events stored in
    /// `events`; wake notifications are drained internally and not
    /// reported. A signal interruption reports zero events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) if d.is_zero() => 0,
            // Round sub-millisecond timeouts up so a pending timer cannot
            // spin the loop at zero.
            Some(d) => d.as_millis().max(1).min(i32::MAX as u128) as libc::c_int,
        };

        // SAFETY: the buffer pointer and length come from a live Vec whose
        // elements are plain-old-data epoll_event structs.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.raw.as_mut_ptr(),
                events.raw.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            events.len = 0;
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        // Filter out the wake channel, draining its counter as we go.
        let mut kept = 0;
        for i in 0..n as usize {
            let ev = events.raw[i];
            if ev.u64 == self.wake_fd as u64 {
                self.drain_wake();
                continue;
            }
            events.raw[kept] = ev;
            kept += 1;
        }
        events.len = kept;
        Ok(kept)
    }

    /// Interrupts a blocked [`wait`](Self::wait) from any thread.
    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        // SAFETY: writing 8 bytes from a stack u64 to an owned eventfd.
        let n = unsafe {
            libc::write(
                self.wake_fd,
                std::ptr::addr_of!(one).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // A full eventfd counter still wakes the poller.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    fn drain_wake(&self) {
        let mut counter: u64 = 0;
        // SAFETY: reading 8 bytes into a stack u64 from an owned eventfd.
        let _ = unsafe {
            libc::read(
                self.wake_fd,
                std::ptr::addr_of_mut!(counter).cast(),
                std::mem::size_of::<u64>(),
            )
        };
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, set: EventSet) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: set.bits(),
            u64: fd as u64,
        };
        // SAFETY: epfd and the event struct are valid for the duration of
        // the call; the kernel copies the struct.
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, std::ptr::addr_of_mut!(ev)) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        // SAFETY: both fds are owned by this struct and closed exactly once.
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epfd);
        }
    }
}

impl std::fmt::Debug for Epoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epoller")
            .field("epfd", &self.epfd)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn event_set_bit_operations() {
        let set = EventSet::READABLE | EventSet::ONESHOT | EventSet::PEER_CLOSED;
        assert!(set.is_readable());
        assert!(!set.is_writable());
        assert!(set.contains(EventSet::ONESHOT));
        assert!(set.is_closed_or_error());
        assert!(!EventSet::WRITABLE.is_closed_or_error());
        assert_eq!(
            EventSet::from_bits(set.bits()).bits(),
            set.bits()
        );
    }

    #[test]
    fn wait_times_out_with_no_events() {
        let poller = Epoller::new().unwrap();
        let mut events = Events::with_capacity(8);

        let start = Instant::now();
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn readable_socket_produces_event() {
        let poller = Epoller::new().unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        poller.add(b.as_raw_fd(), EventSet::READABLE).unwrap();

        a.write_all(b"ping").unwrap();

        let mut events = Events::with_capacity(8);
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events.fd(0), b.as_raw_fd());
        assert!(events.set(0).is_readable());

        poller.delete(b.as_raw_fd()).unwrap();
    }

    #[test]
    fn oneshot_disarms_until_rearmed() {
        let poller = Epoller::new().unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        poller
            .add(b.as_raw_fd(), EventSet::READABLE | EventSet::ONESHOT)
            .unwrap();

        a.write_all(b"ping").unwrap();

        let mut events = Events::with_capacity(8);
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(n, 1);

        // Still readable, but the one-shot registration is disarmed.
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(n, 0);

        poller
            .modify(b.as_raw_fd(), EventSet::READABLE | EventSet::ONESHOT)
            .unwrap();
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn wake_interrupts_blocked_wait() {
        let poller = std::sync::Arc::new(Epoller::new().unwrap());
        let waker = {
            let poller = std::sync::Arc::clone(&poller);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                poller.wake().unwrap();
            })
        };

        let mut events = Events::with_capacity(8);
        let start = Instant::now();
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        // The wake itself is filtered out of the results.
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_secs(2));
        waker.join().unwrap();
    }

    #[test]
    fn delete_stops_notifications() {
        let poller = Epoller::new().unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        poller.add(b.as_raw_fd(), EventSet::READABLE).unwrap();
        poller.delete(b.as_raw_fd()).unwrap();

        a.write_all(b"ping").unwrap();
        let mut events = Events::with_capacity(8);
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn modify_unregistered_fd_fails() {
        let poller = Epoller::new().unwrap();
        let (_a, b) = UnixStream::pair().unwrap();
        let err = poller
            .modify(b.as_raw_fd(), EventSet::READABLE)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn peer_shutdown_reports_closure() {
        let poller = Epoller::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        poller
            .add(b.as_raw_fd(), EventSet::READABLE | EventSet::PEER_CLOSED)
            .unwrap();

        drop(a);

        let mut events = Events::with_capacity(8);
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(n, 1);
        assert!(events.set(0).is_closed_or_error());
    }
}
