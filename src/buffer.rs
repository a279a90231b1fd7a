//! Growable byte buffer with read/write cursors and vectored I/O.
//!
//! [`Buffer`] is the unit of data exchange between sockets, the request
//! parser, and the response composer. It keeps a contiguous byte region with
//! two monotonic cursors: the readable span is `[read_pos, write_pos)`, the
//! writable tail is `[write_pos, capacity)`, and the prefix `[0, read_pos)`
//! is reclaimable by compaction.
//!
//! # Design
//!
//! Reserving space either compacts (moves the readable span to offset 0) or
//! grows the backing storage, so appends never fail. Socket reads are
//! two-segment scatter reads: the first segment is the writable tail, the
//! second a 64 KiB stack staging area. A single syscall therefore drains up
//! to 64 KiB past the current tail, which bounds the per-event work under
//! edge-triggered polling while still making progress in one call.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};

/// Initial backing-store size for a default-constructed buffer.
const INITIAL_SIZE: usize = 1024;

/// Size of the stack staging area used by [`Buffer::read_from`].
const STAGE_SIZE: usize = 65_535;

/// A growable byte buffer with separate read and write cursors.
///
/// Invariant: `read_pos <= write_pos <= capacity` at all times. Consuming
/// never moves `write_pos`; producing never moves `read_pos`.
pub struct Buffer {
    /// Backing storage. Always fully initialized; its length is the
    /// buffer's capacity.
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Creates a buffer with the default initial capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with the given initial capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    #[inline]
    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that can be written without reserving.
    #[inline]
    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Number of bytes reclaimable in front of the readable span.
    #[inline]
    #[must_use]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// Returns true if there is nothing to read.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// The readable span.
    #[inline]
    #[must_use]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Consumes `len` bytes from the readable span.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`readable_bytes`](Self::readable_bytes).
    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve past readable span: len={len}, readable={}",
            self.readable_bytes()
        );
        self.read_pos += len;
    }

    /// Consumes the readable span up to (excluding) offset `end` within it.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Discards everything, zeroes the backing store, and resets both
    /// cursors.
    pub fn retrieve_all(&mut self) {
        self.data.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Takes the readable span out as a `String` and resets the buffer.
    ///
    /// Non-UTF-8 sequences are replaced, which never occurs for
    /// internally-generated content (log lines, response headers).
    #[must_use]
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Appends a byte slice, reserving space as needed.
    pub fn append(&mut self, src: &[u8]) {
        self.ensure_writable(src.len());
        self.data[self.write_pos..self.write_pos + src.len()].copy_from_slice(src);
        self.write_pos += src.len();
    }

    /// Appends a string slice.
    pub fn append_str(&mut self, src: &str) {
        self.append(src.as_bytes());
    }

    /// Makes room for at least `len` writable bytes.
    ///
    /// If the writable tail plus the reclaimable prefix cannot fit `len`,
    /// the backing store grows to `write_pos + len + 1`; otherwise the
    /// readable span is compacted down to offset 0.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.data.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
            debug_assert_eq!(readable, self.readable_bytes());
        }
    }

    /// Scatter-reads from `io` into the writable tail plus a stack staging
    /// area, growing the buffer only when the tail overflows.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end of stream. A
    /// would-block condition surfaces as `Err` with
    /// [`io::ErrorKind::WouldBlock`].
    pub fn read_from<R: Read>(&mut self, io: &mut R) -> io::Result<usize> {
        let mut stage = [0u8; STAGE_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let (_, tail) = self.data.split_at_mut(self.write_pos);
            let mut segments = [IoSliceMut::new(tail), IoSliceMut::new(&mut stage)];
            io.read_vectored(&mut segments)?
        };
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&stage[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable span to `io` and consumes what was written.
    ///
    /// Returns the number of bytes written. A would-block condition
    /// surfaces as `Err` with [`io::ErrorKind::WouldBlock`].
    pub fn write_to<W: Write>(&mut self, io: &mut W) -> io::Result<usize> {
        let n = io.write(self.peek())?;
        self.read_pos += n;
        Ok(n)
    }

    /// Writes the readable span to `io` as the first of two gathered
    /// segments, `extra` being the second. Consumes only the readable-span
    /// portion of what was written and reports the total.
    pub fn write_gathered<W: Write>(&mut self, io: &mut W, extra: &[u8]) -> io::Result<usize> {
        let segments = [IoSlice::new(self.peek()), IoSlice::new(extra)];
        let n = io.write_vectored(&segments)?;
        let consumed = n.min(self.readable_bytes());
        self.read_pos += consumed;
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .field("capacity", &self.data.len())
            .finish()
    }
}
