//! Growable I/O buffer with a cheap prepend area.
//!
//! Layout, indices into one contiguous allocation:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index  <=  writer_index  <=  len
//! ```
//!
//! The front reserve lets a protocol layer compute a payload first and stamp
//! a length header in front of it without copying the payload.

use std::io;
use std::os::fd::RawFd;

/// Bytes reserved in front of the readable region.
pub const CHEAP_PREPEND: usize = 8;
/// Default capacity of the readable + writable region.
pub const INITIAL_SIZE: usize = 1024;

const CRLF: &[u8] = b"\r\n";

pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Offset of the first `\r\n` in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Offset of the first `\r\n` at or after `start` (an offset into the
    /// readable region).
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .windows(CRLF.len())
            .position(|w| w == CRLF)
            .map(|pos| start + pos)
    }

    /// Offset of the first `\n` in the readable region.
    pub fn find_eol(&self) -> Option<usize> {
        self.find_eol_from(0)
    }

    /// Offset of the first `\n` at or after `start`.
    pub fn find_eol_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| start + pos)
    }

    /// Discard `len` readable bytes from the front.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Discard readable bytes up to offset `end` (exclusive).
    pub fn retrieve_until(&mut self, end: usize) {
        assert!(end <= self.readable_bytes());
        self.retrieve(end);
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_i8(&mut self) {
        self.retrieve(1);
    }

    pub fn retrieve_i16(&mut self) {
        self.retrieve(2);
    }

    pub fn retrieve_i32(&mut self) {
        self.retrieve(4);
    }

    pub fn retrieve_i64(&mut self) {
        self.retrieve(8);
    }

    /// Copy out and discard `len` readable bytes.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    /// Copy out and discard the whole readable region.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Make room for at least `len` more bytes after `writer_index`.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    /// Advance the write index over bytes the caller filled in directly.
    #[inline]
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer_index += len;
    }

    /// Give back the last `len` written bytes.
    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer_index -= len;
    }

    /// Insert `data` immediately in front of the readable region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    pub fn append_i8(&mut self, x: i8) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i16(&mut self, x: i16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i32(&mut self, x: i32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i64(&mut self, x: i64) {
        self.append(&x.to_be_bytes());
    }

    /// Read a network-order i8 without consuming it.
    ///
    /// Panics if fewer than 1 byte is readable; callers check
    /// `readable_bytes()` first.
    pub fn peek_i8(&self) -> i8 {
        assert!(self.readable_bytes() >= 1);
        self.peek()[0] as i8
    }

    pub fn peek_i16(&self) -> i16 {
        assert!(self.readable_bytes() >= 2);
        i16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_i32(&self) -> i32 {
        assert!(self.readable_bytes() >= 4);
        i32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_i64(&self) -> i64 {
        assert!(self.readable_bytes() >= 8);
        i64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    pub fn read_i8(&mut self) -> i8 {
        let x = self.peek_i8();
        self.retrieve_i8();
        x
    }

    pub fn read_i16(&mut self) -> i16 {
        let x = self.peek_i16();
        self.retrieve_i16();
        x
    }

    pub fn read_i32(&mut self) -> i32 {
        let x = self.peek_i32();
        self.retrieve_i32();
        x
    }

    pub fn read_i64(&mut self) -> i64 {
        let x = self.peek_i64();
        self.retrieve_i64();
        x
    }

    pub fn prepend_i8(&mut self, x: i8) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i16(&mut self, x: i16) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i32(&mut self, x: i32) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i64(&mut self, x: i64) {
        self.prepend(&x.to_be_bytes());
    }

    /// Shrink the allocation to the readable content plus `reserve`.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut buf = vec![0; CHEAP_PREPEND + readable + reserve];
        buf[CHEAP_PREPEND..CHEAP_PREPEND + readable].copy_from_slice(self.peek());
        self.buf = buf;
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND + readable;
    }

    pub fn internal_capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Read from `fd` directly into the buffer with one `readv(2)`.
    ///
    /// The second iovec is a 64 KiB stack scratch area, so a single wakeup can
    /// pull in far more than the buffer's spare capacity without reserving
    /// that much per idle connection. A used scratch tail is appended
    /// afterwards, costing at most one growth.
    ///
    /// Returns `(n, saved_errno)` where `n` is the `readv` result.
    pub fn read_fd(&mut self, fd: RawFd) -> (isize, i32) {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut vec = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer_index) } as *mut _,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut _,
                iov_len: extrabuf.len(),
            },
        ];

        // Skip the scratch area when the spare region alone is large enough.
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, vec.as_mut_ptr(), iovcnt) };
        if n < 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return (-1, errno);
        }

        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        (n as isize, 0)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            // Not enough slack even after compaction; grow the allocation.
            // Offsets stay valid, raw pointers into the buffer do not.
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Reclaim the already-read front by sliding readable data down to
            // the reserve.
            assert!(CHEAP_PREPEND < self.reader_index);
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
            assert_eq!(readable, self.readable_bytes());
        }
    }
}
