//! A growable byte buffer with separate read and write cursors.
//!
//! The readable region is `[head, tail)` and the writable region is
//! `[tail, cap)`. Capacity grows by doubling, clamped to `max_cap`.

use std::fmt;

use memchr::memmem;

pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    init_cap: usize,
    max_cap: usize,
}

impl Buffer {
    /// Creates an empty buffer. Storage is allocated on first `reserve`.
    pub fn new(init_cap: usize, max_cap: usize) -> Buffer {
        debug_assert!(init_cap <= max_cap);
        Buffer {
            data: Vec::new(),
            head: 0,
            tail: 0,
            init_cap,
            max_cap,
        }
    }

    /// Length of the readable region.
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Current writable space.
    pub fn space(&self) -> usize {
        self.data.len() - self.tail
    }

    pub fn max_cap(&self) -> usize {
        self.max_cap
    }

    /// Ensures at least `min_space` writable bytes, growing up to
    /// `max_cap`. Returns false if the request cannot be satisfied.
    pub fn reserve(&mut self, min_space: usize) -> bool {
        if self.space() >= min_space {
            return true;
        }

        // Reclaim consumed head space before growing.
        self.compact();
        if self.space() >= min_space {
            return true;
        }

        let needed = self.tail + min_space;
        if needed > self.max_cap {
            return false;
        }

        let mut cap = self.data.len().max(self.init_cap).max(1);
        while cap < needed {
            cap *= 2;
        }
        cap = cap.min(self.max_cap);

        self.data.resize(cap, 0);
        true
    }

    /// Shifts the readable region to the front, reclaiming head space.
    pub fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }

    /// The readable region.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// The writable region.
    pub fn writable(&mut self) -> &mut [u8] {
        let tail = self.tail;
        let cap = self.data.len();
        &mut self.data[tail..cap]
    }

    /// Marks `n` bytes of the writable region as produced.
    pub fn wrote(&mut self, n: usize) {
        debug_assert!(n <= self.space());
        self.tail += n;
    }

    /// Consumes `n` readable bytes. Collapses the cursors to zero when the
    /// buffer empties.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.head += n;
        if self.head == self.tail {
            self.reset();
        }
    }

    /// Collapses both cursors to zero. Only legal when the readable region
    /// is empty.
    pub fn reset(&mut self) {
        debug_assert!(self.head == self.tail);
        self.head = 0;
        self.tail = 0;
    }

    /// Drops all readable bytes and resets the cursors.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Appends bytes, growing as needed. Returns false when `max_cap`
    /// would be exceeded.
    pub fn extend_from_slice(&mut self, src: &[u8]) -> bool {
        if !self.reserve(src.len()) {
            return false;
        }
        self.writable()[..src.len()].copy_from_slice(src);
        self.wrote(src.len());
        true
    }

    /// First occurrence of `needle` in the readable region, relative to
    /// the read cursor.
    pub fn memmem(&self, needle: &[u8]) -> Option<usize> {
        memmem::find(self.readable(), needle)
    }

    /// Consumes `needle` from the front of the readable region if present.
    pub fn consume_prefix(&mut self, needle: &[u8]) -> bool {
        if self.readable().starts_with(needle) {
            self.consume(needle.len());
            true
        } else {
            false
        }
    }

    /// Next token delimited by any byte in `delims`.
    ///
    /// Returns the bytes up to (not including) the first delimiter, or up
    /// to the end of the readable region if none is present. When
    /// `preserve_end` is set the read cursor is left on the delimiter;
    /// otherwise it advances one byte past it.
    pub fn token_next(&mut self, delims: &[u8], preserve_end: bool) -> &[u8] {
        let readable = self.head..self.tail;
        let end = self.data[readable.clone()]
            .iter()
            .position(|b| delims.contains(b))
            .map(|i| self.head + i)
            .unwrap_or(self.tail);

        let start = self.head;
        self.head = if preserve_end || end == self.tail {
            end
        } else {
            end + 1
        };
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
            return &self.data[start..end];
        }
        &self.data[start..end]
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("cap", &self.data.len())
            .field("max_cap", &self.max_cap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_stay_ordered() {
        let mut buf = Buffer::new(8, 64);
        assert!(buf.reserve(8));

        for round in 0u8..16 {
            let chunk = [round; 5];
            assert!(buf.extend_from_slice(&chunk));
            assert_eq!(buf.readable(), &chunk);
            assert!(buf.len() <= buf.max_cap());
            buf.consume(5);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn roundtrip_preserves_bytes() {
        let mut buf = Buffer::new(4, 1024);
        let written: Vec<u8> = (0..200u8).collect();
        assert!(buf.extend_from_slice(&written));

        let mut read = Vec::new();
        while !buf.is_empty() {
            let n = buf.len().min(7);
            read.extend_from_slice(&buf.readable()[..n]);
            buf.consume(n);
        }
        assert_eq!(read, written);
    }

    #[test]
    fn reserve_fails_past_max_cap() {
        let mut buf = Buffer::new(8, 16);
        assert!(buf.reserve(16));
        buf.wrote(16);
        assert!(!buf.reserve(1));
        buf.consume(8);
        // Compaction frees the consumed head space.
        assert!(buf.reserve(8));
    }

    #[test]
    fn growth_doubles_and_clamps() {
        let mut buf = Buffer::new(8, 100);
        assert!(buf.reserve(1));
        assert_eq!(buf.space(), 8);
        buf.wrote(8);
        assert!(buf.reserve(5));
        assert!(buf.space() >= 5);
        assert!(buf.reserve(92));
        assert_eq!(buf.space(), 92);
    }

    #[test]
    fn memmem_finds_needle() {
        let mut buf = Buffer::new(8, 64);
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(buf.memmem(b"\r\n"), Some(14));
        assert_eq!(buf.memmem(b"\r\n\r\n"), Some(14));
        assert_eq!(buf.memmem(b"POST"), None);
    }

    #[test]
    fn token_next_consumes_delimiter() {
        let mut buf = Buffer::new(8, 64);
        buf.extend_from_slice(b"GET /index.html HTTP/1.1\r\nrest");

        assert_eq!(buf.token_next(b" ", false), b"GET");
        assert_eq!(buf.token_next(b" \r\n", true), b"/index.html");
        assert!(buf.consume_prefix(b" "));
        assert_eq!(buf.token_next(b"\r\n", true), b"HTTP/1.1");
        assert!(buf.consume_prefix(b"\r\n"));
        assert_eq!(buf.readable(), b"rest");
    }

    #[test]
    fn token_next_without_delimiter_drains() {
        let mut buf = Buffer::new(8, 64);
        buf.extend_from_slice(b"abc");
        assert_eq!(buf.token_next(b" ", false), b"abc");
        assert!(buf.is_empty());
    }
}
