//! Circular byte buffer for output replay when a viewer attaches.
//!
//! Stores the last N bytes of PTY output so a freshly opened terminal view
//! can be hydrated without keeping unbounded history.

use bytes::Bytes;

/// Default replay capacity per session (8 MiB).
pub const DEFAULT_RING_CAPACITY: usize = 8 * 1024 * 1024;

/// A fixed-capacity circular byte buffer with oldest-first eviction.
#[derive(Debug)]
pub struct ByteRing {
    /// Backing storage; grows lazily up to `capacity`, then wraps.
    buf: Vec<u8>,
    capacity: usize,
    /// Write position once the buffer has wrapped.
    write_pos: usize,
}

impl ByteRing {
    /// Create a new ring with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
            write_pos: 0,
        }
    }

    /// Append bytes, evicting exactly the overflow from the front.
    pub fn append(&mut self, data: &[u8]) {
        if self.capacity == 0 || data.is_empty() {
            return;
        }
        // Only the tail that fits can survive.
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        // Still filling up: plain extend until capacity is reached.
        let room = self.capacity - self.buf.len();
        let (fill, rest) = data.split_at(data.len().min(room));
        self.buf.extend_from_slice(fill);
        if rest.is_empty() {
            if self.buf.len() == self.capacity {
                self.write_pos = 0;
            }
            return;
        }

        // Full: overwrite starting at write_pos, wrapping at most once.
        let first = rest.len().min(self.capacity - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&rest[..first]);
        let second = rest.len() - first;
        self.buf[..second].copy_from_slice(&rest[first..]);
        self.write_pos = (self.write_pos + rest.len()) % self.capacity;
    }

    /// Current contents in chronological order. Does not clear the ring.
    pub fn snapshot(&self) -> Bytes {
        if self.buf.len() < self.capacity || self.write_pos == 0 {
            return Bytes::copy_from_slice(&self.buf);
        }
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(&self.buf[self.write_pos..]);
        out.extend_from_slice(&self.buf[..self.write_pos]);
        Bytes::from(out)
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.write_pos = 0;
    }
}

impl Default for ByteRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}
