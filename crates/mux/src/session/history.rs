//! Bounded scrollback of a session's most recent output.

use std::collections::VecDeque;

/// Ring buffer keeping the last `capacity` bytes of `OUTPUT` traffic.
#[derive(Debug, Clone)]
pub struct OutputHistory {
    buf: VecDeque<u8>,
    capacity: usize,
    total_bytes_written: u64,
}

impl OutputHistory {
    /// Creates an empty history. A capacity of 0 keeps nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            total_bytes_written: 0,
        }
    }

    /// Appends `data`, evicting the oldest bytes past capacity.
    ///
    /// Returns true if anything was evicted.
    pub fn push(&mut self, data: &[u8]) -> bool {
        self.total_bytes_written += data.len() as u64;
        if self.capacity == 0 || data.is_empty() {
            return false;
        }

        if data.len() >= self.capacity {
            let evicted = !self.buf.is_empty() || data.len() > self.capacity;
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return evicted;
        }

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(data);
        overflow > 0
    }

    /// Copies out the retained bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (head, tail) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        out
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes pushed over the lifetime of the buffer, including evicted ones.
    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
