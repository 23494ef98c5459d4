//! Byte accumulator that supports efficient prefix pops across chunk
//! boundaries (C1). Grounded on `sageserver/util.py`'s `JoinBuffer`: a
//! deque of chunks, `extend` never copies, and `pop_left` only copies the
//! single chunk straddling the requested boundary.

use std::collections::VecDeque;

use bytes::Bytes;

/// Accumulates byte chunks and supports popping an exact-length prefix.
#[derive(Debug, Default)]
pub struct JoinBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl JoinBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a chunk without copying it.
    pub fn extend(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Pops the first `n` bytes off and returns them as a contiguous
    /// buffer. Returns `None` if fewer than `n` bytes are buffered.
    /// Only the chunk straddling the `n`-byte boundary is copied; whole
    /// chunks entirely within the prefix (or entirely after it) are moved,
    /// not copied.
    pub fn pop_left(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 {
            return Some(Bytes::new());
        }
        if self.len < n {
            return None;
        }
        // Fast path: the whole buffer is consumed and is a single chunk.
        if self.len == n && self.chunks.len() == 1 {
            self.len = 0;
            return self.chunks.pop_front();
        }

        let mut remaining = n;
        let mut out = Vec::with_capacity(n);
        while remaining > 0 {
            let front = self.chunks.front_mut().expect("len tracked remaining bytes");
            if front.len() <= remaining {
                let taken = self.chunks.pop_front().unwrap();
                remaining -= taken.len();
                out.extend_from_slice(&taken);
            } else {
                let head = front.split_to(remaining);
                out.extend_from_slice(&head);
                remaining = 0;
            }
        }
        self.len -= n;
        Some(Bytes::from(out))
    }

    /// Pops everything currently buffered.
    pub fn pop_all(&mut self) -> Bytes {
        self.pop_left(self.len).unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}
