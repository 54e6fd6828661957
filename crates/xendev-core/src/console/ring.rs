//! Byte rings between a console channel and its terminal.

use std::collections::VecDeque;

use bytes::Bytes;

/// FIFO byte buffer, optionally bounded.
///
/// A bounded ring keeps the most recent bytes: pushing past the limit drops
/// from the front.
#[derive(Debug, Default)]
pub struct ByteRing {
    buf: VecDeque<u8>,
    limit: Option<usize>,
}

impl ByteRing {
    /// Creates an unbounded ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ring holding at most `limit` bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(limit.min(4096)),
            limit: Some(limit),
        }
    }

    /// Appends `data`, returning how many old bytes were discarded.
    pub fn push(&mut self, data: &[u8]) -> usize {
        self.buf.extend(data);
        let Some(limit) = self.limit else {
            return 0;
        };
        let excess = self.buf.len().saturating_sub(limit);
        if excess > 0 {
            self.buf.drain(..excess);
        }
        excess
    }

    /// Copies up to `max` bytes from the front without consuming them.
    #[must_use]
    pub fn peek(&self, max: usize) -> Bytes {
        let n = max.min(self.buf.len());
        let (head, tail) = self.buf.as_slices();
        if n <= head.len() {
            return Bytes::copy_from_slice(&head[..n]);
        }
        let mut chunk = Vec::with_capacity(n);
        chunk.extend_from_slice(head);
        chunk.extend_from_slice(&tail[..n - head.len()]);
        Bytes::from(chunk)
    }

    /// Discards up to `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Buffered byte count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discards everything.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
