use bytes::Bytes;
use std::collections::VecDeque;

/// Default history capacity per session: 1 MiB.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024 * 1024;

/// Bounded byte history with drop-oldest eviction.
///
/// Holds the most recent `capacity` bytes a session has emitted so a
/// reconnecting viewer can be brought up to date.
#[derive(Debug)]
pub struct History {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Append `data`, evicting the oldest bytes beyond capacity.
    pub fn push(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        if data.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    /// Copy of the current contents, oldest byte first.
    pub fn snapshot(&self) -> Bytes {
        let (a, b) = self.buf.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        Bytes::from(out)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Stored size in KiB, as reported in listings.
    pub fn size_kb(&self) -> f64 {
        self.buf.len() as f64 / 1024.0
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
