//! Reusable Byte Buffer
//!
//! The engine assembles records, mirrors the open chunk, and caches the
//! decompressed chunk in long-lived scratch buffers so that steady-state
//! writes and reads allocate nothing. `Buffer` keeps capacity across
//! `set_size(0)` and grows by doubling, so repeated fill/clear cycles settle
//! on the high-water mark.
//!
//! `Buffer` is deliberately not `Clone`: each buffer has one owner and moves
//! transfer it.

/// Growable byte region with separate size and capacity. Never shrinks.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    size: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Set the logical size, growing capacity by doubling if needed.
    pub fn set_size(&mut self, size: usize) {
        self.ensure_capacity(size);
        self.size = size;
    }

    pub fn clear(&mut self) {
        self.size = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.size]
    }

    /// Append bytes at the end, growing as needed.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let start = self.size;
        self.set_size(start + bytes.len());
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Replace the contents with a copy of `bytes`.
    pub fn copy_from_slice(&mut self, bytes: &[u8]) {
        self.set_size(bytes.len());
        self.data[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }

    fn ensure_capacity(&mut self, capacity: usize) {
        if capacity <= self.data.len() {
            return;
        }
        let new_capacity = std::cmp::max(self.data.len() * 2, capacity);
        self.data.resize(new_capacity, 0);
    }
}
