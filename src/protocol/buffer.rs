//! Growable byte buffer with a `[pos, end)` window.
//!
//! Shared by the read and write paths of [`PacketIo`](super::packet::PacketIo) and by the
//! prepared statement execute payload. Capacity grows in [`BUFFER_ALIGN`] steps and never
//! shrinks. Invariant: `pos <= end <= capacity`.

use bytes::BytesMut;

use crate::error::{Error, ErrorCode, Result};

pub const BUFFER_ALIGN: usize = 0x1000;

pub fn align_capacity(size: usize) -> usize {
    size.div_ceil(BUFFER_ALIGN).max(1) * BUFFER_ALIGN
}

#[derive(Debug, Clone)]
pub struct PacketBuffer {
    data: BytesMut,
    pos: usize,
    end: usize,
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::with_capacity(BUFFER_ALIGN)
    }
}

impl PacketBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::zeroed(align_capacity(capacity)),
            pos: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Bytes between `pos` and `end`.
    pub fn len(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.end
    }

    /// Free bytes after `end`.
    pub fn free(&self) -> usize {
        self.capacity() - self.end
    }

    /// Grows the buffer so it can hold `needed` bytes in total. Returns whether it grew.
    pub fn ensure_capacity(&mut self, needed: usize) -> bool {
        if needed <= self.capacity() {
            return false;
        }
        self.data.resize(align_capacity(needed), 0);
        true
    }

    /// Moves the pending bytes to the front of the buffer.
    pub fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        self.data.copy_within(self.pos..self.end, 0);
        self.end -= self.pos;
        self.pos = 0;
    }

    pub fn clear(&mut self) {
        self.pos = 0;
        self.end = 0;
    }

    pub fn pending(&self) -> &[u8] {
        &self.data[self.pos..self.end]
    }

    /// `len` bytes starting `start` bytes after `pos`.
    pub fn window(&self, start: usize, len: usize) -> &[u8] {
        let from = self.pos + start;
        &self.data[from..from + len]
    }

    /// Writable region after `end`; follow up with [`PacketBuffer::advance_end`].
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    #[track_caller]
    pub fn advance_end(&mut self, n: usize) -> Result<()> {
        if self.end + n > self.capacity() {
            return Err(out_of_window("advance", n, self.capacity() - self.end));
        }
        self.end += n;
        Ok(())
    }

    /// Marks `n` pending bytes as consumed.
    #[track_caller]
    pub fn consume(&mut self, n: usize) -> Result<()> {
        if n > self.len() {
            return Err(out_of_window("consume", n, self.len()));
        }
        self.pos += n;
        if self.pos == self.end {
            self.clear();
        }
        Ok(())
    }

    /// Removes `len` bytes located `start` bytes after `pos`, shifting the tail left.
    #[track_caller]
    pub fn remove(&mut self, start: usize, len: usize) -> Result<()> {
        let from = self.pos + start;
        if from + len > self.end {
            return Err(out_of_window("remove", start + len, self.len()));
        }
        self.data.copy_within(from + len..self.end, from);
        self.end -= len;
        Ok(())
    }

    /// Appends `bytes`, growing the buffer when needed.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.ensure_capacity(self.end + bytes.len());
        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
    }

    /// Appends as much of `bytes` as fits without growing, returning the count copied.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        self.data[self.end..self.end + n].copy_from_slice(&bytes[..n]);
        self.end += n;
        n
    }

    /// The whole backing storage, including bytes past `end`.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

#[track_caller]
fn out_of_window(op: &str, requested: usize, available: usize) -> Error {
    Error::with_message(
        ErrorCode::InvalidBufferSize,
        format!("Cannot {op} {requested} bytes, {available} available"),
    )
}
