//! Client data buffers and windows onto them
//!
//! A [`TransferBuffer`] is the client's data region for one request. Every
//! chunk of a transfer addresses it through an [`Mdl`], a bounded window at
//! a byte offset. Windows never outlive their buffer and never reach past
//! its end.

use crate::error::{Error, Result};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared client data region
#[derive(Clone, Default)]
pub struct TransferBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl TransferBuffer {
    /// Zero-filled buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Window covering the whole buffer
    pub fn whole(&self) -> Mdl {
        Mdl {
            len: self.len(),
            buffer: self.clone(),
            offset: 0,
        }
    }

    /// Moves bytes inside the buffer; ranges may overlap
    pub fn copy_within(&self, src: Range<usize>, dest: usize) -> Result<()> {
        let mut data = self.lock();
        if src.start > src.end || src.end > data.len() || dest + src.len() > data.len() {
            return Err(Error::InvalidParameter(format!(
                "move {:?} -> {} outside {} byte buffer",
                src,
                dest,
                data.len()
            )));
        }
        data.copy_within(src, dest);
        Ok(())
    }

    pub fn ptr_eq(&self, other: &TransferBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl std::fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("len", &self.len())
            .finish()
    }
}

/// Bounded window onto a [`TransferBuffer`]
#[derive(Clone, Default)]
pub struct Mdl {
    buffer: TransferBuffer,
    offset: usize,
    len: usize,
}

impl Mdl {
    /// Zero-length window
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this window from the start of its buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn buffer(&self) -> &TransferBuffer {
        &self.buffer
    }

    /// Sub-window at `offset` bytes into this window
    pub fn partial(&self, offset: usize, len: usize) -> Result<Mdl> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::InvalidParameter("window length overflow".into()))?;
        if end > self.len {
            return Err(Error::InvalidParameter(format!(
                "window {}..{} outside {} byte region",
                offset, end, self.len
            )));
        }
        Ok(Mdl {
            buffer: self.buffer.clone(),
            offset: self.offset + offset,
            len,
        })
    }

    /// Copies the window contents out
    pub fn read(&self) -> Vec<u8> {
        let data = self.buffer.lock();
        data[self.offset..self.offset + self.len].to_vec()
    }

    /// Writes `bytes` at `at` within the window, truncating at its end.
    /// Returns the number of bytes written.
    pub fn write(&self, at: usize, bytes: &[u8]) -> usize {
        if at >= self.len {
            return 0;
        }
        let count = bytes.len().min(self.len - at);
        let start = self.offset + at;
        let mut data = self.buffer.lock();
        data[start..start + count].copy_from_slice(&bytes[..count]);
        count
    }
}

impl std::fmt::Debug for Mdl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mdl")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_windows() {
        let buffer = TransferBuffer::new(100);
        let whole = buffer.whole();
        let chunk = whole.partial(40, 30).unwrap();
        assert_eq!(chunk.offset(), 40);

        let inner = chunk.partial(10, 20).unwrap();
        assert_eq!(inner.offset(), 50);
        assert!(chunk.partial(10, 21).is_err());
    }

    #[test]
    fn test_write_truncates_at_window_end() {
        let buffer = TransferBuffer::new(8);
        let window = buffer.whole().partial(2, 4).unwrap();
        assert_eq!(window.write(1, &[9, 9, 9, 9, 9]), 3);
        assert_eq!(buffer.to_vec(), vec![0, 0, 0, 9, 9, 9, 0, 0]);
        assert_eq!(window.write(4, &[1]), 0);
    }

    #[test]
    fn test_copy_within_overlapping() {
        let buffer = TransferBuffer::from_vec((0u8..10).collect());
        buffer.copy_within(4..10, 2).unwrap();
        assert_eq!(buffer.to_vec(), vec![0, 1, 4, 5, 6, 7, 8, 9, 8, 9]);
        assert!(buffer.copy_within(5..12, 0).is_err());
    }
}
