//! In-memory storage backend
//!
//! Backs logs and page files with a plain byte vector. Used by unit
//! tests and by callers that want volatile scratch volumes; `flush` is
//! a no-op.

use parking_lot::RwLock;

use crate::device::LogStorage;
use crate::error::{OxipageError, Result};

/// A volatile byte-vector device.
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
}

impl MemoryDevice {
    /// Create an empty device.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
        }
    }

    /// Create a device pre-sized to `size` zero bytes.
    pub fn with_size(size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size as usize]),
        }
    }

    /// Snapshot the full contents. Test helper.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemoryDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(OxipageError::InvalidArgument("read range overflows"))?;
        if end > data.len() {
            return Err(OxipageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of memory device",
            )));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.data.write();
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .ok_or(OxipageError::InvalidArgument("write range overflows"))?;
        if end > inner.len() {
            inner.resize(end, 0);
        }
        inner[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, size: u64) -> Result<()> {
        self.data.write().resize(size as usize, 0);
        Ok(())
    }
}
