//! Page-file adapter
//!
//! [`PageFile`] turns any byte device into fixed-size block storage:
//! block `i` occupies byte range `[i * page_size, (i + 1) * page_size)`.
//! This is how file- and memory-backed page devices are built.

use std::sync::Arc;

use crate::device::{LogStorage, PageStorage};
use crate::error::{OxipageError, Result};
use crate::utility::is_power_of_two;

/// Minimum supported page size in bytes.
pub const MIN_PAGE_SIZE: usize = 512;

/// Fixed-size block storage layered over a [`LogStorage`] byte device.
pub struct PageFile<D: LogStorage> {
    device: Arc<D>,
    page_size: usize,
    page_count: u64,
}

impl<D: LogStorage> PageFile<D> {
    /// Create a page file of `page_count` pages of `page_size` bytes,
    /// sizing the underlying device to hold them all.
    pub fn create(device: Arc<D>, page_size: usize, page_count: u64) -> Result<Self> {
        if !is_power_of_two(page_size as u64) || page_size < MIN_PAGE_SIZE {
            return Err(OxipageError::InvalidArgument(
                "page_size must be a power of two >= 512",
            ));
        }
        device.set_len(page_size as u64 * page_count)?;
        Ok(Self {
            device,
            page_size,
            page_count,
        })
    }

    /// Open an existing page file without resizing the device.
    pub fn open(device: Arc<D>, page_size: usize, page_count: u64) -> Result<Self> {
        if !is_power_of_two(page_size as u64) || page_size < MIN_PAGE_SIZE {
            return Err(OxipageError::InvalidArgument(
                "page_size must be a power of two >= 512",
            ));
        }
        let need = page_size as u64 * page_count;
        if device.size()? < need {
            return Err(OxipageError::Corruption("page file shorter than geometry"));
        }
        Ok(Self {
            device,
            page_size,
            page_count,
        })
    }

    #[inline]
    fn offset_of(&self, index: u32) -> Result<u64> {
        if (index as u64) >= self.page_count {
            return Err(OxipageError::InvalidArgument("page index out of range"));
        }
        Ok(index as u64 * self.page_size as u64)
    }
}

impl<D: LogStorage> PageStorage for PageFile<D> {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.page_count
    }

    fn read_block(&self, index: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let offset = self.offset_of(index)?;
        self.device.read_at(offset, buf)
    }

    fn write_block(&self, index: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.page_size);
        let offset = self.offset_of(index)?;
        self.device.write_at(offset, data)
    }

    fn discard_block(&self, index: u32) -> Result<()> {
        // Zeroing the header region is enough to make the old content
        // unreadable through the page layer.
        let offset = self.offset_of(index)?;
        self.device.write_at(offset, &[0u8; 64])
    }

    fn flush(&self) -> Result<()> {
        self.device.flush()
    }
}
