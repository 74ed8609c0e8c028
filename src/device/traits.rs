//! Storage capability traits
//!
//! Log-shaped components speak [`LogStorage`]: byte-granular reads and
//! writes with a durability barrier. Page-shaped components speak
//! [`PageStorage`]: fixed-size blocks addressed by physical index.
//! Backends implement one or both; [`crate::device::PageFile`] layers
//! pages over any byte device.

use crate::error::Result;

/// Byte-granular durable storage, the capability set a log backend needs.
///
/// Implementations must tolerate concurrent calls; completion of
/// `flush` guarantees every prior `write_at` is stable.
pub trait LogStorage: Send + Sync + 'static {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` starting at `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Durability barrier over all previously written bytes.
    fn flush(&self) -> Result<()>;

    /// Current size of the backing object in bytes.
    fn size(&self) -> Result<u64>;

    /// Resize the backing object, zero-filling any extension.
    fn set_len(&self, size: u64) -> Result<()>;
}

/// Fixed-size block storage, the capability set a page backend needs.
pub trait PageStorage: Send + Sync + 'static {
    /// Size of one page in bytes (a power of two, at least 512).
    fn page_size(&self) -> usize;

    /// Number of pages on the device.
    fn page_count(&self) -> u64;

    /// Read the full page at `index` into `buf` (`buf.len() == page_size`).
    fn read_block(&self, index: u32, buf: &mut [u8]) -> Result<()>;

    /// Write the full page at `index` (`data.len() == page_size`).
    fn write_block(&self, index: u32, data: &[u8]) -> Result<()>;

    /// Discard the page at `index`; subsequent reads of the old content
    /// are not required to succeed.
    fn discard_block(&self, index: u32) -> Result<()>;

    /// Durability barrier over all previously written pages.
    fn flush(&self) -> Result<()>;
}
