//! Fixed-size page store
//!
//! A [`PageDevice`] is an array of `page_count` pages of `page_size`
//! bytes, read and written by [`PageId`]. The generation baked into
//! each id makes page contents immutable: a read whose generation does
//! not match what is on the device fails with `NotFound`, and writers
//! are arbitrated by the allocator's generation bumping.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::PageStorage;
use crate::error::{OxipageError, Result};
use crate::page::layout::{decode_page, encode_page, payload_capacity};
use crate::page_id::PageId;

/// A generation-addressed page store over block storage.
///
/// Backends are selected at runtime behind [`PageStorage`]; see
/// [`crate::device::PageFile`] for the file/memory variants.
pub struct PageDevice {
    storage: Arc<dyn PageStorage>,
    device_index: u8,
    /// Last written generation per physical index, discovered lazily
    /// from the on-device header on first touch.
    written: Mutex<HashMap<u32, u32>>,
}

impl PageDevice {
    /// Wrap block storage as page device `device_index`.
    pub fn new(device_index: u8, storage: Arc<dyn PageStorage>) -> Self {
        Self {
            storage,
            device_index,
            written: Mutex::new(HashMap::new()),
        }
    }

    /// This device's index, the high byte of its page ids.
    #[inline]
    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    /// Size of one page in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.storage.page_size()
    }

    /// Number of physical pages.
    #[inline]
    pub fn page_count(&self) -> u64 {
        self.storage.page_count()
    }

    /// Maximum payload one page can hold.
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        payload_capacity(self.storage.page_size())
    }

    fn check_id(&self, page_id: PageId) -> Result<()> {
        if page_id.device() != self.device_index {
            return Err(OxipageError::InvalidPageId("wrong device index"));
        }
        if !page_id.is_valid() {
            return Err(OxipageError::InvalidPageId("generation zero"));
        }
        if (page_id.index() as u64) >= self.storage.page_count() {
            return Err(OxipageError::InvalidPageId("index out of range"));
        }
        Ok(())
    }

    /// Read the payload of `page_id`.
    ///
    /// `NotFound` when the stored generation differs from the id's:
    /// the page was rewritten, dropped, or never written.
    pub fn read(&self, page_id: PageId) -> Result<Vec<u8>> {
        self.check_id(page_id)?;
        let mut image = vec![0u8; self.storage.page_size()];
        self.storage.read_block(page_id.index(), &mut image)?;
        decode_page(page_id, &image)
    }

    /// Write `payload` as the content of `page_id`.
    ///
    /// The allocator hands out a fresh generation per writer, so every
    /// write to a physical index must carry a generation above the last
    /// one written there; anything else is a caller bug and is rejected
    /// as `InvalidPageId` before it can clobber immutable content.
    pub fn write(&self, page_id: PageId, payload: &[u8]) -> Result<()> {
        self.check_id(page_id)?;
        let mut written = self.written.lock();
        let last = match written.get(&page_id.index()) {
            Some(generation) => *generation,
            None => self.stored_generation(page_id.index())?,
        };
        if page_id.generation() <= last {
            return Err(OxipageError::InvalidPageId(
                "generation not newer than last write",
            ));
        }
        let image = encode_page(page_id, payload, self.storage.page_size())?;
        self.storage.write_block(page_id.index(), &image)?;
        written.insert(page_id.index(), page_id.generation());
        Ok(())
    }

    /// Generation recorded in the on-device header at `index`, or 0
    /// when the block holds no page of this device.
    fn stored_generation(&self, index: u32) -> Result<u32> {
        let mut image = vec![0u8; self.storage.page_size()];
        self.storage.read_block(index, &mut image)?;
        let stored = PageId::from_u64(u64::from_le_bytes(image[0..8].try_into().unwrap()));
        if stored.device() == self.device_index && stored.index() == index {
            Ok(stored.generation())
        } else {
            Ok(0)
        }
    }

    /// Discard the physical page behind `page_id`. Subsequent reads of
    /// any generation at this index return `NotFound` until the index
    /// is reallocated and rewritten.
    pub fn drop_page(&self, page_id: PageId) -> Result<()> {
        self.check_id(page_id)?;
        tracing::debug!(page = %page_id, "dropping physical page");
        self.storage.discard_block(page_id.index())
    }

    /// Durability barrier over all written pages.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }
}
