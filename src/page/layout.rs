//! On-device page layout
//!
//! Every written page carries a self-describing image:
//!
//! ```text
//! +-----------+--------------+-----------+------------+--------------+
//! | page_id   | payload_len  | crc32     |  payload   | trailer_crc32|
//! | 8 bytes   | 4 bytes      | 4 bytes   |  variable  | 4 bytes      |
//! +-----------+--------------+-----------+------------+--------------+
//! ```
//!
//! The payload crc covers the payload bytes; the trailer crc covers the
//! 16-byte header, binding the stored id and length. The rest of the
//! page is zero. A zeroed header reads as "no page here".

use crate::error::{OxipageError, Result};
use crate::page_id::PageId;

/// Size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of the page trailer in bytes.
pub const PAGE_TRAILER_SIZE: usize = 4;

/// Total per-page overhead, including alignment reserve.
pub const PAGE_OVERHEAD: usize = 24;

/// Maximum payload a page of `page_size` bytes can hold.
#[inline]
pub const fn payload_capacity(page_size: usize) -> usize {
    page_size - PAGE_OVERHEAD
}

/// Build the full page image for `payload` under `page_id`.
pub fn encode_page(page_id: PageId, payload: &[u8], page_size: usize) -> Result<Vec<u8>> {
    if payload.len() > payload_capacity(page_size) {
        return Err(OxipageError::InvalidArgument(
            "payload exceeds page capacity",
        ));
    }
    let mut image = vec![0u8; page_size];
    image[0..8].copy_from_slice(&page_id.to_u64().to_le_bytes());
    image[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    image[12..16].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
    image[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    let trailer = crc32fast::hash(&image[0..PAGE_HEADER_SIZE]);
    let trailer_at = PAGE_HEADER_SIZE + payload.len();
    image[trailer_at..trailer_at + PAGE_TRAILER_SIZE].copy_from_slice(&trailer.to_le_bytes());
    Ok(image)
}

/// Extract the payload of `page_id` from a raw page image.
///
/// A generation or id mismatch (including a zeroed header) is
/// [`OxipageError::NotFound`]; checksum failures are corruption.
pub fn decode_page(page_id: PageId, image: &[u8]) -> Result<Vec<u8>> {
    if image.len() < PAGE_OVERHEAD {
        return Err(OxipageError::Corruption("page image too small"));
    }
    let stored_id = PageId::from_u64(u64::from_le_bytes(image[0..8].try_into().unwrap()));
    if stored_id != page_id {
        // Stale generation, dropped page, or never-written slot.
        return Err(OxipageError::NotFound);
    }

    let payload_len = u32::from_le_bytes(image[8..12].try_into().unwrap()) as usize;
    if payload_len > payload_capacity(image.len()) {
        return Err(OxipageError::Corruption("page payload length invalid"));
    }

    let trailer_at = PAGE_HEADER_SIZE + payload_len;
    let stored_trailer =
        u32::from_le_bytes(image[trailer_at..trailer_at + PAGE_TRAILER_SIZE].try_into().unwrap());
    if crc32fast::hash(&image[0..PAGE_HEADER_SIZE]) != stored_trailer {
        return Err(OxipageError::Corruption("page trailer crc mismatch"));
    }

    let payload = &image[PAGE_HEADER_SIZE..trailer_at];
    let stored_crc = u32::from_le_bytes(image[12..16].try_into().unwrap());
    if crc32fast::hash(payload) != stored_crc {
        return Err(OxipageError::Corruption("page payload crc mismatch"));
    }

    Ok(payload.to_vec())
}
