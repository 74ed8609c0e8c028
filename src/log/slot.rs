//! Slot framing and read locks
//!
//! Records in a log are self-delimiting slots. Each slot is a
//! length-prefixed, checksummed payload padded to 8 bytes, so the sum
//! of slot sizes across the active window always equals
//! `commit_pos - trim_pos`.
//!
//! ## Slot format
//!
//! ```text
//! +------------+------------+---------------------+---------+
//! |  length    |  crc32     |      payload        | pad-to-8|
//! |  4 bytes   |  4 bytes   |   length bytes      |         |
//! +------------+------------+---------------------+---------+
//! ```
//!
//! The padding belongs to the slot: a [`SlotRange`] spans header
//! through padding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{OxipageError, Result};
use crate::utility::pad_alignment;

/// Size of the slot header in bytes (length + crc32).
pub const SLOT_HEADER_SIZE: usize = 8;

/// Alignment of slot boundaries.
pub const SLOT_ALIGN: usize = 8;

/// A half-open byte interval `[lo, hi)` in a log's virtual offset
/// space, containing exactly one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    /// Offset of the slot header.
    pub lo: u64,
    /// Offset one past the slot's padding.
    pub hi: u64,
}

impl SlotRange {
    /// Construct a range. `lo` must not exceed `hi`.
    #[inline]
    pub const fn new(lo: u64, hi: u64) -> Self {
        debug_assert!(lo <= hi);
        Self { lo, hi }
    }

    /// Length of the framed slot in bytes.
    #[inline]
    pub const fn len(&self) -> u64 {
        self.hi - self.lo
    }

    /// Whether the range is empty.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.lo == self.hi
    }

    /// Whether `offset` falls inside the range.
    #[inline]
    pub const fn contains(&self, offset: u64) -> bool {
        self.lo <= offset && offset < self.hi
    }
}

/// Framed size of a payload: header plus payload, padded to 8.
#[inline]
pub const fn framed_len(payload_len: usize) -> usize {
    pad_alignment(SLOT_HEADER_SIZE + payload_len, SLOT_ALIGN)
}

/// Frame a payload into its on-log slot representation.
pub fn encode_slot(payload: &[u8]) -> Vec<u8> {
    let total = framed_len(payload.len());
    let mut framed = vec![0u8; total];
    framed[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    framed[4..8].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
    framed[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    framed
}

/// Parse a slot header into `(payload_len, crc32)`.
#[inline]
pub fn decode_slot_header(header: &[u8; SLOT_HEADER_SIZE]) -> (u32, u32) {
    let length = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
    (length, crc)
}

/// Verify a slot payload against its header checksum.
pub fn verify_slot_payload(payload: &[u8], expected_crc: u32) -> Result<()> {
    if crc32fast::hash(payload) != expected_crc {
        return Err(OxipageError::Corruption("slot crc mismatch"));
    }
    Ok(())
}

/// Registry of held slot read locks for one log.
///
/// Trim consults the registry and refuses to cross any held interval.
pub(crate) struct SlotLockRegistry {
    held: Arc<Mutex<HashMap<u64, SlotRange>>>,
    next_id: AtomicU64,
}

impl SlotLockRegistry {
    pub(crate) fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Acquire a lock over `range`.
    pub(crate) fn acquire(&self, range: SlotRange) -> SlotReadLock {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.held.lock().insert(id, range);
        SlotReadLock {
            inner: Arc::new(LockInner {
                held: Arc::clone(&self.held),
                id,
                range,
            }),
        }
    }

    /// Lowest `lo` among held intervals that start below `pos`, if any.
    pub(crate) fn min_locked_below(&self, pos: u64) -> Option<u64> {
        self.held
            .lock()
            .values()
            .filter(|r| r.lo < pos)
            .map(|r| r.lo)
            .min()
    }

    /// Number of currently held locks.
    #[cfg(test)]
    pub(crate) fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

struct LockInner {
    held: Arc<Mutex<HashMap<u64, SlotRange>>>,
    id: u64,
    range: SlotRange,
}

impl Drop for LockInner {
    fn drop(&mut self) {
        self.held.lock().remove(&self.id);
    }
}

/// A reference-counted handle pinning `[lo, hi)` against trim.
///
/// Clones share the same registration; the interval is released when
/// the last clone drops, on all exit paths.
#[derive(Clone)]
pub struct SlotReadLock {
    inner: Arc<LockInner>,
}

impl SlotReadLock {
    /// The pinned interval.
    #[inline]
    pub fn range(&self) -> SlotRange {
        self.inner.range
    }
}

impl std::fmt::Debug for SlotReadLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotReadLock")
            .field("range", &self.inner.range)
            .finish()
    }
}
