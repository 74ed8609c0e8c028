//! Allocator log records
//!
//! The allocator's durable log holds a checkpoint prefix followed by a
//! tail of update records. Formats (little-endian):
//!
//! ```text
//! Update:     0x01 | uuid[16] | u64 client_slot | u16 n_deltas
//!                  | { u64 page_id, i32 delta }[n_deltas]
//! Checkpoint: 0x02 | u32 n_attachments | { uuid[16], u64 next_slot }*
//!                  | u32 n_pages | { u32 ref_count, u32 generation }*
//! ```

use uuid::Uuid;

use crate::error::{OxipageError, Result};
use crate::page_id::PageId;

const TAG_UPDATE: u8 = 0x01;
const TAG_CHECKPOINT: u8 = 0x02;

/// One signed reference-count change against a specific page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDelta {
    /// Target page, generation bound in.
    pub page_id: PageId,
    /// Signed reference-count change.
    pub delta: i32,
}

/// A client's exactly-once batch of refcount deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    /// Attached client submitting the update.
    pub client: Uuid,
    /// The client's monotone slot for this update.
    pub client_slot: u64,
    /// Deltas to apply atomically with the cursor advance.
    pub deltas: Vec<PageDelta>,
}

/// A compact snapshot of the allocator tables at some log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Attachment table as `(uuid, next_slot)` pairs.
    pub attachments: Vec<(Uuid, u64)>,
    /// `(ref_count, generation)` per physical index.
    pub pages: Vec<(u32, u32)>,
}

/// A record in the allocator's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocatorRecord {
    /// A client update batch.
    Update(UpdateRecord),
    /// A table snapshot.
    Checkpoint(CheckpointRecord),
}

impl AllocatorRecord {
    /// Encode for appending to the allocator log.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AllocatorRecord::Update(update) => {
                let mut buf = Vec::with_capacity(27 + update.deltas.len() * 12);
                buf.push(TAG_UPDATE);
                buf.extend_from_slice(update.client.as_bytes());
                buf.extend_from_slice(&update.client_slot.to_le_bytes());
                buf.extend_from_slice(&(update.deltas.len() as u16).to_le_bytes());
                for delta in &update.deltas {
                    buf.extend_from_slice(&delta.page_id.to_u64().to_le_bytes());
                    buf.extend_from_slice(&delta.delta.to_le_bytes());
                }
                buf
            }
            AllocatorRecord::Checkpoint(cp) => {
                let mut buf =
                    Vec::with_capacity(9 + cp.attachments.len() * 24 + cp.pages.len() * 8);
                buf.push(TAG_CHECKPOINT);
                buf.extend_from_slice(&(cp.attachments.len() as u32).to_le_bytes());
                for (uuid, next_slot) in &cp.attachments {
                    buf.extend_from_slice(uuid.as_bytes());
                    buf.extend_from_slice(&next_slot.to_le_bytes());
                }
                buf.extend_from_slice(&(cp.pages.len() as u32).to_le_bytes());
                for (ref_count, generation) in &cp.pages {
                    buf.extend_from_slice(&ref_count.to_le_bytes());
                    buf.extend_from_slice(&generation.to_le_bytes());
                }
                buf
            }
        }
    }

    /// Decode a record payload read back from the log.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        match cursor.u8()? {
            TAG_UPDATE => {
                let client = Uuid::from_bytes(cursor.array::<16>()?);
                let client_slot = cursor.u64()?;
                let n_deltas = cursor.u16()? as usize;
                let mut deltas = Vec::with_capacity(n_deltas);
                for _ in 0..n_deltas {
                    deltas.push(PageDelta {
                        page_id: PageId::from_u64(cursor.u64()?),
                        delta: cursor.i32()?,
                    });
                }
                cursor.finish()?;
                Ok(AllocatorRecord::Update(UpdateRecord {
                    client,
                    client_slot,
                    deltas,
                }))
            }
            TAG_CHECKPOINT => {
                let n_attachments = cursor.u32()? as usize;
                let mut attachments = Vec::with_capacity(n_attachments);
                for _ in 0..n_attachments {
                    let uuid = Uuid::from_bytes(cursor.array::<16>()?);
                    let next_slot = cursor.u64()?;
                    attachments.push((uuid, next_slot));
                }
                let n_pages = cursor.u32()? as usize;
                let mut pages = Vec::with_capacity(n_pages);
                for _ in 0..n_pages {
                    let ref_count = cursor.u32()?;
                    let generation = cursor.u32()?;
                    pages.push((ref_count, generation));
                }
                cursor.finish()?;
                Ok(AllocatorRecord::Checkpoint(CheckpointRecord {
                    attachments,
                    pages,
                }))
            }
            _ => Err(OxipageError::Corruption("unknown allocator record tag")),
        }
    }
}

/// Bounds-checked little-endian reader shared by the record codecs.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.at + n > self.buf.len() {
            return Err(OxipageError::Corruption("record truncated"));
        }
        let slice = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    pub(crate) fn finish(self) -> Result<()> {
        if self.at != self.buf.len() {
            return Err(OxipageError::Corruption("record has trailing bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let record = AllocatorRecord::Update(UpdateRecord {
            client: Uuid::from_u128(0x42),
            client_slot: 99,
            deltas: vec![
                PageDelta {
                    page_id: PageId::new(1, 7, 3),
                    delta: 2,
                },
                PageDelta {
                    page_id: PageId::new(1, 8, 1),
                    delta: -1,
                },
            ],
        });

        let decoded = AllocatorRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let record = AllocatorRecord::Checkpoint(CheckpointRecord {
            attachments: vec![(Uuid::from_u128(1), 10), (Uuid::from_u128(2), 0)],
            pages: vec![(0, 0), (2, 1), (1, 4)],
        });

        let decoded = AllocatorRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let record = AllocatorRecord::Update(UpdateRecord {
            client: Uuid::from_u128(9),
            client_slot: 1,
            deltas: vec![PageDelta {
                page_id: PageId::new(0, 0, 1),
                delta: 1,
            }],
        });
        let mut encoded = record.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            AllocatorRecord::decode(&encoded).unwrap_err(),
            OxipageError::Corruption(_)
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let record = AllocatorRecord::Checkpoint(CheckpointRecord {
            attachments: vec![],
            pages: vec![],
        });
        let mut encoded = record.encode();
        encoded.push(0);
        assert!(matches!(
            AllocatorRecord::decode(&encoded).unwrap_err(),
            OxipageError::Corruption(_)
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(
            AllocatorRecord::decode(&[0x7F]).unwrap_err(),
            OxipageError::Corruption(_)
        ));
    }
}
