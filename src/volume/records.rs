//! Volume log records
//!
//! A job's durable footprint in the volume log is a `Prepare` record
//! (its full intent) and, once everything else is durable, a `Commit`
//! record naming the prepare's slot. The commit is the single
//! lineariser: a prepare without a matching commit is an aborted job.
//!
//! Formats (little-endian):
//!
//! ```text
//! Prepare: 0x01 | job_uuid[16] | u32 n_new_pages | u32 n_read_pages
//!               | u64 new_page_id[n_new] | u64 read_page_id[n_read]
//!               | u32 n_deltas | { u64 page_id, i32 delta }[n_deltas]
//!               | u32 payload_len | payload
//! Commit:  0x02 | u64 prepare_slot
//! ```

use uuid::Uuid;

use crate::allocator::records::Cursor;
use crate::allocator::PageDelta;
use crate::error::{OxipageError, Result};
use crate::page_id::PageId;

const TAG_PREPARE: u8 = 0x01;
const TAG_COMMIT: u8 = 0x02;

/// The staged intent of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRecord {
    /// Job identity; doubles as the allocator client uuid.
    pub job: Uuid,
    /// Pages the job created.
    pub new_pages: Vec<PageId>,
    /// Existing pages the job read or referenced.
    pub read_pages: Vec<PageId>,
    /// All refcount deltas, new-page births included.
    pub deltas: Vec<PageDelta>,
    /// The application's log record for this job.
    pub payload: Vec<u8>,
}

/// A record in a volume's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeRecord {
    /// Full job intent, written before any page or allocator effect.
    Prepare(PrepareRecord),
    /// Linearisation point for the prepare at `prepare_slot`.
    Commit {
        /// Slot offset of the matching prepare record.
        prepare_slot: u64,
    },
}

impl VolumeRecord {
    /// Encode for appending to the volume log.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            VolumeRecord::Prepare(prepare) => {
                let mut buf = Vec::with_capacity(
                    29 + 8 * (prepare.new_pages.len() + prepare.read_pages.len())
                        + 12 * prepare.deltas.len()
                        + prepare.payload.len(),
                );
                buf.push(TAG_PREPARE);
                buf.extend_from_slice(prepare.job.as_bytes());
                buf.extend_from_slice(&(prepare.new_pages.len() as u32).to_le_bytes());
                buf.extend_from_slice(&(prepare.read_pages.len() as u32).to_le_bytes());
                for page in &prepare.new_pages {
                    buf.extend_from_slice(&page.to_u64().to_le_bytes());
                }
                for page in &prepare.read_pages {
                    buf.extend_from_slice(&page.to_u64().to_le_bytes());
                }
                buf.extend_from_slice(&(prepare.deltas.len() as u32).to_le_bytes());
                for delta in &prepare.deltas {
                    buf.extend_from_slice(&delta.page_id.to_u64().to_le_bytes());
                    buf.extend_from_slice(&delta.delta.to_le_bytes());
                }
                buf.extend_from_slice(&(prepare.payload.len() as u32).to_le_bytes());
                buf.extend_from_slice(&prepare.payload);
                buf
            }
            VolumeRecord::Commit { prepare_slot } => {
                let mut buf = Vec::with_capacity(9);
                buf.push(TAG_COMMIT);
                buf.extend_from_slice(&prepare_slot.to_le_bytes());
                buf
            }
        }
    }

    /// Decode a volume record payload.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let record = match cursor.u8()? {
            TAG_PREPARE => {
                let job = Uuid::from_bytes(cursor.array::<16>()?);
                let n_new = cursor.u32()? as usize;
                let n_read = cursor.u32()? as usize;
                let mut new_pages = Vec::with_capacity(n_new);
                for _ in 0..n_new {
                    new_pages.push(PageId::from_u64(cursor.u64()?));
                }
                let mut read_pages = Vec::with_capacity(n_read);
                for _ in 0..n_read {
                    read_pages.push(PageId::from_u64(cursor.u64()?));
                }
                let n_deltas = cursor.u32()? as usize;
                let mut deltas = Vec::with_capacity(n_deltas);
                for _ in 0..n_deltas {
                    deltas.push(PageDelta {
                        page_id: PageId::from_u64(cursor.u64()?),
                        delta: cursor.i32()?,
                    });
                }
                let payload_len = cursor.u32()? as usize;
                let payload = cursor.bytes(payload_len)?;
                VolumeRecord::Prepare(PrepareRecord {
                    job,
                    new_pages,
                    read_pages,
                    deltas,
                    payload,
                })
            }
            TAG_COMMIT => VolumeRecord::Commit {
                prepare_slot: cursor.u64()?,
            },
            _ => return Err(OxipageError::Corruption("unknown volume record tag")),
        };
        cursor.finish()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_roundtrip() {
        let record = VolumeRecord::Prepare(PrepareRecord {
            job: Uuid::from_u128(0xABCD),
            new_pages: vec![PageId::new(0, 1, 1)],
            read_pages: vec![PageId::new(0, 2, 3), PageId::new(1, 4, 1)],
            deltas: vec![
                PageDelta {
                    page_id: PageId::new(0, 1, 1),
                    delta: 2,
                },
                PageDelta {
                    page_id: PageId::new(0, 2, 3),
                    delta: 1,
                },
            ],
            payload: b"application record".to_vec(),
        });
        assert_eq!(VolumeRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn test_commit_roundtrip() {
        let record = VolumeRecord::Commit { prepare_slot: 4096 };
        assert_eq!(VolumeRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn test_empty_prepare_roundtrip() {
        let record = VolumeRecord::Prepare(PrepareRecord {
            job: Uuid::from_u128(1),
            new_pages: vec![],
            read_pages: vec![],
            deltas: vec![],
            payload: vec![],
        });
        assert_eq!(VolumeRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn test_truncated_rejected() {
        let mut encoded = VolumeRecord::Commit { prepare_slot: 7 }.encode();
        encoded.truncate(4);
        assert!(VolumeRecord::decode(&encoded).is_err());
    }
}
