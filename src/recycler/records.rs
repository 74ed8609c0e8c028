//! Recycler journal records
//!
//! Every state change of the recycler's queue and DFS stack is one
//! atomic journal record; recovery replays the tail to rebuild the
//! traversal mid-flight. Formats (little-endian):
//!
//! ```text
//! Identity: 0x00 | uuid[16]
//! Enqueue:  0x01 | u64 page_id
//! Push:     0x02 | u64 page_id | u16 n_refs | u64 ref_page_id[n_refs]
//! Advance:  0x03 | u32 frame_idx | u32 cursor
//! Pop:      0x04 | u32 frame_idx
//! Skip:     0x05 | u64 page_id
//! Snapshot: 0x06 | u32 n_queue | u64* | u32 n_frames
//!                | { u64 page, u32 cursor, u16 n_refs, u64* }*
//! ```

use uuid::Uuid;

use crate::allocator::records::Cursor;
use crate::error::{OxipageError, Result};
use crate::page_id::PageId;

const TAG_IDENTITY: u8 = 0x00;
const TAG_ENQUEUE: u8 = 0x01;
const TAG_PUSH: u8 = 0x02;
const TAG_ADVANCE: u8 = 0x03;
const TAG_POP: u8 = 0x04;
const TAG_SKIP: u8 = 0x05;
const TAG_SNAPSHOT: u8 = 0x06;

/// One frame of the depth-first traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The garbage page this frame is unwinding.
    pub page: PageId,
    /// Its out-references.
    pub refs: Vec<PageId>,
    /// Next out-reference to decrement.
    pub cursor: u32,
}

impl Frame {
    /// Whether every out-reference has been decremented.
    #[inline]
    pub fn exhausted(&self) -> bool {
        self.cursor as usize >= self.refs.len()
    }
}

/// A record in the recycler's journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecyclerRecord {
    /// The recycler's stable client identity, written once at create.
    Identity(Uuid),
    /// A page entered the pending-free queue.
    Enqueue(PageId),
    /// A frame was pushed (dequeuing its page if it was the queue head).
    Push {
        /// The frame's page.
        page: PageId,
        /// Parsed out-references, at most the branching bound.
        refs: Vec<PageId>,
    },
    /// A frame's cursor advanced past one out-reference.
    Advance {
        /// Index of the frame on the stack.
        frame_idx: u32,
        /// New cursor value.
        cursor: u32,
    },
    /// A frame finished and left the stack.
    Pop {
        /// Index of the frame on the stack.
        frame_idx: u32,
    },
    /// The queue head was abandoned without a frame.
    Skip(PageId),
    /// Full queue + stack snapshot; the journal trims behind it.
    Snapshot {
        /// Pending-free queue, front first.
        queue: Vec<PageId>,
        /// DFS stack, bottom first.
        stack: Vec<Frame>,
    },
}

impl RecyclerRecord {
    /// Encode for appending to the journal.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            RecyclerRecord::Identity(uuid) => {
                buf.push(TAG_IDENTITY);
                buf.extend_from_slice(uuid.as_bytes());
            }
            RecyclerRecord::Enqueue(page) => {
                buf.push(TAG_ENQUEUE);
                buf.extend_from_slice(&page.to_u64().to_le_bytes());
            }
            RecyclerRecord::Push { page, refs } => {
                buf.push(TAG_PUSH);
                buf.extend_from_slice(&page.to_u64().to_le_bytes());
                buf.extend_from_slice(&(refs.len() as u16).to_le_bytes());
                for r in refs {
                    buf.extend_from_slice(&r.to_u64().to_le_bytes());
                }
            }
            RecyclerRecord::Advance { frame_idx, cursor } => {
                buf.push(TAG_ADVANCE);
                buf.extend_from_slice(&frame_idx.to_le_bytes());
                buf.extend_from_slice(&cursor.to_le_bytes());
            }
            RecyclerRecord::Pop { frame_idx } => {
                buf.push(TAG_POP);
                buf.extend_from_slice(&frame_idx.to_le_bytes());
            }
            RecyclerRecord::Skip(page) => {
                buf.push(TAG_SKIP);
                buf.extend_from_slice(&page.to_u64().to_le_bytes());
            }
            RecyclerRecord::Snapshot { queue, stack } => {
                buf.push(TAG_SNAPSHOT);
                buf.extend_from_slice(&(queue.len() as u32).to_le_bytes());
                for page in queue {
                    buf.extend_from_slice(&page.to_u64().to_le_bytes());
                }
                buf.extend_from_slice(&(stack.len() as u32).to_le_bytes());
                for frame in stack {
                    buf.extend_from_slice(&frame.page.to_u64().to_le_bytes());
                    buf.extend_from_slice(&frame.cursor.to_le_bytes());
                    buf.extend_from_slice(&(frame.refs.len() as u16).to_le_bytes());
                    for r in &frame.refs {
                        buf.extend_from_slice(&r.to_u64().to_le_bytes());
                    }
                }
            }
        }
        buf
    }

    /// Decode a journal record payload.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let record = match cursor.u8()? {
            TAG_IDENTITY => RecyclerRecord::Identity(Uuid::from_bytes(cursor.array::<16>()?)),
            TAG_ENQUEUE => RecyclerRecord::Enqueue(PageId::from_u64(cursor.u64()?)),
            TAG_PUSH => {
                let page = PageId::from_u64(cursor.u64()?);
                let n_refs = cursor.u16()? as usize;
                let mut refs = Vec::with_capacity(n_refs);
                for _ in 0..n_refs {
                    refs.push(PageId::from_u64(cursor.u64()?));
                }
                RecyclerRecord::Push { page, refs }
            }
            TAG_ADVANCE => RecyclerRecord::Advance {
                frame_idx: cursor.u32()?,
                cursor: cursor.u32()?,
            },
            TAG_POP => RecyclerRecord::Pop {
                frame_idx: cursor.u32()?,
            },
            TAG_SKIP => RecyclerRecord::Skip(PageId::from_u64(cursor.u64()?)),
            TAG_SNAPSHOT => {
                let n_queue = cursor.u32()? as usize;
                let mut queue = Vec::with_capacity(n_queue);
                for _ in 0..n_queue {
                    queue.push(PageId::from_u64(cursor.u64()?));
                }
                let n_frames = cursor.u32()? as usize;
                let mut stack = Vec::with_capacity(n_frames);
                for _ in 0..n_frames {
                    let page = PageId::from_u64(cursor.u64()?);
                    let frame_cursor = cursor.u32()?;
                    let n_refs = cursor.u16()? as usize;
                    let mut refs = Vec::with_capacity(n_refs);
                    for _ in 0..n_refs {
                        refs.push(PageId::from_u64(cursor.u64()?));
                    }
                    stack.push(Frame {
                        page,
                        refs,
                        cursor: frame_cursor,
                    });
                }
                RecyclerRecord::Snapshot { queue, stack }
            }
            _ => return Err(OxipageError::Corruption("unknown recycler record tag")),
        };
        cursor.finish()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: RecyclerRecord) {
        let decoded = RecyclerRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_roundtrips() {
        roundtrip(RecyclerRecord::Identity(Uuid::from_u128(0xBEEF)));
        roundtrip(RecyclerRecord::Enqueue(PageId::new(1, 2, 3)));
        roundtrip(RecyclerRecord::Push {
            page: PageId::new(0, 5, 1),
            refs: vec![PageId::new(0, 6, 1), PageId::new(1, 7, 2)],
        });
        roundtrip(RecyclerRecord::Advance {
            frame_idx: 2,
            cursor: 1,
        });
        roundtrip(RecyclerRecord::Pop { frame_idx: 0 });
        roundtrip(RecyclerRecord::Skip(PageId::new(0, 9, 4)));
        roundtrip(RecyclerRecord::Snapshot {
            queue: vec![PageId::new(0, 1, 1)],
            stack: vec![Frame {
                page: PageId::new(0, 2, 1),
                refs: vec![PageId::new(0, 3, 1)],
                cursor: 1,
            }],
        });
    }

    #[test]
    fn test_empty_snapshot() {
        roundtrip(RecyclerRecord::Snapshot {
            queue: vec![],
            stack: vec![],
        });
    }

    #[test]
    fn test_frame_exhausted() {
        let frame = Frame {
            page: PageId::new(0, 1, 1),
            refs: vec![PageId::new(0, 2, 1)],
            cursor: 0,
        };
        assert!(!frame.exhausted());
        let frame = Frame { cursor: 1, ..frame };
        assert!(frame.exhausted());
    }

    #[test]
    fn test_truncated_rejected() {
        let mut encoded = RecyclerRecord::Enqueue(PageId::new(0, 1, 1)).encode();
        encoded.truncate(5);
        assert!(RecyclerRecord::decode(&encoded).is_err());
    }
}
