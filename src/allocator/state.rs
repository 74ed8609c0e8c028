//! In-memory allocator tables
//!
//! The allocator's volatile image: one [`PageEntry`] per physical page
//! index and a fixed-capacity attachment table mapping client uuids to
//! their exactly-once slot cursor. Durable state is the checkpoint +
//! update-tail log; everything here is reconstructible from it.

use std::collections::HashMap;

use uuid::Uuid;

use crate::allocator::records::{CheckpointRecord, PageDelta, UpdateRecord};
use crate::error::{OxipageError, Result};
use crate::page_id::PageId;

/// Per-physical-index allocation state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageEntry {
    /// Reference count. 0 = free, 1 = garbage, >= 2 = live.
    pub ref_count: u32,
    /// Generation of the most recent allocation of this index.
    pub generation: u32,
    /// Reserved by `allocate` but not yet referenced by any durable
    /// update. Volatile: lost (correctly) on crash.
    pub pending: bool,
}

/// The outcome of offering an update to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Deltas were applied and the client cursor advanced.
    Applied,
    /// The update's slot was already covered; nothing changed.
    AlreadyApplied,
}

pub(crate) struct AllocatorState {
    pub(crate) pages: Vec<PageEntry>,
    /// uuid -> next_slot: the lowest slot number not yet applied.
    pub(crate) attachments: HashMap<Uuid, u64>,
    pub(crate) max_attachments: usize,
}

impl AllocatorState {
    pub(crate) fn new(page_count: u32, max_attachments: usize) -> Self {
        Self {
            pages: vec![PageEntry::default(); page_count as usize],
            attachments: HashMap::new(),
            max_attachments,
        }
    }

    pub(crate) fn entry(&self, index: u32) -> Result<&PageEntry> {
        self.pages
            .get(index as usize)
            .ok_or(OxipageError::InvalidPageId("index out of range"))
    }

    /// Whether `(uuid, slot)` has already been applied.
    pub(crate) fn is_applied(&self, uuid: &Uuid, slot: u64) -> bool {
        self.attachments
            .get(uuid)
            .is_some_and(|next| slot < *next)
    }

    /// Validate a live update's deltas without mutating anything.
    ///
    /// Generation must match the current table exactly; the allocator
    /// bumped it at `allocate` time, so any mismatch is a caller bug.
    pub(crate) fn validate_live(&self, deltas: &[PageDelta]) -> Result<()> {
        for delta in deltas {
            let entry = self.entry(delta.page_id.index())?;
            if delta.page_id.generation() != entry.generation {
                return Err(OxipageError::InvalidPageId("generation mismatch"));
            }
            let refs = entry.ref_count as i64 + delta.delta as i64;
            if refs > u32::MAX as i64 {
                return Err(OxipageError::Overflow);
            }
            assert!(
                refs >= 0,
                "refcount underflow on {}: {} {:+}",
                delta.page_id,
                entry.ref_count,
                delta.delta
            );
        }
        Ok(())
    }

    /// Apply an update. `replay` relaxes generation checking: a delta
    /// carrying a generation ahead of the table is the durable trace of
    /// an allocation whose in-memory bump died with the crashed
    /// process, and is adopted; one behind the table is a stale record
    /// and is skipped.
    pub(crate) fn apply_update(&mut self, record: &UpdateRecord, replay: bool) -> Result<ApplyOutcome> {
        if self.is_applied(&record.client, record.client_slot) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if !self.attachments.contains_key(&record.client) {
            if !replay {
                return Err(OxipageError::UnknownClient);
            }
            // The attach preceded the last checkpoint's coverage; the
            // update record itself re-establishes it.
            if self.attachments.len() >= self.max_attachments {
                return Err(OxipageError::AttachmentTableFull);
            }
            self.attachments.insert(record.client, 0);
        }

        for delta in &record.deltas {
            let index = delta.page_id.index() as usize;
            let generation = delta.page_id.generation();
            let entry = self
                .pages
                .get_mut(index)
                .ok_or(OxipageError::InvalidPageId("index out of range"))?;

            if generation > entry.generation {
                if !replay {
                    return Err(OxipageError::InvalidPageId("generation mismatch"));
                }
                entry.generation = generation;
                entry.ref_count = 0;
            } else if generation < entry.generation {
                if !replay {
                    return Err(OxipageError::InvalidPageId("generation mismatch"));
                }
                tracing::warn!(page = %delta.page_id, "skipping stale delta during replay");
                continue;
            }

            let refs = entry.ref_count as i64 + delta.delta as i64;
            if refs > u32::MAX as i64 {
                return Err(OxipageError::Overflow);
            }
            assert!(
                refs >= 0,
                "refcount underflow on {}: {} {:+}",
                delta.page_id,
                entry.ref_count,
                delta.delta
            );
            entry.ref_count = refs as u32;
            if delta.delta > 0 {
                entry.pending = false;
            }
        }

        self.attachments
            .insert(record.client, record.client_slot + 1);
        Ok(ApplyOutcome::Applied)
    }

    /// Reserve `count` free indices, bumping their generations.
    pub(crate) fn reserve_free(&mut self, device: u8, count: usize) -> Result<Vec<PageId>> {
        let mut picked = Vec::with_capacity(count);
        for (index, entry) in self.pages.iter_mut().enumerate() {
            if picked.len() == count {
                break;
            }
            if entry.ref_count == 0
                && !entry.pending
                && entry.generation < PageId::MAX_GENERATION
            {
                entry.generation += 1;
                entry.pending = true;
                picked.push(PageId::new(device, index as u32, entry.generation));
            }
        }
        if picked.len() < count {
            // Roll back the partial reservation.
            for id in &picked {
                let entry = &mut self.pages[id.index() as usize];
                entry.generation -= 1;
                entry.pending = false;
            }
            return Err(OxipageError::Exhausted);
        }
        Ok(picked)
    }

    /// Release a reservation that never became durable.
    pub(crate) fn release_pending(&mut self, page_id: PageId) {
        if let Some(entry) = self.pages.get_mut(page_id.index() as usize) {
            if entry.pending && entry.generation == page_id.generation() && entry.ref_count == 0 {
                entry.pending = false;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> CheckpointRecord {
        let mut attachments: Vec<(Uuid, u64)> =
            self.attachments.iter().map(|(k, v)| (*k, *v)).collect();
        attachments.sort_by_key(|(uuid, _)| *uuid);
        CheckpointRecord {
            attachments,
            pages: self
                .pages
                .iter()
                .map(|e| (e.ref_count, e.generation))
                .collect(),
        }
    }

    pub(crate) fn restore(record: &CheckpointRecord, max_attachments: usize) -> Result<Self> {
        if record.attachments.len() > max_attachments {
            return Err(OxipageError::Corruption(
                "checkpoint attachment table exceeds configured capacity",
            ));
        }
        Ok(Self {
            pages: record
                .pages
                .iter()
                .map(|&(ref_count, generation)| PageEntry {
                    ref_count,
                    generation,
                    pending: false,
                })
                .collect(),
            attachments: record.attachments.iter().copied().collect(),
            max_attachments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(client: Uuid, slot: u64, deltas: Vec<PageDelta>) -> UpdateRecord {
        UpdateRecord {
            client,
            client_slot: slot,
            deltas,
        }
    }

    fn delta(device: u8, index: u32, generation: u32, d: i32) -> PageDelta {
        PageDelta {
            page_id: PageId::new(device, index, generation),
            delta: d,
        }
    }

    #[test]
    fn test_reserve_free_bumps_generation() {
        let mut state = AllocatorState::new(4, 4);
        let ids = state.reserve_free(0, 2).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].generation(), 1);
        assert!(state.pages[0].pending);
        assert_eq!(state.pages[0].ref_count, 0);
    }

    #[test]
    fn test_reserve_exhausted_rolls_back() {
        let mut state = AllocatorState::new(2, 4);
        let err = state.reserve_free(0, 3).unwrap_err();
        assert!(matches!(err, OxipageError::Exhausted));
        assert!(!state.pages[0].pending);
        assert_eq!(state.pages[0].generation, 0);
    }

    #[test]
    fn test_apply_is_exactly_once() {
        let client = Uuid::from_u128(1);
        let mut state = AllocatorState::new(4, 4);
        state.attachments.insert(client, 10);
        let ids = state.reserve_free(0, 1).unwrap();

        let rec = update(client, 11, vec![delta(0, ids[0].index(), 1, 2)]);
        assert_eq!(state.apply_update(&rec, false).unwrap(), ApplyOutcome::Applied);
        assert_eq!(state.pages[0].ref_count, 2);
        assert!(!state.pages[0].pending);

        assert_eq!(
            state.apply_update(&rec, false).unwrap(),
            ApplyOutcome::AlreadyApplied
        );
        assert_eq!(state.pages[0].ref_count, 2);
    }

    #[test]
    fn test_old_slot_is_noop() {
        let client = Uuid::from_u128(2);
        let mut state = AllocatorState::new(4, 4);
        state.attachments.insert(client, 12);

        let rec = update(client, 11, vec![delta(0, 0, 1, 2)]);
        assert_eq!(
            state.apply_update(&rec, false).unwrap(),
            ApplyOutcome::AlreadyApplied
        );
        assert_eq!(state.pages[0].ref_count, 0);
    }

    #[test]
    fn test_replay_adopts_newer_generation() {
        let client = Uuid::from_u128(3);
        let mut state = AllocatorState::new(4, 4);
        state.attachments.insert(client, 0);

        // The table never saw the allocation (crash before checkpoint),
        // but the durable update carries generation 1.
        let rec = update(client, 5, vec![delta(0, 2, 1, 2)]);
        assert_eq!(state.apply_update(&rec, true).unwrap(), ApplyOutcome::Applied);
        assert_eq!(state.pages[2].generation, 1);
        assert_eq!(state.pages[2].ref_count, 2);
    }

    #[test]
    fn test_replay_reestablishes_attachment() {
        let client = Uuid::from_u128(4);
        let mut state = AllocatorState::new(4, 4);

        let rec = update(client, 7, vec![delta(0, 1, 1, 2)]);
        assert_eq!(state.apply_update(&rec, true).unwrap(), ApplyOutcome::Applied);
        assert_eq!(state.attachments[&client], 8);
    }

    #[test]
    fn test_live_unknown_client_rejected() {
        let client = Uuid::from_u128(5);
        let mut state = AllocatorState::new(4, 4);
        let rec = update(client, 1, vec![]);
        assert!(matches!(
            state.apply_update(&rec, false).unwrap_err(),
            OxipageError::UnknownClient
        ));
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn test_underflow_panics() {
        let client = Uuid::from_u128(6);
        let mut state = AllocatorState::new(4, 4);
        state.attachments.insert(client, 0);
        state.pages[0].generation = 1;

        let rec = update(client, 1, vec![delta(0, 0, 1, -1)]);
        let _ = state.apply_update(&rec, false);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let client = Uuid::from_u128(7);
        let mut state = AllocatorState::new(3, 4);
        state.attachments.insert(client, 42);
        state.pages[1] = PageEntry {
            ref_count: 2,
            generation: 5,
            pending: false,
        };

        let snap = state.snapshot();
        let restored = AllocatorState::restore(&snap, 4).unwrap();
        assert_eq!(restored.pages, state.pages);
        assert_eq!(restored.attachments, state.attachments);
    }
}
