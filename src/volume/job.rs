//! Jobs: staged atomic updates
//!
//! A [`PageCacheJob`] buffers one atomic update in memory: new pages,
//! refcount deltas against existing pages, and one application record
//! for the volume log. Nothing is durable until [`commit`]; a dropped
//! job leaves no trace beyond released reservations.
//!
//! [`commit`]: PageCacheJob::commit
//!
//! ## Commit protocol
//!
//! 1. Append `Prepare` (full intent) to the volume log; flush.
//! 2. Write and flush every new page on its page device; install into
//!    the cache.
//! 3. Submit refcount deltas to each allocator under
//!    `(job_uuid, prepare_slot)`, which makes them exactly-once.
//! 4. Append `Commit{prepare_slot}`; flush. This is the lineariser.
//! 5. Release slot locks and the job's allocator attachments.
//!
//! A crash before step 4's flush recovers as an abort (with
//! compensation if step 3 landed anywhere); after it, as committed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::allocator::PageDelta;
use crate::device::LogStorage;
use crate::error::{OxipageError, Result};
use crate::log::{SlotRange, SlotReadLock};
use crate::page_id::PageId;
use crate::volume::records::{PrepareRecord, VolumeRecord};
use crate::volume::volume::VolumeInner;

/// Receipt for a committed job.
#[derive(Debug, Clone, Copy)]
pub struct CommitReceipt {
    /// The job's identity.
    pub job: Uuid,
    /// Slot range of the `Prepare` record.
    pub prepare: SlotRange,
    /// Slot range of the `Commit` record.
    pub commit: SlotRange,
}

/// How far a failed commit got, deciding what cleanup is safe.
enum CommitPhase {
    /// Nothing durable yet.
    Staging,
    /// Prepare appended at this slot; no commit record exists.
    Prepared(u64),
    /// The commit record was appended. The job may be durable even if
    /// the commit call itself errored; recovery owns the outcome.
    Linearised,
}

/// An in-memory staging buffer for one atomic update.
pub struct PageCacheJob<D: LogStorage> {
    inner: Arc<VolumeInner<D>>,
    job_id: Uuid,
    new_pages: BTreeMap<PageId, Vec<u8>>,
    deltas: BTreeMap<PageId, i32>,
    read_pages: BTreeSet<PageId>,
    payload: Vec<u8>,
    locks: Vec<SlotReadLock>,
    finished: bool,
}

impl<D: LogStorage> PageCacheJob<D> {
    pub(crate) fn new(inner: Arc<VolumeInner<D>>) -> Self {
        Self {
            inner,
            job_id: Uuid::new_v4(),
            new_pages: BTreeMap::new(),
            deltas: BTreeMap::new(),
            read_pages: BTreeSet::new(),
            payload: Vec::new(),
            locks: Vec::new(),
            finished: false,
        }
    }

    /// The job's identity.
    #[inline]
    pub fn id(&self) -> Uuid {
        self.job_id
    }

    /// Allocate a fresh page on `device_index` and stage an empty
    /// buffer for it. Fill it with [`write_page`](Self::write_page).
    pub fn new_page(&mut self, device_index: u8) -> Result<PageId> {
        let allocator = self
            .inner
            .allocators
            .get(&device_index)
            .ok_or(OxipageError::InvalidArgument("unknown device index"))?;
        let page_id = allocator.allocate(1)?[0];
        self.new_pages.insert(page_id, Vec::new());
        Ok(page_id)
    }

    /// Stage the contents of one of this job's new pages. The buffer is
    /// exclusive to the job until commit.
    pub fn write_page(&mut self, page_id: PageId, payload: &[u8]) -> Result<()> {
        let device = self
            .inner
            .cache
            .device(page_id.device())
            .ok_or(OxipageError::InvalidPageId("no device in cache"))?;
        if payload.len() > device.payload_capacity() {
            return Err(OxipageError::InvalidArgument(
                "payload exceeds page capacity",
            ));
        }
        match self.new_pages.get_mut(&page_id) {
            Some(buffer) => {
                *buffer = payload.to_vec();
                Ok(())
            }
            None => Err(OxipageError::InvalidPageId(
                "page was not allocated by this job",
            )),
        }
    }

    /// Read a page: staged content for this job's new pages, the cache
    /// for everything else. Pages read this way are recorded in the
    /// prepare as the job's read set.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Vec<u8>> {
        if let Some(buffer) = self.new_pages.get(&page_id) {
            return Ok(buffer.clone());
        }
        let bytes = {
            let pin = self.inner.cache.get(page_id)?;
            pin.bytes().to_vec()
        };
        self.read_pages.insert(page_id);
        Ok(bytes)
    }

    /// Stage a refcount delta against an existing page.
    ///
    /// New-page births are implicit (+2 at commit); staging an explicit
    /// delta for one of the job's own pages is rejected.
    pub fn ref_delta(&mut self, page_id: PageId, delta: i32) -> Result<()> {
        if self.new_pages.contains_key(&page_id) {
            return Err(OxipageError::InvalidArgument(
                "new pages are born at refcount 2; no explicit delta",
            ));
        }
        *self.deltas.entry(page_id).or_insert(0) += delta;
        Ok(())
    }

    /// Append bytes to the job's application record in the volume log.
    pub fn append(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
    }

    /// Pin a slot range of the volume log for the job's lifetime.
    pub fn pin_slots(&mut self, range: SlotRange) {
        self.locks.push(self.inner.log.lock_slots(range));
    }

    fn prepare_record(&self) -> PrepareRecord {
        let mut deltas: Vec<PageDelta> = self
            .new_pages
            .keys()
            .map(|page_id| PageDelta {
                page_id: *page_id,
                delta: 2,
            })
            .collect();
        deltas.extend(self.deltas.iter().filter(|(_, d)| **d != 0).map(
            |(page_id, delta)| PageDelta {
                page_id: *page_id,
                delta: *delta,
            },
        ));
        PrepareRecord {
            job: self.job_id,
            new_pages: self.new_pages.keys().copied().collect(),
            read_pages: self.read_pages.iter().copied().collect(),
            deltas,
            payload: self.payload.clone(),
        }
    }

    /// Commit the job atomically. On any error the job aborts: no
    /// `Commit` record is written, reservations are released, and any
    /// allocator effect already applied is compensated away.
    pub fn commit(mut self) -> Result<CommitReceipt> {
        self.finished = true;
        let record = self.prepare_record();

        let mut phase = CommitPhase::Staging;
        match self.try_commit(&record, &mut phase) {
            Ok(receipt) => {
                // Committed jobs never resubmit; drop their attachment
                // entries.
                for allocator in self.inner.allocators.values() {
                    let _ = allocator.detach(self.job_id);
                }
                self.locks.clear();
                Ok(receipt)
            }
            Err(err) => {
                self.abort_cleanup(&record, &phase);
                Err(err)
            }
        }
    }

    fn try_commit(
        &self,
        record: &PrepareRecord,
        phase: &mut CommitPhase,
    ) -> Result<CommitReceipt> {
        // Step 1: durable intent before any side effect, so recovery
        // can always classify this job.
        let prepare = self
            .inner
            .log
            .append(&VolumeRecord::Prepare(record.clone()).encode())?;
        *phase = CommitPhase::Prepared(prepare.lo);
        self.inner.log.flush_barrier()?.wait()?;

        // Step 2: page contents, durable before they become reachable.
        let mut touched_devices = BTreeSet::new();
        for (page_id, payload) in &self.new_pages {
            let device = self
                .inner
                .cache
                .device(page_id.device())
                .ok_or(OxipageError::InvalidPageId("no device in cache"))?;
            device.write(*page_id, payload)?;
            touched_devices.insert(page_id.device());
        }
        for device_index in &touched_devices {
            if let Some(device) = self.inner.cache.device(*device_index) {
                device.flush()?;
            }
        }

        // Step 3: exactly-once refcount deltas keyed by the prepare slot.
        let mut by_device: BTreeMap<u8, Vec<PageDelta>> = BTreeMap::new();
        for delta in &record.deltas {
            by_device
                .entry(delta.page_id.device())
                .or_default()
                .push(*delta);
        }
        for (device_index, deltas) in &by_device {
            let allocator = self
                .inner
                .allocators
                .get(device_index)
                .ok_or(OxipageError::InvalidPageId("no allocator for device"))?;
            allocator.attach(self.job_id, prepare.lo)?;
            allocator.update(self.job_id, prepare.lo, deltas)?;
        }

        // Step 4: the lineariser. Once this record is appended the job
        // can no longer be cancelled or rolled back here.
        let commit = self.inner.log.append(
            &VolumeRecord::Commit {
                prepare_slot: prepare.lo,
            }
            .encode(),
        )?;
        *phase = CommitPhase::Linearised;
        self.inner.log.flush_barrier()?.wait()?;

        // Write-through: committed pages become readable via the cache.
        for (page_id, payload) in &self.new_pages {
            self.inner.cache.install(*page_id, payload.clone());
        }

        Ok(CommitReceipt {
            job: self.job_id,
            prepare,
            commit,
        })
    }

    fn abort_cleanup(&self, record: &PrepareRecord, phase: &CommitPhase) {
        let slot = match phase {
            // Nothing durable: just undo the staging below.
            CommitPhase::Staging => None,
            CommitPhase::Prepared(slot) => Some(*slot),
            // The commit record exists; whether it reached disk is for
            // recovery to decide. Rolling back here could contradict a
            // durable commit, so leave everything standing.
            CommitPhase::Linearised => return,
        };

        // Reverse any allocator effect; best effort, recovery replays
        // the same compensation if this crashes or fails.
        if let Some(slot) = slot {
            if let Err(err) = self.inner.compensate_prepare(slot, record) {
                tracing::warn!(job = %self.job_id, error = %err, "job abort compensation failed");
            }
        }
        for page_id in self.new_pages.keys() {
            if let Some(allocator) = self.inner.allocators.get(&page_id.device()) {
                allocator.release(*page_id);
            }
            self.inner.cache.forget(*page_id);
        }
        for allocator in self.inner.allocators.values() {
            let _ = allocator.detach(self.job_id);
        }
    }
}

impl<D: LogStorage> Drop for PageCacheJob<D> {
    fn drop(&mut self) {
        if !self.finished {
            // An uncommitted job has no durable footprint; just return
            // its reservations.
            for page_id in self.new_pages.keys() {
                if let Some(allocator) = self.inner.allocators.get(&page_id.device()) {
                    allocator.release(*page_id);
                }
            }
        }
    }
}
