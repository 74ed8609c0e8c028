//! Crash-safe page allocator
//!
//! A [`PageAllocator`] owns the refcount and generation state for one
//! page device, persisted in its own log as a checkpoint prefix plus a
//! tail of update records. Clients attach under a uuid and submit
//! updates tagged with a monotone slot; an update is applied exactly
//! once no matter how many times it is resubmitted across restarts.
//!
//! The durable order of an update is: append (Speculative), flush
//! barrier (Durable), then in-memory apply + cursor advance. Recovery
//! restores the newest checkpoint and replays the tail through the same
//! cursor filter, so replayed and resubmitted updates are no-ops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use uuid::Uuid;

use crate::allocator::records::{AllocatorRecord, PageDelta, UpdateRecord};
use crate::allocator::state::{AllocatorState, ApplyOutcome, PageEntry};
use crate::device::LogStorage;
use crate::error::{OxipageError, Result};
use crate::log::{LogDevice, LogDeviceConfig, LogReadMode, LogStats};
use crate::page_id::PageId;

/// Configuration for a page allocator.
#[derive(Debug, Clone)]
pub struct PageAllocatorConfig {
    /// Number of physical pages managed.
    pub page_count: u32,
    /// Capacity of the attachment table.
    pub max_attachments: usize,
    /// Capacity of the allocator's log in bytes.
    pub log_capacity: u64,
    /// Tail length in bytes that triggers an automatic checkpoint.
    pub checkpoint_watermark: u64,
}

impl PageAllocatorConfig {
    /// Configuration for `page_count` pages with derived log sizing.
    pub fn new(page_count: u32) -> Self {
        // A checkpoint is ~8 bytes per page plus the attachment table;
        // keep room for several checkpoints worth of tail.
        let snapshot = 8 * page_count as u64 + 4096;
        let log_capacity = (snapshot * 8).next_power_of_two().max(1 << 16);
        Self {
            page_count,
            max_attachments: 64,
            log_capacity,
            checkpoint_watermark: log_capacity / 2,
        }
    }
}

impl Default for PageAllocatorConfig {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Exactly-once reference-count allocator for one page device.
pub struct PageAllocator<D: LogStorage> {
    log: LogDevice<D>,
    device_index: u8,
    config: PageAllocatorConfig,
    state: Mutex<AllocatorState>,
    changed: Condvar,
    /// Updates hold this shared while their record is appended but not
    /// yet applied; checkpoint holds it exclusively so no update can
    /// land between the snapshot and the checkpoint record.
    update_gate: RwLock<()>,
    last_checkpoint_lo: AtomicU64,
}

impl<D: LogStorage> PageAllocator<D> {
    /// Format `device` as a fresh allocator log and open it.
    pub fn create(device_index: u8, device: Arc<D>, config: PageAllocatorConfig) -> Result<Self> {
        if config.page_count == 0 {
            return Err(OxipageError::InvalidConfig {
                key: "allocator.page_count".into(),
                value: "0".into(),
            });
        }
        let log = LogDevice::create(device, LogDeviceConfig::new(config.log_capacity))?;
        let state = AllocatorState::new(config.page_count, config.max_attachments);

        let allocator = Self {
            log,
            device_index,
            config,
            state: Mutex::new(state),
            changed: Condvar::new(),
            update_gate: RwLock::new(()),
            last_checkpoint_lo: AtomicU64::new(0),
        };
        allocator.checkpoint()?;
        Ok(allocator)
    }

    /// Open an existing allocator log and recover its tables.
    ///
    /// Recovery reads the newest valid checkpoint and replays the tail;
    /// replayed updates pass through the same per-client cursor filter
    /// as live ones.
    pub fn open(device_index: u8, device: Arc<D>, config: PageAllocatorConfig) -> Result<Self> {
        let log = LogDevice::open(device)?;

        let mut state = AllocatorState::new(config.page_count, config.max_attachments);
        let mut checkpoint_lo = None;
        let mut reader = log.new_reader(LogReadMode::Durable);
        while let Some((range, payload)) = reader.read_next()? {
            match AllocatorRecord::decode(&payload)? {
                AllocatorRecord::Checkpoint(cp) => {
                    if cp.pages.len() != config.page_count as usize {
                        return Err(OxipageError::Corruption(
                            "checkpoint page count does not match configuration",
                        ));
                    }
                    state = AllocatorState::restore(&cp, config.max_attachments)?;
                    checkpoint_lo = Some(range.lo);
                }
                AllocatorRecord::Update(update) => {
                    state.apply_update(&update, true)?;
                }
            }
        }
        let checkpoint_lo = checkpoint_lo.ok_or(OxipageError::Corruption(
            "allocator log contains no checkpoint",
        ))?;
        tracing::info!(
            device = device_index,
            checkpoint = checkpoint_lo,
            "allocator recovered"
        );

        Ok(Self {
            log,
            device_index,
            config,
            state: Mutex::new(state),
            changed: Condvar::new(),
            update_gate: RwLock::new(()),
            last_checkpoint_lo: AtomicU64::new(checkpoint_lo),
        })
    }

    /// This allocator's device index.
    #[inline]
    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    /// Number of physical pages managed.
    #[inline]
    pub fn page_count(&self) -> u32 {
        self.config.page_count
    }

    /// Register a client attachment. Idempotent for a uuid that is
    /// already attached at or past `initial_slot`.
    pub fn attach(&self, uuid: Uuid, initial_slot: u64) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(next) = state.attachments.get_mut(&uuid) {
            if initial_slot > *next {
                *next = initial_slot;
            }
            return Ok(());
        }
        if state.attachments.len() >= state.max_attachments {
            return Err(OxipageError::AttachmentTableFull);
        }
        state.attachments.insert(uuid, initial_slot);
        Ok(())
    }

    /// Remove a client attachment. Safe only once the client has no
    /// outstanding updates in flight.
    pub fn detach(&self, uuid: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        state
            .attachments
            .remove(&uuid)
            .map(|_| ())
            .ok_or(OxipageError::UnknownClient)
    }

    /// Reserve `count` free pages, returning fresh PageIds with bumped
    /// generations. The reservation is volatile: it becomes durable
    /// only when a subsequent update references the pages (at refcount
    /// 2), and evaporates on crash otherwise.
    pub fn allocate(&self, count: usize) -> Result<Vec<PageId>> {
        let mut state = self.state.lock();
        state.reserve_free(self.device_index, count)
    }

    /// Release a volatile reservation that will never be referenced.
    pub fn release(&self, page_id: PageId) {
        let mut state = self.state.lock();
        state.release_pending(page_id);
    }

    /// Submit a batch of refcount deltas under `(uuid, slot)`.
    ///
    /// Resubmitting an already-applied slot returns `Ok` without
    /// reapplying. Otherwise the update is made durable before the
    /// in-memory tables change; the caller returns only after both.
    pub fn update(&self, uuid: Uuid, slot: u64, deltas: &[PageDelta]) -> Result<()> {
        self.maybe_checkpoint()?;

        let gate = self.update_gate.read();
        {
            let state = self.state.lock();
            if !state.attachments.contains_key(&uuid) {
                return Err(OxipageError::UnknownClient);
            }
            if state.is_applied(&uuid, slot) {
                return Ok(());
            }
            state.validate_live(deltas)?;
        }

        let record = UpdateRecord {
            client: uuid,
            client_slot: slot,
            deltas: deltas.to_vec(),
        };
        let payload = AllocatorRecord::Update(record.clone()).encode();
        self.log.append(&payload)?;
        self.log.flush_barrier()?.wait()?;

        {
            let mut state = self.state.lock();
            if state.apply_update(&record, false)? == ApplyOutcome::Applied {
                self.changed.notify_all();
            }
        }
        drop(gate);
        Ok(())
    }

    /// Whether `(uuid, slot)` has been applied (now or in a previous
    /// incarnation). Used by volume recovery to classify prepares.
    pub fn update_applied(&self, uuid: Uuid, slot: u64) -> bool {
        self.state.lock().is_applied(&uuid, slot)
    }

    /// Current refcount of `page_id`; `NotFound` once the physical
    /// index has moved to a newer generation.
    pub fn ref_count(&self, page_id: PageId) -> Result<u32> {
        let state = self.state.lock();
        let entry = state.entry(page_id.index())?;
        if entry.generation != page_id.generation() {
            return Err(OxipageError::NotFound);
        }
        Ok(entry.ref_count)
    }

    /// Snapshot of one physical index's entry, by index.
    pub fn entry_at(&self, index: u32) -> Result<PageEntry> {
        let state = self.state.lock();
        state.entry(index).map(|entry| *entry)
    }

    /// Block until `pred` holds for the refcount of `page_id`.
    ///
    /// Fails with `NotFound` if the physical index advances to a newer
    /// generation while waiting.
    pub fn await_refcount<F>(&self, page_id: PageId, pred: F) -> Result<u32>
    where
        F: Fn(u32) -> bool,
    {
        let mut state = self.state.lock();
        loop {
            let (generation, refs) = {
                let entry = state.entry(page_id.index())?;
                (entry.generation, entry.ref_count)
            };
            if generation != page_id.generation() {
                return Err(OxipageError::NotFound);
            }
            if pred(refs) {
                return Ok(refs);
            }
            self.changed.wait(&mut state);
        }
    }

    /// Like [`await_refcount`](Self::await_refcount) with a timeout.
    pub fn await_refcount_timeout<F>(
        &self,
        page_id: PageId,
        pred: F,
        timeout: Duration,
    ) -> Result<u32>
    where
        F: Fn(u32) -> bool,
    {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let (generation, refs) = {
                let entry = state.entry(page_id.index())?;
                (entry.generation, entry.ref_count)
            };
            if generation != page_id.generation() {
                return Err(OxipageError::NotFound);
            }
            if pred(refs) {
                return Ok(refs);
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Err(OxipageError::Cancelled);
            }
        }
    }

    /// Write a checkpoint and trim the log behind it.
    pub fn checkpoint(&self) -> Result<()> {
        let _gate = self.update_gate.write();
        let record = {
            let state = self.state.lock();
            AllocatorRecord::Checkpoint(state.snapshot())
        };
        let range = self.log.append(&record.encode())?;
        self.log.sync_flush()?;
        self.log.trim(range.lo)?;
        self.last_checkpoint_lo.store(range.lo, Ordering::Release);
        tracing::debug!(
            device = self.device_index,
            checkpoint = range.lo,
            "allocator checkpoint written"
        );
        Ok(())
    }

    fn maybe_checkpoint(&self) -> Result<()> {
        let tail = self
            .log
            .stats()
            .commit_pos
            .saturating_sub(self.last_checkpoint_lo.load(Ordering::Acquire));
        if tail > self.config.checkpoint_watermark {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Pointer snapshot of the backing log.
    pub fn log_stats(&self) -> LogStats {
        self.log.stats()
    }

    /// Flush and shut down the backing log.
    pub fn close(&self) -> Result<()> {
        self.log.close()
    }
}
