//! Volumes: the atomic update root
//!
//! A [`Volume`] ties a log, a page cache, and the per-device allocators
//! into one transactional surface. Jobs stage new pages, refcount
//! deltas, and one application record, then commit through the
//! two-record protocol in [`crate::volume::job`]. On open, the volume
//! replays its log: prepares with a matching commit are done; prepares
//! without one are aborted, and any allocator effect they managed to
//! apply is reversed with compensating deltas under the job's own
//! exactly-once identity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use uuid::Uuid;

use crate::allocator::{PageAllocator, PageDelta};
use crate::cache::{PageCache, PinnedPage};
use crate::device::LogStorage;
use crate::error::{OxipageError, Result};
use crate::log::{LogDevice, LogDeviceConfig, LogReadMode, LogReader, LogStats, SlotRange, SlotReadLock};
use crate::page_id::PageId;
use crate::volume::job::PageCacheJob;
use crate::volume::records::{PrepareRecord, VolumeRecord};

/// Configuration for a volume.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Capacity of the volume log in bytes.
    pub log_capacity: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            log_capacity: 1 << 20,
        }
    }
}

/// What volume recovery found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeRecoveryReport {
    /// Prepares with a matching commit.
    pub committed: usize,
    /// Prepares without a commit, treated as aborted.
    pub aborted: usize,
    /// Aborted prepares whose allocator effects needed reversal.
    pub compensated: usize,
}

pub(crate) struct VolumeInner<D: LogStorage> {
    pub(crate) log: LogDevice<D>,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) allocators: HashMap<u8, Arc<PageAllocator<D>>>,
}

impl<D: LogStorage> VolumeInner<D> {
    /// Reverse whatever allocator effect an unmatched prepare had.
    ///
    /// The compensation runs under `(job, prepare_slot + 1)`, so it is
    /// itself exactly-once: recovery can re-run it any number of times.
    /// Returns whether any allocator had applied the prepare.
    pub(crate) fn compensate_prepare(
        &self,
        prepare_slot: u64,
        prepare: &PrepareRecord,
    ) -> Result<bool> {
        let mut by_device: HashMap<u8, Vec<PageDelta>> = HashMap::new();
        for delta in &prepare.deltas {
            by_device
                .entry(delta.page_id.device())
                .or_default()
                .push(*delta);
        }

        let mut compensated = false;
        for (device_index, deltas) in by_device {
            let Some(allocator) = self.allocators.get(&device_index) else {
                tracing::warn!(
                    device = device_index,
                    "prepare names a device with no allocator; skipping compensation"
                );
                continue;
            };
            if allocator.update_applied(prepare.job, prepare_slot) {
                let negated: Vec<PageDelta> = deltas
                    .iter()
                    .map(|d| PageDelta {
                        page_id: d.page_id,
                        delta: -d.delta,
                    })
                    .collect();
                allocator.update(prepare.job, prepare_slot + 1, &negated)?;
                compensated = true;
            }
        }

        // Physical cleanup of the job's pages once nothing counts them.
        for page in &prepare.new_pages {
            let dead = match self.allocators.get(&page.device()) {
                Some(allocator) => {
                    matches!(allocator.ref_count(*page), Ok(0) | Err(OxipageError::NotFound))
                }
                None => false,
            };
            if dead {
                if let Some(device) = self.cache.device(page.device()) {
                    let _ = device.drop_page(*page);
                }
                self.cache.forget(*page);
            }
        }
        Ok(compensated)
    }
}

/// A log-backed transactional volume over a page cache.
pub struct Volume<D: LogStorage> {
    inner: Arc<VolumeInner<D>>,
}

impl<D: LogStorage> Volume<D> {
    /// Format `device` as a fresh volume log.
    pub fn create(
        device: Arc<D>,
        config: VolumeConfig,
        cache: Arc<PageCache>,
        allocators: HashMap<u8, Arc<PageAllocator<D>>>,
    ) -> Result<Self> {
        let log = LogDevice::create(device, LogDeviceConfig::new(config.log_capacity))?;
        Ok(Self {
            inner: Arc::new(VolumeInner {
                log,
                cache,
                allocators,
            }),
        })
    }

    /// Open an existing volume log and run crash recovery.
    ///
    /// Replay classifies every prepare in the readable window. The
    /// `Commit` record is the single lineariser: with one, the job
    /// happened; without one, it did not, and any partial allocator
    /// effect is compensated away.
    pub fn open(
        device: Arc<D>,
        cache: Arc<PageCache>,
        allocators: HashMap<u8, Arc<PageAllocator<D>>>,
    ) -> Result<(Self, VolumeRecoveryReport)> {
        let log = LogDevice::open(device)?;
        let inner = Arc::new(VolumeInner {
            log,
            cache,
            allocators,
        });

        let mut prepares: BTreeMap<u64, PrepareRecord> = BTreeMap::new();
        let mut committed_jobs: Vec<Uuid> = Vec::new();
        let mut report = VolumeRecoveryReport::default();

        let mut reader = inner.log.new_reader(LogReadMode::Durable);
        while let Some((range, payload)) = reader.read_next()? {
            match VolumeRecord::decode(&payload)? {
                VolumeRecord::Prepare(prepare) => {
                    prepares.insert(range.lo, prepare);
                }
                VolumeRecord::Commit { prepare_slot } => {
                    report.committed += 1;
                    if let Some(prepare) = prepares.remove(&prepare_slot) {
                        committed_jobs.push(prepare.job);
                    }
                }
            }
        }

        for (slot, prepare) in &prepares {
            report.aborted += 1;
            if inner.compensate_prepare(*slot, prepare)? {
                report.compensated += 1;
                tracing::info!(
                    job = %prepare.job,
                    prepare_slot = slot,
                    "compensated partially applied prepare"
                );
            }
        }

        // Committed jobs never resubmit; their attachment entries are
        // dead weight in the allocator tables.
        for job in committed_jobs {
            for allocator in inner.allocators.values() {
                match allocator.detach(job) {
                    Ok(()) | Err(OxipageError::UnknownClient) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        tracing::info!(
            committed = report.committed,
            aborted = report.aborted,
            compensated = report.compensated,
            "volume recovered"
        );
        Ok((Self { inner }, report))
    }

    /// Start a new job against this volume.
    pub fn new_job(&self) -> PageCacheJob<D> {
        PageCacheJob::new(Arc::clone(&self.inner))
    }

    /// Read a page through the volume's cache.
    pub fn read_page(&self, page_id: PageId) -> Result<PinnedPage<'_>> {
        self.inner.cache.get(page_id)
    }

    /// The allocator serving `device_index`, if attached.
    pub fn allocator(&self, device_index: u8) -> Option<&Arc<PageAllocator<D>>> {
        self.inner.allocators.get(&device_index)
    }

    /// The volume's page cache.
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.inner.cache
    }

    /// Reader over the volume log; payloads decode as [`VolumeRecord`].
    pub fn new_reader(&self, mode: LogReadMode) -> LogReader<D> {
        self.inner.log.new_reader(mode)
    }

    /// Pin a slot range against trim.
    pub fn lock_slots(&self, range: SlotRange) -> SlotReadLock {
        self.inner.log.lock_slots(range)
    }

    /// Advance the volume log's trim pointer.
    pub fn trim(&self, new_trim_pos: u64) -> Result<()> {
        self.inner.log.trim(new_trim_pos)
    }

    /// Pointer snapshot of the volume log.
    pub fn log_stats(&self) -> LogStats {
        self.inner.log.stats()
    }

    /// Flush and close the volume log.
    pub fn close(&self) -> Result<()> {
        self.inner.log.close()
    }
}
