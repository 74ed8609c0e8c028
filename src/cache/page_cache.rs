//! Multi-device page cache
//!
//! Maps `PageId -> PageSlot` across a set of page devices. Because
//! page ids are immutable by construction (every write bumps the
//! generation), entries never need invalidation; the cache only evicts
//! and retries failures. At most one load per id is in flight: readers
//! that race a load coalesce on the `Loading` state and share the
//! result.
//!
//! Eviction is least-recently-used over unpinned entries. Pins are
//! RAII [`PinnedPage`] handles held during reads and job lifetimes;
//! pinned entries are never evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{OxipageError, Result};
use crate::page::PageDevice;
use crate::page_id::PageId;

/// Configuration for a page cache.
#[derive(Debug, Clone)]
pub struct PageCacheConfig {
    /// Maximum resident entries before eviction.
    pub capacity: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Reads served from a `Ready` entry.
    pub hits: u64,
    /// Reads that went to the device.
    pub misses: u64,
    /// Reads that waited on another reader's in-flight load.
    pub coalesced: u64,
    /// Entries evicted to stay under capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Snapshot the counters.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

enum SlotState {
    Loading,
    Ready(Arc<Vec<u8>>),
    Failed(&'static str),
}

struct Entry {
    state: SlotState,
    pins: usize,
    last_used: u64,
}

struct CacheInner {
    map: HashMap<PageId, Entry>,
    clock: u64,
}

/// Write-through page cache over a set of page devices.
pub struct PageCache {
    devices: HashMap<u8, Arc<PageDevice>>,
    inner: Mutex<CacheInner>,
    loaded: Condvar,
    config: PageCacheConfig,
    stats: CacheStats,
}

impl PageCache {
    /// Create a cache over `devices`, keyed by device index.
    pub fn new(config: PageCacheConfig, devices: HashMap<u8, Arc<PageDevice>>) -> Self {
        Self {
            devices,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                clock: 0,
            }),
            loaded: Condvar::new(),
            config,
            stats: CacheStats::default(),
        }
    }

    /// The device behind `index`, if attached.
    pub fn device(&self, index: u8) -> Option<&Arc<PageDevice>> {
        self.devices.get(&index)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `page_id`, loading through the owning device on a miss.
    ///
    /// The returned pin keeps the entry resident until dropped.
    /// Concurrent readers of the same id share one load.
    pub fn get(&self, page_id: PageId) -> Result<PinnedPage<'_>> {
        enum Found {
            Ready(Arc<Vec<u8>>),
            Loading,
            Failed,
            Missing,
        }

        let mut inner = self.inner.lock();
        loop {
            let found = match inner.map.get(&page_id) {
                Some(entry) => match &entry.state {
                    SlotState::Ready(bytes) => Found::Ready(Arc::clone(bytes)),
                    SlotState::Loading => Found::Loading,
                    SlotState::Failed(_) => Found::Failed,
                },
                None => Found::Missing,
            };

            match found {
                Found::Ready(bytes) => {
                    inner.clock += 1;
                    let clock = inner.clock;
                    if let Some(entry) = inner.map.get_mut(&page_id) {
                        entry.pins += 1;
                        entry.last_used = clock;
                    }
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(PinnedPage {
                        cache: self,
                        page_id,
                        bytes,
                    });
                }
                Found::Loading => {
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    self.loaded.wait(&mut inner);
                }
                Found::Failed => {
                    // Retry the load on this get.
                    inner.map.remove(&page_id);
                }
                Found::Missing => {
                    let device = self
                        .devices
                        .get(&page_id.device())
                        .ok_or(OxipageError::InvalidPageId("no device in cache"))?
                        .clone();
                    inner.map.insert(
                        page_id,
                        Entry {
                            state: SlotState::Loading,
                            pins: 0,
                            last_used: 0,
                        },
                    );
                    drop(inner);

                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    let result = device.read(page_id);

                    inner = self.inner.lock();
                    match result {
                        Ok(payload) => {
                            let bytes = Arc::new(payload);
                            inner.clock += 1;
                            let clock = inner.clock;
                            let entry = inner.map.entry(page_id).or_insert(Entry {
                                state: SlotState::Loading,
                                pins: 0,
                                last_used: clock,
                            });
                            entry.state = SlotState::Ready(Arc::clone(&bytes));
                            entry.pins += 1;
                            entry.last_used = clock;
                            self.evict_over_capacity(&mut inner);
                            self.loaded.notify_all();
                            return Ok(PinnedPage {
                                cache: self,
                                page_id,
                                bytes,
                            });
                        }
                        Err(err) => {
                            if matches!(err, OxipageError::NotFound) {
                                inner.map.remove(&page_id);
                            } else if let Some(entry) = inner.map.get_mut(&page_id) {
                                entry.state = SlotState::Failed(err.kind());
                            }
                            self.loaded.notify_all();
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Install freshly written page contents (write-through path used
    /// by job commit). The entry starts unpinned.
    pub fn install(&self, page_id: PageId, payload: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        inner.map.insert(
            page_id,
            Entry {
                state: SlotState::Ready(Arc::new(payload)),
                pins: 0,
                last_used: clock,
            },
        );
        self.evict_over_capacity(&mut inner);
        self.loaded.notify_all();
    }

    /// Drop an entry if present and unpinned. Used after a page is
    /// physically dropped.
    pub fn forget(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        let removable = matches!(
            inner.map.get(&page_id),
            Some(entry) if entry.pins == 0 && !matches!(entry.state, SlotState::Loading)
        );
        if removable {
            inner.map.remove(&page_id);
        }
    }

    fn evict_over_capacity(&self, inner: &mut CacheInner) {
        while inner.map.len() > self.config.capacity {
            let victim = inner
                .map
                .iter()
                .filter(|(_, e)| e.pins == 0 && !matches!(e.state, SlotState::Loading))
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    inner.map.remove(&id);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                // Everything is pinned or loading; let the map run over
                // capacity rather than block.
                None => break,
            }
        }
    }

    fn unpin(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.map.get_mut(&page_id) {
            debug_assert!(entry.pins > 0);
            entry.pins = entry.pins.saturating_sub(1);
        }
    }
}

/// A pinned, shared, read-only view of one cached page.
pub struct PinnedPage<'a> {
    cache: &'a PageCache,
    page_id: PageId,
    bytes: Arc<Vec<u8>>,
}

impl<'a> std::fmt::Debug for PinnedPage<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("page_id", &self.page_id)
            .field("bytes_len", &self.bytes.len())
            .finish()
    }
}

impl PinnedPage<'_> {
    /// The pinned page's id.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// The page payload.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.page_id);
    }
}
