//! Durable bounded-depth page recycling
//!
//! A page at refcount 1 is garbage, but its content still holds
//! outgoing references whose counts must come down before the page can
//! be freed. The recycler walks that structure depth-first, always
//! processing the deepest available frame, so the persisted frontier is
//! bounded by `max_branching_factor * max_depth` regardless of subtree
//! shape.
//!
//! Every traversal step is journaled write-ahead: the step record is
//! durable in the recycler's log before the matching allocator update
//! is submitted, and the update's client slot is the journal offset of
//! its step record. Replay therefore resubmits the same `(uuid, slot)`
//! pairs and the allocator's exactly-once protocol absorbs duplicates.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::allocator::{PageAllocator, PageDelta};
use crate::device::LogStorage;
use crate::error::{OxipageError, Result};
use crate::log::{LogDevice, LogDeviceConfig, LogReadMode};
use crate::page::PageDevice;
use crate::page_id::PageId;
use crate::recycler::records::{Frame, RecyclerRecord};

/// Parses out-references from page payloads.
///
/// The producing application owns its page layout; the recycler only
/// needs the reference list, bounded by the configured branching
/// factor.
pub trait PageTracer: Send + Sync + 'static {
    /// Extract the out-references of one page payload.
    fn trace_refs(&self, payload: &[u8]) -> Result<Vec<PageId>>;
}

/// A [`PageTracer`] for the prefix-list page convention: the payload
/// leads with a little-endian `u16` reference count followed by that
/// many packed `u64` page ids; application data follows.
///
/// Used by the CLI and by applications that do not need a custom page
/// layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixRefTracer;

impl PrefixRefTracer {
    /// Build a payload in the prefix-list convention.
    pub fn encode_payload(refs: &[PageId], data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + refs.len() * 8 + data.len());
        payload.extend_from_slice(&(refs.len() as u16).to_le_bytes());
        for r in refs {
            payload.extend_from_slice(&r.to_u64().to_le_bytes());
        }
        payload.extend_from_slice(data);
        payload
    }
}

impl PageTracer for PrefixRefTracer {
    fn trace_refs(&self, payload: &[u8]) -> Result<Vec<PageId>> {
        if payload.len() < 2 {
            return Err(OxipageError::Corruption("page ref prefix truncated"));
        }
        let count = u16::from_le_bytes(payload[0..2].try_into().unwrap()) as usize;
        if payload.len() < 2 + count * 8 {
            return Err(OxipageError::Corruption("page ref list truncated"));
        }
        let mut refs = Vec::with_capacity(count);
        for i in 0..count {
            let at = 2 + i * 8;
            refs.push(PageId::from_u64(u64::from_le_bytes(
                payload[at..at + 8].try_into().unwrap(),
            )));
        }
        Ok(refs)
    }
}

/// Configuration for a page recycler.
#[derive(Debug, Clone)]
pub struct PageRecyclerConfig {
    /// Maximum out-references per page (B).
    pub max_branching_factor: usize,
    /// Maximum traversal depth (D).
    pub max_depth: usize,
    /// Capacity of the journal log in bytes.
    pub log_capacity: u64,
    /// Journal tail length that triggers a snapshot + trim.
    pub checkpoint_watermark: u64,
}

impl PageRecyclerConfig {
    /// Configuration with the given bounds and derived journal sizing.
    pub fn new(max_branching_factor: usize, max_depth: usize) -> Self {
        let log_capacity = 1 << 18;
        Self {
            max_branching_factor,
            max_depth,
            log_capacity,
            checkpoint_watermark: log_capacity / 2,
        }
    }
}

impl Default for PageRecyclerConfig {
    fn default() -> Self {
        Self::new(16, 8)
    }
}

#[derive(Default)]
struct RecyclerState {
    queue: VecDeque<PageId>,
    stack: Vec<Frame>,
}

impl RecyclerState {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.stack.is_empty()
    }

    fn tracks(&self, page_id: PageId) -> bool {
        self.queue.contains(&page_id) || self.stack.iter().any(|f| f.page == page_id)
    }
}

enum Action {
    /// A frame's next out-reference, cursor already journaled+advanced.
    Advance { child: PageId, slot: u64 },
    /// An exhausted frame's own page, Pop already journaled.
    Finish { page: PageId, slot: u64 },
    /// The queue head, not yet journaled (needs a page read first).
    Start { root: PageId },
}

struct RecyclerShared<D: LogStorage> {
    log: LogDevice<D>,
    config: PageRecyclerConfig,
    client: Uuid,
    state: Mutex<RecyclerState>,
    work_cond: Condvar,
    idle_cond: Condvar,
    allocators: HashMap<u8, Arc<PageAllocator<D>>>,
    devices: HashMap<u8, Arc<PageDevice>>,
    tracer: Arc<dyn PageTracer>,
    shutdown: AtomicBool,
    failed: AtomicBool,
    last_checkpoint_lo: AtomicU64,
}

impl<D: LogStorage> RecyclerShared<D> {
    fn check_failed(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            Err(OxipageError::Poisoned)
        } else {
            Ok(())
        }
    }

    fn fail(&self, err: &OxipageError) {
        tracing::warn!(error = %err, "recycler worker failed; recycling stopped");
        self.failed.store(true, Ordering::Release);
        self.idle_cond.notify_all();
    }

    fn allocator_for(&self, page_id: PageId) -> Result<&Arc<PageAllocator<D>>> {
        self.allocators
            .get(&page_id.device())
            .ok_or(OxipageError::InvalidPageId("no allocator for device"))
    }

    fn device_for(&self, page_id: PageId) -> Result<&Arc<PageDevice>> {
        self.devices
            .get(&page_id.device())
            .ok_or(OxipageError::InvalidPageId("no page device for device"))
    }

    /// Decrement `page` under the exactly-once slot `slot` and return
    /// its refcount afterwards (`None` once the index moved on).
    fn decrement(&self, page: PageId, slot: u64) -> Result<Option<u32>> {
        let allocator = self.allocator_for(page)?;
        allocator.update(
            self.client,
            slot,
            &[PageDelta {
                page_id: page,
                delta: -1,
            }],
        )?;
        match allocator.ref_count(page) {
            Ok(refs) => Ok(Some(refs)),
            Err(OxipageError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn drop_physical(&self, page: PageId) -> Result<()> {
        self.device_for(page)?.drop_page(page)
    }

    /// Read and parse a garbage page's out-references, enforcing the
    /// fanout bound. `Ok(None)` means the subtree is abandoned.
    fn load_refs(&self, page: PageId) -> Result<Option<Vec<PageId>>> {
        let payload = match self.device_for(page)?.read(page) {
            Ok(payload) => payload,
            Err(OxipageError::NotFound) => {
                tracing::warn!(page = %page, "garbage page vanished before tracing");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let refs = match self.tracer.trace_refs(&payload) {
            Ok(refs) => refs,
            Err(err) => {
                tracing::warn!(page = %page, error = %err, "page trace failed; abandoning subtree");
                return Ok(None);
            }
        };
        if refs.len() > self.config.max_branching_factor {
            let err = OxipageError::FanoutExceeded {
                max_branching: self.config.max_branching_factor,
            };
            tracing::warn!(page = %page, error = %err, "abandoning subtree");
            return Ok(None);
        }
        Ok(Some(refs))
    }

    /// Append a step record, making room with an inline snapshot if
    /// the journal is full.
    fn append_record_locked(
        &self,
        state: &RecyclerState,
        record: &RecyclerRecord,
    ) -> Result<crate::log::SlotRange> {
        match self.log.append(&record.encode()) {
            Err(OxipageError::NoSpace { .. }) => {
                self.checkpoint_locked(state)?;
                self.log.append(&record.encode())
            }
            other => other,
        }
    }

    /// Journal a snapshot and trim the journal behind it. Runs between
    /// steps, so every record being trimmed has had its allocator
    /// update submitted and made durable.
    fn checkpoint_locked(&self, state: &RecyclerState) -> Result<()> {
        let snapshot = RecyclerRecord::Snapshot {
            queue: state.queue.iter().copied().collect(),
            stack: state.stack.clone(),
        };
        let range = self.log.append(&snapshot.encode())?;
        self.log
            .append(&RecyclerRecord::Identity(self.client).encode())?;
        self.log.sync_flush()?;
        self.log.trim(range.lo)?;
        self.last_checkpoint_lo.store(range.lo, Ordering::Release);
        tracing::debug!(checkpoint = range.lo, "recycler journal snapshot written");
        Ok(())
    }

    fn maybe_checkpoint(&self) -> Result<()> {
        let tail = self
            .log
            .stats()
            .commit_pos
            .saturating_sub(self.last_checkpoint_lo.load(Ordering::Acquire));
        if tail > self.config.checkpoint_watermark {
            let state = self.state.lock();
            self.checkpoint_locked(&state)?;
        }
        Ok(())
    }

    /// Pick and journal the next step. Blocks when idle; returns `None`
    /// on shutdown.
    fn next_action(&self) -> Result<Option<Action>> {
        let mut state = self.state.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(top) = state.stack.last() {
                let frame_idx = (state.stack.len() - 1) as u32;
                if !top.exhausted() {
                    let child = top.refs[top.cursor as usize];
                    let cursor = top.cursor + 1;
                    let record = RecyclerRecord::Advance { frame_idx, cursor };
                    let range = self.append_record_locked(&state, &record)?;
                    state.stack.last_mut().unwrap().cursor = cursor;
                    return Ok(Some(Action::Advance {
                        child,
                        slot: range.lo,
                    }));
                }
                let record = RecyclerRecord::Pop { frame_idx };
                let range = self.append_record_locked(&state, &record)?;
                let frame = state.stack.pop().unwrap();
                return Ok(Some(Action::Finish {
                    page: frame.page,
                    slot: range.lo,
                }));
            }
            if let Some(&root) = state.queue.front() {
                return Ok(Some(Action::Start { root }));
            }
            self.idle_cond.notify_all();
            self.work_cond.wait(&mut state);
        }
    }

    /// Descend into `child`, which just became garbage.
    fn descend(&self, child: PageId) -> Result<()> {
        {
            let state = self.state.lock();
            if state.stack.len() >= self.config.max_depth {
                let err = OxipageError::DepthExceeded {
                    max_depth: self.config.max_depth,
                };
                tracing::warn!(page = %child, error = %err, "abandoning subtree");
                return Ok(());
            }
        }
        let Some(refs) = self.load_refs(child)? else {
            return Ok(());
        };
        let mut state = self.state.lock();
        // Re-check under the lock; the queue may also hold this page.
        if state.stack.len() >= self.config.max_depth || state.tracks(child) {
            return Ok(());
        }
        let record = RecyclerRecord::Push {
            page: child,
            refs: refs.clone(),
        };
        self.append_record_locked(&state, &record)?;
        state.stack.push(Frame {
            page: child,
            refs,
            cursor: 0,
        });
        Ok(())
    }

    /// Turn the queue head into a frame (or skip it).
    fn start_root(&self, root: PageId) -> Result<()> {
        let eligible = match self.allocator_for(root)?.ref_count(root) {
            Ok(1) => true,
            Ok(_) | Err(OxipageError::NotFound) => false,
            Err(err) => return Err(err),
        };
        let refs = if eligible { self.load_refs(root)? } else { None };

        let mut state = self.state.lock();
        if state.queue.front() != Some(&root) {
            return Ok(());
        }
        match refs {
            Some(refs) => {
                let record = RecyclerRecord::Push {
                    page: root,
                    refs: refs.clone(),
                };
                self.append_record_locked(&state, &record)?;
                state.queue.pop_front();
                state.stack.push(Frame {
                    page: root,
                    refs,
                    cursor: 0,
                });
            }
            None => {
                self.append_record_locked(&state, &RecyclerRecord::Skip(root))?;
                state.queue.pop_front();
            }
        }
        Ok(())
    }

    fn execute(&self, action: Action) -> Result<()> {
        match action {
            Action::Advance { child, slot } | Action::Finish { page: child, slot } => {
                // The step record must be durable before the update so
                // replay resubmits the identical (uuid, slot).
                self.log.sync_flush()?;
                match self.decrement(child, slot)? {
                    Some(1) => self.descend(child)?,
                    Some(0) => self.drop_physical(child)?,
                    _ => {}
                }
                Ok(())
            }
            Action::Start { root } => self.start_root(root),
        }
    }

    fn notify_if_idle(&self) {
        let state = self.state.lock();
        if state.is_idle() {
            self.idle_cond.notify_all();
        }
    }

    fn worker_loop(&self) {
        loop {
            let action = match self.next_action() {
                Ok(Some(action)) => action,
                Ok(None) => break,
                Err(err) => {
                    self.fail(&err);
                    break;
                }
            };
            if let Err(err) = self.execute(action) {
                self.fail(&err);
                break;
            }
            if let Err(err) = self.maybe_checkpoint() {
                self.fail(&err);
                break;
            }
            self.notify_if_idle();
        }
    }
}

/// The recycling engine for a set of page devices and allocators.
pub struct PageRecycler<D: LogStorage> {
    shared: Arc<RecyclerShared<D>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D: LogStorage> PageRecycler<D> {
    /// Format `device` as a fresh recycler journal and start the worker.
    pub fn create(
        device: Arc<D>,
        config: PageRecyclerConfig,
        allocators: HashMap<u8, Arc<PageAllocator<D>>>,
        devices: HashMap<u8, Arc<PageDevice>>,
        tracer: Arc<dyn PageTracer>,
    ) -> Result<Self> {
        let log = LogDevice::create(device, LogDeviceConfig::new(config.log_capacity))?;
        let client = Uuid::new_v4();
        log.append(&RecyclerRecord::Identity(client).encode())?;
        log.sync_flush()?;

        Self::start(log, config, client, RecyclerState::default(), allocators, devices, tracer, 0)
    }

    /// Open an existing journal: rebuild the queue and stack, resubmit
    /// the tail's decrements through the allocators' exactly-once
    /// protocol, and resume the worker.
    pub fn open(
        device: Arc<D>,
        config: PageRecyclerConfig,
        allocators: HashMap<u8, Arc<PageAllocator<D>>>,
        devices: HashMap<u8, Arc<PageDevice>>,
        tracer: Arc<dyn PageTracer>,
    ) -> Result<Self> {
        let log = LogDevice::open(device)?;

        let mut client = None;
        let mut state = RecyclerState::default();
        let mut resubmit: Vec<(PageId, u64)> = Vec::new();
        let mut checkpoint_lo = 0;

        let mut reader = log.new_reader(LogReadMode::Durable);
        while let Some((range, payload)) = reader.read_next()? {
            match RecyclerRecord::decode(&payload)? {
                RecyclerRecord::Identity(uuid) => client = Some(uuid),
                RecyclerRecord::Snapshot { queue, stack } => {
                    state.queue = queue.into();
                    state.stack = stack;
                    resubmit.clear();
                    checkpoint_lo = range.lo;
                }
                RecyclerRecord::Enqueue(page) => state.queue.push_back(page),
                RecyclerRecord::Push { page, refs } => {
                    if state.queue.front() == Some(&page) {
                        state.queue.pop_front();
                    }
                    state.stack.push(Frame {
                        page,
                        refs,
                        cursor: 0,
                    });
                }
                RecyclerRecord::Advance { frame_idx, cursor } => {
                    let frame = state
                        .stack
                        .get_mut(frame_idx as usize)
                        .ok_or(OxipageError::Corruption("advance names missing frame"))?;
                    if cursor == 0 || cursor as usize > frame.refs.len() || cursor != frame.cursor + 1
                    {
                        return Err(OxipageError::Corruption("advance cursor out of sequence"));
                    }
                    frame.cursor = cursor;
                    resubmit.push((frame.refs[(cursor - 1) as usize], range.lo));
                }
                RecyclerRecord::Pop { frame_idx } => {
                    if frame_idx as usize + 1 != state.stack.len() {
                        return Err(OxipageError::Corruption("pop names non-top frame"));
                    }
                    let frame = state.stack.pop().unwrap();
                    resubmit.push((frame.page, range.lo));
                }
                RecyclerRecord::Skip(page) => {
                    if state.queue.front() == Some(&page) {
                        state.queue.pop_front();
                    }
                }
            }
        }
        let client = client.ok_or(OxipageError::Corruption(
            "recycler journal missing identity record",
        ))?;

        for allocator in allocators.values() {
            allocator.attach(client, 0)?;
        }
        for (page, slot) in resubmit {
            let allocator = allocators
                .get(&page.device())
                .ok_or(OxipageError::InvalidPageId("no allocator for device"))?;
            allocator.update(
                client,
                slot,
                &[PageDelta {
                    page_id: page,
                    delta: -1,
                }],
            )?;
            if let Ok(0) = allocator.ref_count(page) {
                if let Some(dev) = devices.get(&page.device()) {
                    let _ = dev.drop_page(page);
                }
            }
        }
        tracing::info!(
            queued = state.queue.len(),
            frames = state.stack.len(),
            "recycler recovered"
        );

        Self::start(
            log,
            config,
            client,
            state,
            allocators,
            devices,
            tracer,
            checkpoint_lo,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn start(
        log: LogDevice<D>,
        config: PageRecyclerConfig,
        client: Uuid,
        state: RecyclerState,
        allocators: HashMap<u8, Arc<PageAllocator<D>>>,
        devices: HashMap<u8, Arc<PageDevice>>,
        tracer: Arc<dyn PageTracer>,
        checkpoint_lo: u64,
    ) -> Result<Self> {
        if config.max_depth == 0 || config.max_branching_factor == 0 {
            return Err(OxipageError::InvalidConfig {
                key: "recycler.bounds".into(),
                value: "0".into(),
            });
        }
        for allocator in allocators.values() {
            allocator.attach(client, 0)?;
        }

        let shared = Arc::new(RecyclerShared {
            log,
            config,
            client,
            state: Mutex::new(state),
            work_cond: Condvar::new(),
            idle_cond: Condvar::new(),
            allocators,
            devices,
            tracer,
            shutdown: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            last_checkpoint_lo: AtomicU64::new(checkpoint_lo),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("oxipage-recycler".into())
            .spawn(move || worker_shared.worker_loop())?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The recycler's stable allocator-client identity.
    #[inline]
    pub fn client_uuid(&self) -> Uuid {
        self.shared.client
    }

    /// Hand a garbage page (refcount 1) to the recycler.
    pub fn enqueue(&self, page_id: PageId) -> Result<()> {
        self.shared.check_failed()?;
        let mut state = self.shared.state.lock();
        if state.tracks(page_id) {
            return Ok(());
        }
        self.shared
            .append_record_locked(&state, &RecyclerRecord::Enqueue(page_id))?;
        state.queue.push_back(page_id);
        self.shared.work_cond.notify_one();
        Ok(())
    }

    /// Scan the allocators for refcount-1 pages the journal does not
    /// track and enqueue them. Returns how many were added. Used after
    /// recovery to pick up garbage whose enqueue raced a crash.
    pub fn reconcile_garbage(&self) -> Result<usize> {
        self.shared.check_failed()?;
        let mut added = 0;
        for (device_index, allocator) in &self.shared.allocators {
            for index in 0..allocator.page_count() {
                let entry = allocator.entry_at(index)?;
                if entry.ref_count == 1 {
                    let page = PageId::new(*device_index, index, entry.generation);
                    let mut state = self.shared.state.lock();
                    if !state.tracks(page) {
                        self.shared
                            .append_record_locked(&state, &RecyclerRecord::Enqueue(page))?;
                        state.queue.push_back(page);
                        added += 1;
                    }
                }
            }
        }
        if added > 0 {
            tracing::info!(added, "reconciled garbage pages into recycler queue");
            self.shared.work_cond.notify_one();
        }
        Ok(added)
    }

    /// Block until the queue and stack are both empty.
    pub fn await_quiescent(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            self.shared.check_failed()?;
            self.shared.idle_cond.wait(&mut state);
        }
        self.shared.check_failed()
    }

    /// Like [`await_quiescent`](Self::await_quiescent) with a timeout.
    pub fn await_quiescent_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            self.shared.check_failed()?;
            if self
                .shared
                .idle_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(OxipageError::Cancelled);
            }
        }
        self.shared.check_failed()
    }

    /// Stop the worker and close the journal.
    pub fn close(&self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.work_cond.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.shared.log.close()
    }
}

impl<D: LogStorage> Drop for PageRecycler<D> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
