use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use oxipage::allocator::{PageAllocator, PageAllocatorConfig, PageDelta};
use oxipage::device::{FileDevice, PageFile};
use oxipage::page::PageDevice;
use oxipage::recycler::{PageRecycler, PageRecyclerConfig, PrefixRefTracer};
use oxipage::{OxipageError, PageId};
use tempfile::tempdir;
use uuid::Uuid;

struct Fixture {
    allocator: Arc<PageAllocator<FileDevice>>,
    device: Arc<PageDevice>,
    recycler: PageRecycler<FileDevice>,
    client: Uuid,
    next_slot: u64,
}

impl Fixture {
    fn new(dir: &std::path::Path, page_count: u32, config: PageRecyclerConfig) -> Self {
        let alloc_dev = Arc::new(FileDevice::open(dir.join("alloc.log"), true).unwrap());
        let allocator = Arc::new(
            PageAllocator::create(0, alloc_dev, PageAllocatorConfig::new(page_count)).unwrap(),
        );

        let page_backing = Arc::new(FileDevice::open(dir.join("pages.dat"), true).unwrap());
        let pages = PageFile::create(page_backing, 512, page_count as u64).unwrap();
        let device = Arc::new(PageDevice::new(0, Arc::new(pages)));

        let recycler_dev = Arc::new(FileDevice::open(dir.join("recycler.log"), true).unwrap());
        let recycler = PageRecycler::create(
            recycler_dev,
            config,
            HashMap::from([(0u8, Arc::clone(&allocator))]),
            HashMap::from([(0u8, Arc::clone(&device))]),
            Arc::new(PrefixRefTracer),
        )
        .unwrap();

        let client = Uuid::from_u128(0xC11E);
        allocator.attach(client, 0).unwrap();

        Self {
            allocator,
            device,
            recycler,
            client,
            next_slot: 1,
        }
    }

    /// Allocate and write a page referencing `refs`, born at refcount 2.
    fn make_page(&mut self, refs: &[PageId]) -> PageId {
        let page = self.allocator.allocate(1).unwrap()[0];
        self.device
            .write(page, &PrefixRefTracer::encode_payload(refs, b"node"))
            .unwrap();
        self.allocator
            .update(
                self.client,
                self.next_slot,
                &[PageDelta {
                    page_id: page,
                    delta: 2,
                }],
            )
            .unwrap();
        self.next_slot += 1;
        page
    }

    /// Drop one external reference, enqueueing the page if it became
    /// garbage.
    fn drop_ref(&mut self, page: PageId) {
        self.allocator
            .update(
                self.client,
                self.next_slot,
                &[PageDelta {
                    page_id: page,
                    delta: -1,
                }],
            )
            .unwrap();
        self.next_slot += 1;
        if self.allocator.ref_count(page).unwrap() == 1 {
            self.recycler.enqueue(page).unwrap();
        }
    }
}

#[test]
fn test_chain_recycles_to_zero() {
    let dir = tempdir().unwrap();
    let mut fx = Fixture::new(dir.path(), 16, PageRecyclerConfig::new(4, 8));

    let p3 = fx.make_page(&[]);
    let p2 = fx.make_page(&[p3]);
    let p1 = fx.make_page(&[p2]);

    fx.drop_ref(p1);
    fx.recycler
        .await_quiescent_timeout(Duration::from_secs(30))
        .unwrap();

    for page in [p1, p2, p3] {
        assert_eq!(fx.allocator.ref_count(page).unwrap(), 0, "page {page}");
        // The physical page was dropped.
        assert!(matches!(
            fx.device.read(page).unwrap_err(),
            OxipageError::NotFound
        ));
    }
}

#[test]
fn test_dag_with_shared_child() {
    let dir = tempdir().unwrap();
    let mut fx = Fixture::new(dir.path(), 16, PageRecyclerConfig::new(4, 8));

    // Two parents share one child: child refcount 2 (birth) + 2 links.
    let child = fx.make_page(&[]);
    let a = fx.make_page(&[child]);
    let b = fx.make_page(&[child]);
    for _ in 0..2 {
        fx.allocator
            .update(
                fx.client,
                fx.next_slot,
                &[PageDelta {
                    page_id: child,
                    delta: 1,
                }],
            )
            .unwrap();
        fx.next_slot += 1;
    }
    // Child sits at 4: birth 2 + one per parent link.
    assert_eq!(fx.allocator.ref_count(child).unwrap(), 4);
    // The creator releases its own root ref; 3 = garbage floor + two
    // parent links.
    fx.allocator
        .update(
            fx.client,
            fx.next_slot,
            &[PageDelta {
                page_id: child,
                delta: -1,
            }],
        )
        .unwrap();
    fx.next_slot += 1;

    fx.drop_ref(a);
    fx.recycler
        .await_quiescent_timeout(Duration::from_secs(30))
        .unwrap();

    // `a` is gone; the child lost one link but survives through `b`.
    assert_eq!(fx.allocator.ref_count(a).unwrap(), 0);
    assert_eq!(fx.allocator.ref_count(child).unwrap(), 2);
    assert_eq!(fx.allocator.ref_count(b).unwrap(), 2);

    fx.drop_ref(b);
    fx.recycler
        .await_quiescent_timeout(Duration::from_secs(30))
        .unwrap();

    assert_eq!(fx.allocator.ref_count(b).unwrap(), 0);
    assert_eq!(fx.allocator.ref_count(child).unwrap(), 0);
}

#[test]
fn test_deep_chain_with_tiny_journal() {
    let dir = tempdir().unwrap();
    // A journal small enough that snapshots must happen mid-traversal:
    // the persisted frontier stays bounded by B * D, not chain length.
    let mut config = PageRecyclerConfig::new(2, 16);
    config.log_capacity = 8192;
    config.checkpoint_watermark = 2048;
    let mut fx = Fixture::new(dir.path(), 32, config);

    let mut chain = Vec::new();
    let mut prev: Option<PageId> = None;
    for _ in 0..12 {
        let refs: Vec<PageId> = prev.into_iter().collect();
        let page = fx.make_page(&refs);
        chain.push(page);
        prev = Some(page);
    }

    fx.drop_ref(*chain.last().unwrap());
    fx.recycler
        .await_quiescent_timeout(Duration::from_secs(60))
        .unwrap();

    for page in chain {
        assert_eq!(fx.allocator.ref_count(page).unwrap(), 0);
    }
}

#[test]
fn test_depth_bound_abandons_subtree() {
    let dir = tempdir().unwrap();
    let mut fx = Fixture::new(dir.path(), 16, PageRecyclerConfig::new(4, 2));

    // Depth 3 chain against a depth bound of 2.
    let p3 = fx.make_page(&[]);
    let p2 = fx.make_page(&[p3]);
    let p1 = fx.make_page(&[p2]);

    fx.drop_ref(p1);
    fx.recycler
        .await_quiescent_timeout(Duration::from_secs(30))
        .unwrap();

    // p1 and p2 recycle; p3 becomes garbage at the depth limit and is
    // left for a wider-bounded recycler.
    assert_eq!(fx.allocator.ref_count(p1).unwrap(), 0);
    assert_eq!(fx.allocator.ref_count(p2).unwrap(), 0);
    assert_eq!(fx.allocator.ref_count(p3).unwrap(), 1);
}

#[test]
fn test_fanout_bound_abandons_page() {
    let dir = tempdir().unwrap();
    let mut fx = Fixture::new(dir.path(), 16, PageRecyclerConfig::new(2, 4));

    let kids: Vec<PageId> = (0..3).map(|_| fx.make_page(&[])).collect();
    let wide = fx.make_page(&kids.clone());

    fx.drop_ref(wide);
    fx.recycler
        .await_quiescent_timeout(Duration::from_secs(30))
        .unwrap();

    // The wide page exceeds the fanout bound: abandoned at refcount 1,
    // children untouched.
    assert_eq!(fx.allocator.ref_count(wide).unwrap(), 1);
    for kid in kids {
        assert_eq!(fx.allocator.ref_count(kid).unwrap(), 2);
    }
}

#[test]
fn test_recovery_resumes_traversal() {
    let dir = tempdir().unwrap();
    let client = Uuid::from_u128(0xC11E);

    let (p1, p2, p3);
    {
        let mut fx = Fixture::new(dir.path(), 16, PageRecyclerConfig::new(4, 8));
        p3 = fx.make_page(&[]);
        p2 = fx.make_page(&[p3]);
        p1 = fx.make_page(&[p2]);
        fx.drop_ref(p1);
        fx.recycler
            .await_quiescent_timeout(Duration::from_secs(30))
            .unwrap();
        // Shut down cleanly; the journal still holds the processed tail.
        fx.recycler.close().unwrap();
        fx.allocator.close().unwrap();
    }

    // Reopen everything; replay resubmits the tail's decrements, all of
    // which are no-ops, and counts stay exact.
    let alloc_dev = Arc::new(FileDevice::open(dir.path().join("alloc.log"), false).unwrap());
    let allocator =
        Arc::new(PageAllocator::open(0, alloc_dev, PageAllocatorConfig::new(16)).unwrap());
    allocator.attach(client, 0).unwrap();

    let page_backing = Arc::new(FileDevice::open(dir.path().join("pages.dat"), false).unwrap());
    let pages = PageFile::open(page_backing, 512, 16).unwrap();
    let device = Arc::new(PageDevice::new(0, Arc::new(pages)));

    let recycler_dev = Arc::new(FileDevice::open(dir.path().join("recycler.log"), false).unwrap());
    let recycler = PageRecycler::open(
        recycler_dev,
        PageRecyclerConfig::new(4, 8),
        HashMap::from([(0u8, Arc::clone(&allocator))]),
        HashMap::from([(0u8, Arc::clone(&device))]),
        Arc::new(PrefixRefTracer),
    )
    .unwrap();

    recycler
        .await_quiescent_timeout(Duration::from_secs(30))
        .unwrap();
    for page in [p1, p2, p3] {
        assert_eq!(allocator.ref_count(page).unwrap(), 0);
    }

    // Reconciliation finds nothing left to do.
    assert_eq!(recycler.reconcile_garbage().unwrap(), 0);
}
