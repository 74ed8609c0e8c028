use std::sync::Arc;

use oxipage::allocator::{PageAllocator, PageAllocatorConfig, PageDelta};
use oxipage::device::FileDevice;
use oxipage::{OxipageError, PageId};
use rand::Rng;
use tempfile::tempdir;
use uuid::Uuid;

fn delta(page_id: PageId, d: i32) -> PageDelta {
    PageDelta { page_id, delta: d }
}

fn file_allocator(
    path: &std::path::Path,
    page_count: u32,
    create: bool,
) -> PageAllocator<FileDevice> {
    let device = Arc::new(FileDevice::open(path, create).unwrap());
    let config = PageAllocatorConfig::new(page_count);
    if create {
        PageAllocator::create(0, device, config).unwrap()
    } else {
        PageAllocator::open(0, device, config).unwrap()
    }
}

#[test]
fn test_update_stream_with_resubmission() {
    let dir = tempdir().unwrap();
    let allocator = file_allocator(&dir.path().join("alloc.log"), 16, true);

    let client = Uuid::from_u128(0x01);
    allocator.attach(client, 10).unwrap();

    let page = allocator.allocate(1).unwrap()[0];
    allocator.update(client, 11, &[delta(page, 2)]).unwrap();
    allocator.update(client, 12, &[delta(page, -1)]).unwrap();

    // Resubmitting slot 11 is acknowledged but not reapplied.
    allocator.update(client, 11, &[delta(page, 2)]).unwrap();
    assert_eq!(allocator.ref_count(page).unwrap(), 1);
}

#[test]
fn test_exactly_once_across_crashes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("alloc.log");
    let client = Uuid::from_u128(0x02);

    let page;
    {
        let allocator = file_allocator(&path, 16, true);
        allocator.attach(client, 0).unwrap();
        page = allocator.allocate(1).unwrap()[0];
        allocator.update(client, 1, &[delta(page, 2)]).unwrap();
        std::mem::forget(allocator);
    }

    // First recovery: the update replays once; resubmission is a no-op.
    {
        let allocator = file_allocator(&path, 16, false);
        assert_eq!(allocator.ref_count(page).unwrap(), 2);
        allocator.attach(client, 0).unwrap();
        allocator.update(client, 1, &[delta(page, 2)]).unwrap();
        assert_eq!(allocator.ref_count(page).unwrap(), 2);
        allocator.update(client, 2, &[delta(page, 1)]).unwrap();
        std::mem::forget(allocator);
    }

    // Second recovery sees the cumulative effect exactly once.
    let allocator = file_allocator(&path, 16, false);
    assert_eq!(allocator.ref_count(page).unwrap(), 3);
}

#[test]
fn test_generation_never_reused_across_allocations() {
    let dir = tempdir().unwrap();
    let allocator = file_allocator(&dir.path().join("alloc.log"), 4, true);
    let client = Uuid::from_u128(0x03);
    allocator.attach(client, 0).unwrap();

    let first = allocator.allocate(1).unwrap()[0];
    allocator.update(client, 1, &[delta(first, 2)]).unwrap();
    allocator.update(client, 2, &[delta(first, -2)]).unwrap();
    assert_eq!(allocator.ref_count(first).unwrap(), 0);

    // The index becomes free again; the new id carries a strictly
    // higher generation.
    let ids = allocator.allocate(4).unwrap();
    let reborn = ids.iter().find(|id| id.index() == first.index()).unwrap();
    assert!(reborn.generation() > first.generation());
    assert!(matches!(
        allocator.ref_count(first).unwrap_err(),
        OxipageError::NotFound
    ));
}

#[test]
fn test_checkpoint_watermark_triggers_trim() {
    let dir = tempdir().unwrap();
    let device = Arc::new(FileDevice::open(dir.path().join("alloc.log"), true).unwrap());
    let mut config = PageAllocatorConfig::new(8);
    config.log_capacity = 1 << 16;
    config.checkpoint_watermark = 1024;
    let allocator = PageAllocator::create(0, device, config).unwrap();

    let client = Uuid::from_u128(0x04);
    allocator.attach(client, 0).unwrap();
    let page = allocator.allocate(1).unwrap()[0];
    allocator.update(client, 1, &[delta(page, 2)]).unwrap();

    // Push enough updates through to cross the watermark repeatedly.
    for slot in 2..200u64 {
        let d = if slot % 2 == 0 { 1 } else { -1 };
        allocator.update(client, slot, &[delta(page, d)]).unwrap();
    }

    let stats = allocator.log_stats();
    assert!(stats.trim_pos > 0, "watermark should have forced a trim");
    assert!(stats.in_use() <= 2048 + stats.capacity / 2);
    assert_eq!(allocator.ref_count(page).unwrap(), 3);
}

#[test]
fn test_recovery_after_many_random_cycles() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("alloc.log");
    let client = Uuid::from_u128(0x05);
    let mut rng = rand::thread_rng();

    // Model: expected refcount per allocated page, maintained alongside
    // the real allocator across crash/reopen cycles.
    let mut expected: Vec<(PageId, u32)> = Vec::new();
    let mut next_slot = 1u64;

    {
        let allocator = file_allocator(&path, 32, true);
        allocator.attach(client, 0).unwrap();
        for _ in 0..8 {
            let page = allocator.allocate(1).unwrap()[0];
            allocator
                .update(client, next_slot, &[delta(page, 2)])
                .unwrap();
            next_slot += 1;
            expected.push((page, 2));
        }
        std::mem::forget(allocator);
    }

    for _ in 0..5 {
        let allocator = file_allocator(&path, 32, false);
        allocator.attach(client, 0).unwrap();

        for (page, refs) in expected.iter_mut() {
            assert_eq!(allocator.ref_count(*page).unwrap(), *refs);
            // Random walk that keeps counts in [1, 5].
            let d: i32 = if *refs <= 1 {
                1
            } else if *refs >= 5 {
                -1
            } else if rng.gen_bool(0.5) {
                1
            } else {
                -1
            };
            allocator
                .update(client, next_slot, &[delta(*page, d)])
                .unwrap();
            next_slot += 1;
            *refs = (*refs as i32 + d) as u32;
        }

        // Resubmit the last slot; it must not double-apply.
        let (page, refs) = expected.last().copied().unwrap();
        allocator
            .update(client, next_slot - 1, &[delta(page, 1)])
            .unwrap();
        assert_eq!(allocator.ref_count(page).unwrap(), refs);

        if rng.gen_bool(0.5) {
            allocator.checkpoint().unwrap();
        }
        std::mem::forget(allocator);
    }

    let allocator = file_allocator(&path, 32, false);
    for (page, refs) in &expected {
        assert_eq!(allocator.ref_count(*page).unwrap(), *refs);
    }
}
