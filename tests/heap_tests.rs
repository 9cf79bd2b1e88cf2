//! End-to-end distributed heap tests.
//!
//! Multi-process scenarios run here as multiple independently opened heap
//! handles: the persistent structures cannot tell a thread from a process
//! beyond address-space identity, and independent handles share nothing in
//! memory.

use famheap::allocator::{Heap, LifeCycle};
use famheap::config::Config;
use famheap::error::Error;
use famheap::DistHeap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SHELF_SIZE: u64 = 1024 * 1024;

fn heap_in(dir: &TempDir, pool_id: u8) -> DistHeap {
    DistHeap::new(pool_id, Config::with_base_dir(dir.path())).unwrap()
}

#[test]
fn test_write_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let mut heap = heap_in(&dir, 1);
    heap.create(SHELF_SIZE).unwrap();
    heap.open().unwrap();

    // Allocate ten small objects and tag each with its index.
    let ptrs: Vec<_> = (0..10u64)
        .map(|i| {
            let ptr = heap.alloc(4).expect("fresh heap must serve 4 bytes");
            let local = heap.global_to_local(ptr).expect("owned shelf is mapped");
            unsafe { *(local.as_ptr() as *mut u32) = i as u32 };
            ptr
        })
        .collect();

    // No two live allocations alias.
    let unique: BTreeSet<_> = ptrs.iter().map(|p| p.to_u64()).collect();
    assert_eq!(unique.len(), ptrs.len());

    heap.close().unwrap();
    heap.open().unwrap();

    for (i, ptr) in ptrs.iter().enumerate() {
        let local = heap.global_to_local(*ptr).expect("shelf reacquired on open");
        assert_eq!(unsafe { *(local.as_ptr() as *const u32) }, i as u32);
        heap.free(*ptr);
    }

    heap.close().unwrap();
    heap.destroy().unwrap();
    assert!(!heap.exist());
}

#[test]
fn test_concurrent_alloc_free() {
    let dir = TempDir::new().unwrap();
    let mut heap = heap_in(&dir, 1);
    heap.create(SHELF_SIZE).unwrap();
    heap.open().unwrap();
    let heap = Arc::new(heap);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let mut held = Vec::new();
                for i in 0..200u64 {
                    if let Some(ptr) = heap.alloc(64) {
                        let local = heap.global_to_local(ptr).unwrap();
                        unsafe { *(local.as_ptr() as *mut u64) = (t << 32) | i };
                        held.push((ptr, (t << 32) | i));
                    }
                }
                // Every allocation still carries our tag: nobody else got
                // the same chunk.
                for (ptr, tag) in &held {
                    let local = heap.global_to_local(*ptr).unwrap();
                    assert_eq!(unsafe { *(local.as_ptr() as *const u64) }, *tag);
                }
                for (ptr, _) in held {
                    heap.free(ptr);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let heap = Arc::try_unwrap(heap).ok().unwrap();
    let mut heap = heap;
    heap.close().unwrap();
    heap.destroy().unwrap();
}

#[test]
fn test_heap_spills_to_new_shelves() {
    let dir = TempDir::new().unwrap();
    let mut heap = heap_in(&dir, 2);
    heap.create(SHELF_SIZE).unwrap();
    heap.open().unwrap();

    // Quarter-shelf allocations force the heap across several shelves.
    let mut ptrs = Vec::new();
    let mut shelves = BTreeSet::new();
    for i in 0..12u64 {
        let ptr = heap.alloc(SHELF_SIZE / 4).expect("heap must grow via new shelves");
        let local = heap.global_to_local(ptr).unwrap();
        unsafe { *(local.as_ptr() as *mut u64) = i };
        shelves.insert(ptr.shelf_id());
        ptrs.push(ptr);
    }
    assert!(shelves.len() > 1, "expected allocations on several shelves");
    // The owned set stays within its bound even while spilling.
    assert!(heap.owned_count() <= 4);

    for ptr in ptrs {
        heap.free(ptr);
    }
    heap.close().unwrap();
    heap.destroy().unwrap();
}

#[test]
fn test_remote_free_returns_to_owner() {
    let dir = TempDir::new().unwrap();
    let mut owner = heap_in(&dir, 3);
    owner.create(SHELF_SIZE).unwrap();
    owner.open().unwrap();

    let ptr = owner.alloc(64).unwrap();
    let owner_shelf = ptr.shelf_id();

    // A second participant opens the same pool; the owner's shelf lease is
    // taken, so the peer works on its own shelf and must free our pointer
    // remotely.
    let mut peer = heap_in(&dir, 3);
    peer.open().unwrap();
    assert!(peer.global_to_local(ptr).is_none(), "peer must not map our shelf");
    peer.free(ptr);

    // The owner's cleaner drains the parked pointer back into the shelf's
    // own freelists, after which re-allocating the shelf's free chunks must
    // surface exactly the freed pointer.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut recycled = None;
    while recycled.is_none() {
        assert!(Instant::now() < deadline, "remote free never drained");
        thread::sleep(Duration::from_millis(200));

        let mut held = Vec::new();
        while let Some(p) = owner.alloc(64) {
            if p == ptr {
                recycled = Some(p);
                break;
            }
            // Once allocations spill past the owner's shelf, everything it
            // had free has been popped; the pointer was not there yet.
            if p.shelf_id() != owner_shelf {
                held.push(p);
                break;
            }
            held.push(p);
        }
        for p in held {
            owner.free(p);
        }
    }
    assert_eq!(recycled.unwrap(), ptr);

    peer.close().unwrap();
    owner.close().unwrap();
    owner.destroy().unwrap();
}

#[test]
fn test_produce_consume_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut heap = heap_in(&dir, 4);
    heap.create(SHELF_SIZE).unwrap();
    heap.open().unwrap();
    let heap = Arc::new(heap);

    // Producers stamp each allocation with its own global pointer;
    // consumers verify the stamp before freeing. No value may be observed
    // twice and none may be lost.
    let (tx, rx) = std::sync::mpsc::channel::<famheap::GlobalPtr>();
    let producers: Vec<_> = (0..4)
        .map(|_| {
            let heap = Arc::clone(&heap);
            let tx = tx.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let ptr = heap.alloc(16).expect("alloc");
                    let local = heap.global_to_local(ptr).unwrap();
                    unsafe { *(local.as_ptr() as *mut u64) = ptr.to_u64() };
                    tx.send(ptr).unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let mut seen = BTreeSet::new();
    for ptr in rx {
        let local = heap.global_to_local(ptr).unwrap();
        assert_eq!(unsafe { *(local.as_ptr() as *const u64) }, ptr.to_u64());
        assert!(seen.insert(ptr.to_u64()), "value observed twice");
        heap.free(ptr);
    }
    for p in producers {
        p.join().unwrap();
    }
    assert_eq!(seen.len(), 400);

    let mut heap = Arc::try_unwrap(heap).ok().unwrap();
    heap.close().unwrap();
    heap.destroy().unwrap();
}

#[test]
fn test_lifecycle_errors() {
    let dir = TempDir::new().unwrap();
    let mut heap = heap_in(&dir, 5);
    assert!(!heap.exist());
    assert!(matches!(heap.destroy(), Err(Error::PoolNotFound)));
    assert!(matches!(heap.open(), Err(Error::HeapOpenFailed)));

    heap.create(SHELF_SIZE).unwrap();
    assert!(matches!(heap.create(SHELF_SIZE), Err(Error::PoolFound)));

    heap.open().unwrap();
    assert!(matches!(heap.open(), Err(Error::PoolOpened)));
    assert!(matches!(heap.destroy(), Err(Error::PoolOpened)));
    heap.close().unwrap();
    assert!(matches!(heap.close(), Err(Error::PoolClosed)));
    heap.destroy().unwrap();
}

#[test]
fn test_invalid_pool_id_rejected() {
    assert!(matches!(
        DistHeap::new(0, Config::with_base_dir("/tmp/unused")),
        Err(Error::PoolInvalidPoolId)
    ));
}
