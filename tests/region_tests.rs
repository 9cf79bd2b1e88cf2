//! Pool region tests: a pool presented as one contiguous range.

use famheap::allocator::{LifeCycle, Region};
use famheap::config::Config;
use famheap::error::Error;
use famheap::PoolRegion;
use tempfile::TempDir;

const REGION_SIZE: u64 = 256 * 1024;

fn region_in(dir: &TempDir, pool_id: u8) -> PoolRegion {
    PoolRegion::new(pool_id, Config::with_base_dir(dir.path())).unwrap()
}

#[test]
fn test_create_write_reopen_read() {
    let dir = TempDir::new().unwrap();
    let mut region = region_in(&dir, 1);
    region.create(REGION_SIZE).unwrap();
    assert!(region.exist());

    region.open().unwrap();
    let size = region.size().unwrap();
    assert!(size >= REGION_SIZE - 4096);
    let base = region.base().unwrap();
    unsafe {
        *(base.as_ptr() as *mut u64) = 0x1122_3344_5566_7788;
        *base.as_ptr().add(size as usize - 1) = 0xcc;
    }
    region.close().unwrap();

    // A fresh handle observes the bytes.
    let mut reopened = region_in(&dir, 1);
    reopened.open().unwrap();
    let base = reopened.base().unwrap();
    unsafe {
        assert_eq!(*(base.as_ptr() as *const u64), 0x1122_3344_5566_7788);
        assert_eq!(*base.as_ptr().add(size as usize - 1), 0xcc);
    }
    reopened.close().unwrap();
    reopened.destroy().unwrap();
    assert!(!reopened.exist());
}

#[test]
fn test_map_range_window() {
    let dir = TempDir::new().unwrap();
    let mut region = region_in(&dir, 2);
    region.create(REGION_SIZE).unwrap();
    region.open().unwrap();

    // Write through an unaligned window, read through the full mapping.
    let offset = 10_000;
    {
        let window = region.map_range(offset, 16).unwrap();
        unsafe { *(window.as_ptr() as *mut u64) = 42 };
        window.sync().unwrap();
    }
    let base = region.base().unwrap();
    unsafe {
        assert_eq!(*(base.as_ptr().add(offset as usize) as *const u64), 42);
    }

    // Out-of-bounds windows are rejected.
    let size = region.size().unwrap();
    assert!(matches!(
        region.map_range(size - 8, 16),
        Err(Error::InvalidPtr)
    ));

    region.close().unwrap();
    region.destroy().unwrap();
}

#[test]
fn test_lifecycle_errors() {
    let dir = TempDir::new().unwrap();
    let mut region = region_in(&dir, 3);
    assert!(matches!(region.open(), Err(Error::RegionOpenFailed)));
    assert!(matches!(region.destroy(), Err(Error::PoolNotFound)));

    region.create(REGION_SIZE).unwrap();
    assert!(matches!(region.create(REGION_SIZE), Err(Error::PoolFound)));

    region.open().unwrap();
    assert!(matches!(region.open(), Err(Error::PoolOpened)));
    region.close().unwrap();
    assert!(matches!(region.close(), Err(Error::PoolClosed)));
    region.destroy().unwrap();
}

#[test]
fn test_heap_shelf_does_not_open_as_region() {
    use famheap::allocator::Heap;
    use famheap::DistHeap;

    let dir = TempDir::new().unwrap();
    let config = Config::with_base_dir(dir.path());
    let mut heap = DistHeap::new(4, config.clone()).unwrap();
    heap.create(REGION_SIZE).unwrap();
    heap.open().unwrap();
    heap.alloc(64).unwrap();
    heap.close().unwrap();

    // The pool exists but its shelf carries a zone, not a region.
    let mut region = PoolRegion::new(4, config).unwrap();
    assert!(region.exist());
    assert!(matches!(region.open(), Err(Error::RegionOpenFailed)));
    heap.destroy().unwrap();
}
