//! Pool lifecycle and recovery tests.
//!
//! These exercise the crash-consistency protocol: versioned file names,
//! rename/unlink commit points, and `recover` reconciling whatever a crash
//! (simulated here by hand-crafting files) left behind.

use famheap::config::Config;
use famheap::error::Error;
use famheap::global_ptr::ShelfId;
use famheap::shelf_mgmt::{default_format, Pool, ShelfName};
use tempfile::TempDir;

fn setup(pool_id: u8) -> (TempDir, Config, Pool) {
    let dir = TempDir::new().unwrap();
    let config = Config::with_base_dir(dir.path());
    let pool = Pool::new(pool_id, &config).unwrap();
    (dir, config, pool)
}

#[test]
fn test_round_trip_across_reopen() {
    let (_dir, config, mut pool) = setup(1);
    pool.create(64 * 1024).unwrap();
    pool.open(false).unwrap();
    let idx = pool.add_shelf(2, &default_format, true).unwrap();
    assert_eq!(idx, 2);
    pool.close(false).unwrap();

    let mut pool = Pool::new(1, &config).unwrap();
    pool.open(false).unwrap();
    assert!(pool.check_shelf(2).unwrap());
    let path = pool.shelf_path(2).unwrap();
    assert!(path.exists());
    pool.close(false).unwrap();
}

#[test]
fn test_add_remove_recover_leaves_empty_pool() {
    let (_dir, _config, mut pool) = setup(1);
    pool.create(64 * 1024).unwrap();
    pool.open(false).unwrap();

    let idx = pool.new_shelf(&default_format).unwrap();
    pool.remove_shelf(idx).unwrap();
    pool.recover().unwrap();
    assert_eq!(pool.find_next_shelf(0, 255).unwrap(), None);

    // Idempotence: the second run observes nothing new.
    pool.recover().unwrap();
    pool.close(false).unwrap();
}

#[test]
fn test_recover_deletes_dangling_add_file() {
    let (dir, config, mut pool) = setup(3);
    pool.create(64 * 1024).unwrap();
    pool.open(false).unwrap();

    // A crash after creating the transient file but before the rename
    // leaves an `_add` file with no slot state behind it.
    let names = ShelfName::new(&config);
    let dangling = names.transient_path(ShelfId::new(3, 7), 99);
    std::fs::write(&dangling, b"").unwrap();
    assert!(dangling.exists());

    pool.recover().unwrap();
    assert!(!dangling.exists());
    assert!(!pool.check_shelf(7).unwrap());

    pool.close(false).unwrap();
    drop(dir);
}

#[test]
fn test_recover_deletes_stale_older_version() {
    let (_dir, config, mut pool) = setup(4);
    pool.create(64 * 1024).unwrap();
    pool.open(false).unwrap();

    let idx = pool.new_shelf(&default_format).unwrap();
    let path = pool.shelf_path(idx).unwrap();
    let names = ShelfName::new(&config);
    let file_name = path.file_name().unwrap().to_str().unwrap().to_string();
    let (version, is_add) = names
        .parse_versioned(ShelfId::new(4, idx), &file_name)
        .unwrap();
    assert!(!is_add);

    // A crash during an earlier remove+re-add cycle would leave an
    // older-versioned file next to the live one.
    let stale = names.versioned_path(ShelfId::new(4, idx), version.wrapping_sub(1));
    std::fs::write(&stale, b"").unwrap();

    pool.recover().unwrap();
    assert!(!stale.exists());
    assert!(path.exists(), "the live shelf must survive recovery");
    pool.close(false).unwrap();
}

#[test]
fn test_recover_retires_file_of_free_slot() {
    let (_dir, config, mut pool) = setup(5);
    pool.create(64 * 1024).unwrap();
    pool.open(false).unwrap();

    // Burn a slot through one add/remove cycle so its version is known,
    // then plant a committed file at exactly the slot's current version:
    // the state a crash between rename and slot-arm (or between slot-free
    // and unlink) leaves behind.
    let idx = pool.new_shelf(&default_format).unwrap();
    let path = pool.shelf_path(idx).unwrap();
    let names = ShelfName::new(&config);
    let file_name = path.file_name().unwrap().to_str().unwrap().to_string();
    let (version, _) = names
        .parse_versioned(ShelfId::new(5, idx), &file_name)
        .unwrap();
    pool.remove_shelf(idx).unwrap();

    let orphan = names.versioned_path(ShelfId::new(5, idx), version + 1);
    std::fs::write(&orphan, b"").unwrap();

    // First run reports the inconsistency and retires the file; the second
    // observes a clean pool.
    assert!(matches!(pool.recover(), Err(Error::PoolInconsistencyFound)));
    assert!(!orphan.exists());
    assert!(!pool.check_shelf(idx).unwrap());
    pool.recover().unwrap();

    pool.close(false).unwrap();
}

#[test]
fn test_destroy_removes_every_file() {
    let (dir, config, mut pool) = setup(6);
    pool.create(64 * 1024).unwrap();
    pool.open(false).unwrap();
    for _ in 0..3 {
        pool.new_shelf(&default_format).unwrap();
    }
    pool.close(false).unwrap();
    pool.destroy().unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {:?}", leftovers);
    drop(config);
}

#[test]
fn test_operations_require_open_pool() {
    let (_dir, _config, pool) = setup(7);
    pool.create(64 * 1024).unwrap();
    assert!(matches!(pool.check_shelf(0), Err(Error::PoolClosed)));
    assert!(matches!(pool.recover(), Err(Error::PoolClosed)));
    assert!(matches!(
        pool.add_shelf(0, &default_format, true),
        Err(Error::PoolClosed)
    ));
}

#[test]
fn test_two_handles_share_membership() {
    let (_dir, config, mut pool_a) = setup(8);
    pool_a.create(64 * 1024).unwrap();
    pool_a.open(false).unwrap();

    let mut pool_b = Pool::new(8, &config).unwrap();
    pool_b.open(false).unwrap();

    let idx = pool_a.new_shelf(&default_format).unwrap();
    // The second handle observes the commit immediately.
    assert!(pool_b.check_shelf(idx).unwrap());

    // Only one removal can win.
    let a = pool_a.remove_shelf(idx);
    let b = pool_b.remove_shelf(idx);
    assert!(a.is_ok() ^ b.is_ok());

    pool_b.close(false).unwrap();
    pool_a.close(false).unwrap();
}
