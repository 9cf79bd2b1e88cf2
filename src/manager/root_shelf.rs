//! The root shelf: one file per base directory holding the per-pool
//! cross-process spinlocks.
//!
//! Created on first use by whichever process gets there first; everyone
//! else opens it and spins on the same mapped words.

use crate::config::{Config, CACHE_LINE_SIZE, MAX_POOL_COUNT, ROOT_SHELF_SIZE};
use crate::error::{Error, Result};
use crate::fam::{self, FamSpinLock};
use crate::global_ptr::PoolId;
use crate::shelf_mgmt::shelf_file::{ShelfFile, ShelfMapping};
use std::path::PathBuf;

const ROOT_MAGIC: u64 = 0x6661_6d72_6f6f_7431; // "famroot1"
const ROOT_TAG: &str = "NVMM_ROOT";

/// The root shelf handle.
pub struct RootShelf {
    path: PathBuf,
    mapping: Option<ShelfMapping>,
}

impl RootShelf {
    /// Build the handle for a configuration's root shelf.
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.base_dir.join(format!("{}_{}", config.user, ROOT_TAG)),
            mapping: None,
        }
    }

    /// Whether the root shelf file exists.
    pub fn exist(&self) -> bool {
        self.path.exists()
    }

    /// Whether this handle is open.
    pub fn is_open(&self) -> bool {
        self.mapping.is_some()
    }

    /// Create and initialize the root shelf. Exclusive; a loser of the
    /// creation race gets [`Error::ShelfFileFound`] and should just open.
    pub fn create(&self) -> Result<()> {
        let file = ShelfFile::new(&self.path);
        file.create(ROOT_SHELF_SIZE)?;

        let mut file = ShelfFile::new(&self.path);
        file.open()?;
        let mapping = file.map(0, ROOT_SHELF_SIZE as usize)?;
        // A fresh file maps as zeroes, which is every lock released; the
        // magic number, written last, publishes the initialized state.
        for pool_id in 0..MAX_POOL_COUNT {
            // SAFETY: the lock array fits inside the mapping (checked below).
            unsafe { (*Self::lock_addr(mapping.as_ptr(), pool_id as PoolId)).init() };
        }
        fam::persist(mapping.as_ptr(), ROOT_SHELF_SIZE as usize);
        // SAFETY: magic word at the mapping base.
        unsafe { fam::u64_write(mapping.as_ptr(), ROOT_MAGIC) };
        fam::persist(mapping.as_ptr(), 8);
        mapping.sync()?;
        Ok(())
    }

    /// Unlink the root shelf file.
    pub fn destroy(&self) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        ShelfFile::new(&self.path).destroy()
    }

    /// Map the root shelf. Fails until the creator has published the magic
    /// number, so callers retry briefly during bootstrap races.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let mut file = ShelfFile::new(&self.path);
        file.open()?;
        let mapping = file.map(0, ROOT_SHELF_SIZE as usize)?;
        // SAFETY: magic word at the mapping base.
        let magic = unsafe { fam::u64_read(mapping.as_ptr()) };
        if magic != ROOT_MAGIC {
            return Err(Error::ShelfFileInvalidFormat(format!(
                "root shelf magic mismatch: {:#x}",
                magic
            )));
        }
        self.mapping = Some(mapping);
        Ok(())
    }

    /// Unmap the root shelf.
    pub fn close(&mut self) {
        self.mapping = None;
    }

    fn lock_addr(base: *mut u8, pool_id: PoolId) -> *const FamSpinLock {
        // SAFETY: one cache line of magic, then one lock per pool id.
        unsafe {
            base.add(CACHE_LINE_SIZE + pool_id as usize * std::mem::size_of::<FamSpinLock>())
                as *const FamSpinLock
        }
    }

    /// The cross-process spinlock serializing create/destroy of `pool_id`.
    pub fn lock(&self, pool_id: PoolId) -> Result<&FamSpinLock> {
        let mapping = self.mapping.as_ref().ok_or(Error::PoolClosed)?;
        // SAFETY: the lock lives inside the mapping, which lives as long as
        // self; the returned borrow is tied to self.
        Ok(unsafe { &*Self::lock_addr(mapping.as_ptr(), pool_id) })
    }
}

const _: () = {
    assert!(std::mem::size_of::<FamSpinLock>() == CACHE_LINE_SIZE);
    assert!(ROOT_SHELF_SIZE as usize >= CACHE_LINE_SIZE * (MAX_POOL_COUNT + 1));
};
