//! The process-wide memory manager.
//!
//! Holds the opened root shelf (per-pool cross-process spinlocks) and the
//! process-local shelf base registry, and fronts pool creation and pointer
//! translation for both presentations. Most programs use the singleton via
//! [`MemoryManager::global`]; code that needs an isolated namespace (tests,
//! embedders) builds its own instance with [`MemoryManager::with_config`]
//! and threads it through.

pub mod registry;
pub mod root_shelf;

use crate::allocator::{DistHeap, LifeCycle, PoolRegion};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fam::FamSpinLock;
use crate::global_ptr::{GlobalPtr, PoolId};
use crate::shelf_mgmt::pool::Pool;
use crate::shelf_mgmt::shelf_file::{ShelfFile, ShelfMapping};
use registry::ShelfRegistry;
use root_shelf::RootShelf;
use std::sync::OnceLock;
use tracing::{error, trace};

static GLOBAL: OnceLock<MemoryManager> = OnceLock::new();

/// Releases the pool spinlock on scope exit.
struct LockGuard<'a>(&'a FamSpinLock);

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// The memory manager: registry of pools, pointer translation, and the
/// cross-process serialization of pool create/destroy.
pub struct MemoryManager {
    config: Config,
    root: RootShelf,
    registry: ShelfRegistry,
}

impl MemoryManager {
    /// The process-wide singleton over the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the base directory or root shelf cannot be set up; there
    /// is no usable manager to return in that case.
    pub fn global() -> &'static MemoryManager {
        GLOBAL.get_or_init(|| {
            Self::with_config(Config::default())
                .unwrap_or_else(|e| panic!("famheap: memory manager init failed: {}", e))
        })
    }

    /// A manager over an explicit configuration (its own base directory and
    /// root shelf). The context-handle alternative to the singleton.
    pub fn with_config(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.base_dir)?;
        let mut root = RootShelf::new(&config);
        if !root.exist() {
            match root.create() {
                Ok(()) => {}
                // Another process won the bootstrap race.
                Err(Error::ShelfFileFound) => {}
                Err(e) => return Err(e),
            }
        }
        // The creator publishes the magic number last; give it a moment.
        let mut attempts = 0;
        loop {
            match root.open() {
                Ok(()) => break,
                Err(_) if attempts < 100 => {
                    attempts += 1;
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => {
                    error!(error = %e, "root shelf open failed");
                    return Err(e);
                }
            }
        }
        Ok(Self {
            config,
            root,
            registry: ShelfRegistry::new(),
        })
    }

    /// The configuration this manager operates under.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn pool_lock(&self, pool_id: PoolId) -> Result<LockGuard<'_>> {
        if pool_id == 0 {
            return Err(Error::PoolInvalidPoolId);
        }
        let lock = self.root.lock(pool_id)?;
        lock.lock();
        Ok(LockGuard(lock))
    }

    /// Create the heap over pool `id` with the given per-shelf size.
    pub fn create_heap(&self, id: PoolId, shelf_size: u64) -> Result<()> {
        let _guard = self.pool_lock(id)?;
        let heap = DistHeap::new(id, self.config.clone())?;
        match heap.create_heap(shelf_size) {
            Ok(()) => {
                trace!(pool_id = id, "heap created");
                Ok(())
            }
            Err(Error::PoolFound) => Err(Error::IdFound),
            Err(e) => Err(e),
        }
    }

    /// Destroy the heap over pool `id`.
    pub fn destroy_heap(&self, id: PoolId) -> Result<()> {
        let _guard = self.pool_lock(id)?;
        let heap = DistHeap::new(id, self.config.clone())?;
        match heap.destroy_heap() {
            Ok(()) => {
                trace!(pool_id = id, "heap destroyed");
                Ok(())
            }
            Err(Error::PoolNotFound) => Err(Error::IdNotFound),
            Err(e) => Err(e),
        }
    }

    /// A closed handle on the existing heap over pool `id`.
    pub fn find_heap(&self, id: PoolId) -> Result<DistHeap> {
        let heap = DistHeap::new(id, self.config.clone())?;
        if heap.exist() {
            Ok(heap)
        } else {
            Err(Error::IdNotFound)
        }
    }

    /// Create the region over pool `id` with the given size.
    pub fn create_region(&self, id: PoolId, size: u64) -> Result<()> {
        let _guard = self.pool_lock(id)?;
        let mut region = PoolRegion::new(id, self.config.clone())?;
        match region.create(size) {
            Ok(()) => {
                trace!(pool_id = id, "region created");
                Ok(())
            }
            Err(Error::PoolFound) => Err(Error::IdFound),
            Err(e) => Err(e),
        }
    }

    /// Destroy the region over pool `id`.
    pub fn destroy_region(&self, id: PoolId) -> Result<()> {
        let _guard = self.pool_lock(id)?;
        let mut region = PoolRegion::new(id, self.config.clone())?;
        match region.destroy() {
            Ok(()) => Ok(()),
            Err(Error::PoolNotFound) => Err(Error::IdNotFound),
            Err(e) => Err(e),
        }
    }

    /// A closed handle on the existing region over pool `id`.
    pub fn find_region(&self, id: PoolId) -> Result<PoolRegion> {
        let region = PoolRegion::new(id, self.config.clone())?;
        if region.exist() {
            Ok(region)
        } else {
            Err(Error::IdNotFound)
        }
    }

    /// Map the page-aligned window of the backing shelf covering
    /// `[ptr, ptr + size)` and return the address of `ptr`'s first byte.
    /// Balanced by [`MemoryManager::unmap_pointer`].
    pub fn map_pointer(&self, ptr: GlobalPtr, size: usize) -> Result<*mut u8> {
        if !ptr.is_valid() {
            return Err(Error::InvalidPtr);
        }
        let shelf_id = ptr.shelf_id();
        let offset = ptr.offset();
        let page_size = rustix::param::page_size() as u64;
        let aligned_start = offset - offset % page_size;
        let aligned_end = (offset + size as u64).div_ceil(page_size) * page_size;

        let mut pool = Pool::new(shelf_id.pool_id(), &self.config)?;
        pool.open(false).map_err(|_| Error::MapPointerFailed)?;
        let lookup = pool.shelf_path(shelf_id.shelf_idx());
        let _ = pool.close(false);
        let path = lookup.map_err(|_| Error::MapPointerFailed)?;

        let mut file = ShelfFile::new(path);
        file.open().map_err(|_| Error::MapPointerFailed)?;
        let mapping = file
            .map(aligned_start, (aligned_end - aligned_start) as usize)
            .map_err(|_| Error::MapPointerFailed)?;
        let (base, _len) = mapping.into_raw();
        trace!(%ptr, aligned_start, size, "mapped pointer range");
        // SAFETY: the adjustment stays inside the mapped window.
        Ok(unsafe { base.add((offset % page_size) as usize) })
    }

    /// Unmap a window obtained from [`MemoryManager::map_pointer`] with the
    /// same pointer and size.
    pub fn unmap_pointer(&self, ptr: GlobalPtr, addr: *mut u8, size: usize) -> Result<()> {
        let offset = ptr.offset();
        let page_size = rustix::param::page_size() as u64;
        let aligned_start = offset - offset % page_size;
        let aligned_end = (offset + size as u64).div_ceil(page_size) * page_size;
        // SAFETY: reverses the adjustment applied by map_pointer; the range
        // is exactly the one mapped there.
        unsafe {
            let base = addr.sub((offset % page_size) as usize);
            ShelfMapping::unmap_raw(base, (aligned_end - aligned_start) as usize)
        }
    }

    /// Translate a global pointer to a process-local address, mapping and
    /// caching the whole shelf on first touch.
    ///
    /// The reserve byte is stripped, so zone pointers translate to their
    /// payload address.
    pub fn global_to_local(&self, ptr: GlobalPtr) -> Result<*mut u8> {
        if !ptr.is_valid() {
            return Err(Error::InvalidPtr);
        }
        let shelf_id = ptr.shelf_id();
        let base = match self.registry.find_base(shelf_id) {
            Some(base) => base,
            None => {
                // First touch of this shelf: resolve its committed path and
                // keep it mapped for the life of the process.
                let mut pool = Pool::new(shelf_id.pool_id(), &self.config)?;
                pool.open(false)?;
                let lookup = pool.shelf_path(shelf_id.shelf_idx());
                let _ = pool.close(false);
                self.registry.map_and_register(&lookup?, shelf_id)?
            }
        };
        // SAFETY: offsets are bounded by the shelf size for any pointer a
        // famheap allocator produced.
        Ok(unsafe { base.add(ptr.offset() as usize) })
    }

    /// Reverse translation through the shelf registry. Only addresses
    /// derived from [`MemoryManager::global_to_local`] resolve; zone
    /// pointers lose their level byte, so the result of translating one is
    /// a plain (level-free) pointer.
    pub fn local_to_global(&self, addr: *const u8) -> Result<GlobalPtr> {
        let (shelf_id, base) = self.registry.find_shelf(addr)?;
        let offset = addr as usize - base as usize;
        Ok(GlobalPtr::new(shelf_id, offset as u64))
    }
}
