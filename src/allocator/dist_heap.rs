//! The distributed heap: per-process owned shelf-heaps over one pool.
//!
//! Persistent state lives in the pool's shared area: the ownership lease
//! table followed by the per-shelf remote-free queues. In-memory state is
//! the map of shelf-heaps this process currently owns (bounded by
//! `MAX_OWNED_HEAP`), guarded by a reader-writer lock: allocation walks it
//! under the read lock, acquiring or evicting a shelf-heap takes the write
//! lock.
//!
//! A background cleaner thread per open heap refreshes the owner heartbeat
//! of every owned shelf-heap, revokes the leases of crashed peers (once
//! their heartbeats go stale and the shelf-heap recovers), and drains
//! pointers other processes parked on our shelves' remote-free queues. The
//! cleaner holds only a weak reference to the heap internals; closing the
//! heap sets a stop flag and joins it.

use crate::allocator::{Heap, LifeCycle};
use crate::config::{Config, MAX_OWNED_HEAP, WORKER_SLEEP_US};
use crate::error::{Error, Result};
use crate::global_ptr::{GlobalPtr, PoolId, ShelfId, ShelfIndex};
use crate::shelf_mgmt::pool::Pool;
use crate::shelf_usage::freelists::FreeLists;
use crate::shelf_usage::ownership::Ownership;
use crate::shelf_usage::shelf_heap::ShelfHeap;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::JoinHandle;
use tracing::{error, trace, warn};

type OwnedMap = BTreeMap<ShelfIndex, ShelfHeap>;

struct HeapInner {
    pool_id: PoolId,
    /// Keeps the metadata shelf mapped; `ownership` and `freelists` point
    /// into its shared area and must not outlive it (they are dropped with
    /// this struct, so they cannot).
    pool: Pool,
    ownership: Ownership,
    freelists: FreeLists,
    owned: RwLock<OwnedMap>,
    stop: AtomicBool,
}

impl HeapInner {
    fn read_owned(&self) -> RwLockReadGuard<'_, OwnedMap> {
        self.owned.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_owned(&self) -> RwLockWriteGuard<'_, OwnedMap> {
        self.owned.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scan the ownership table for an acquirable slot. First pass prefers
    /// shelves that already exist; with `allow_new`, a second pass takes a
    /// fresh slot and creates its shelf.
    fn acquire_shelf_heap(&self, allow_new: bool) -> Option<ShelfIndex> {
        for i in 0..self.ownership.count() {
            if self.ownership.check(i) {
                continue;
            }
            if self.pool.check_shelf(i as ShelfIndex).unwrap_or(false) && self.ownership.acquire(i)
            {
                trace!(shelf_idx = i, "acquired existing shelf heap");
                return Some(i as ShelfIndex);
            }
        }
        if !allow_new {
            return None;
        }
        for i in 0..self.ownership.count() {
            if self.ownership.check(i) {
                continue;
            }
            if !self.ownership.acquire(i) {
                continue;
            }
            if self.pool.check_shelf(i as ShelfIndex).unwrap_or(false) {
                // Someone created this shelf since the first pass.
                trace!(shelf_idx = i, "acquired existing shelf heap");
                return Some(i as ShelfIndex);
            }
            match self.pool.add_shelf(i as ShelfIndex, &ShelfHeap::create, false) {
                Ok(_) => {
                    trace!(shelf_idx = i, "created and acquired new shelf heap");
                    return Some(i as ShelfIndex);
                }
                Err(e) => {
                    trace!(shelf_idx = i, error = %e, "add_shelf lost a race");
                    if !self.ownership.release(i) {
                        error!(shelf_idx = i, "bug: failed to release unused ownership slot");
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Open the shelf-heap at `idx` into the owned map.
    fn open_shelf_heap(&self, owned: &mut OwnedMap, idx: ShelfIndex) -> Result<()> {
        let path = self.pool.shelf_path(idx)?;
        let mut heap = ShelfHeap::new(path, ShelfId::new(self.pool_id, idx));
        heap.open()?;
        // Stamp the lease immediately so peers see a live owner.
        heap.touch_heartbeat();
        owned.insert(idx, heap);
        Ok(())
    }

    /// Close and release one owned shelf-heap.
    fn release_shelf_heap(&self, owned: &mut OwnedMap, idx: ShelfIndex) -> bool {
        if let Some(mut heap) = owned.remove(&idx) {
            heap.close();
        }
        if !self.ownership.release(idx as usize) {
            error!(shelf_idx = idx, "bug: released a shelf heap we did not own");
            return false;
        }
        true
    }

    /// Recover the shelf-heap at `idx` on behalf of a (presumed dead)
    /// peer. `Ok` means the lease is revocable.
    fn recover_shelf_heap(&self, idx: ShelfIndex) -> Result<()> {
        let path = self.pool.shelf_path(idx)?;
        let mut heap = ShelfHeap::new(path, ShelfId::new(self.pool_id, idx));
        heap.open()?;
        let outcome = heap.recover();
        heap.close();
        if outcome.is_ok() {
            trace!(shelf_idx = idx, "revoking orphaned shelf heap");
        }
        outcome
    }
}

fn cleaner_loop(weak: Weak<HeapInner>) {
    loop {
        std::thread::sleep(std::time::Duration::from_micros(WORKER_SLEEP_US));
        // The strong reference is dropped at the end of each iteration so a
        // concurrent close can take the internals apart.
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.stop.load(Ordering::Acquire) {
            trace!("cleaner: stopping");
            return;
        }

        // Keep our leases visibly alive.
        {
            let owned = inner.read_owned();
            for heap in owned.values() {
                heap.touch_heartbeat();
            }
        }

        // Revoke leases whose holders died. Only shelves that exist can be
        // recovered; a lease burned between acquire and shelf creation
        // stays until offline maintenance.
        for i in 0..inner.ownership.count() {
            let idx = i as ShelfIndex;
            if inner.read_owned().contains_key(&idx) {
                continue;
            }
            if !inner.pool.check_shelf(idx).unwrap_or(false) {
                continue;
            }
            inner
                .ownership
                .check_and_revoke(i, |_| inner.recover_shelf_heap(idx));
        }

        // Apply at most one parked remote free per owned shelf.
        {
            let owned = inner.read_owned();
            for (idx, heap) in owned.iter() {
                if let Some(ptr) = inner.freelists.get(*idx as usize) {
                    trace!(%ptr, "cleaner: applying remote free");
                    heap.free(ptr.reserve_and_offset());
                }
            }
        }
    }
}

/// The distributed heap over one pool.
pub struct DistHeap {
    pool_id: PoolId,
    config: Config,
    inner: Option<Arc<HeapInner>>,
    cleaner: Option<JoinHandle<()>>,
}

impl DistHeap {
    /// Create a handle for the heap over pool `pool_id`.
    pub fn new(pool_id: PoolId, config: Config) -> Result<Self> {
        if pool_id == 0 {
            return Err(Error::PoolInvalidPoolId);
        }
        Ok(Self {
            pool_id,
            config,
            inner: None,
            cleaner: None,
        })
    }

    /// The pool this heap presents.
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    fn make_pool(&self) -> Result<Pool> {
        Pool::new(self.pool_id, &self.config)
    }

    fn opened(&self) -> Result<&Arc<HeapInner>> {
        self.inner.as_ref().ok_or(Error::PoolClosed)
    }

    /// Create the backing pool with the ownership table and freelists laid
    /// out in its shared area.
    pub fn create_heap(&self, shelf_size: u64) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        let mut pool = self.make_pool()?;
        if pool.exist() {
            return Err(Error::PoolFound);
        }
        match pool.create(shelf_size) {
            Ok(()) => {}
            Err(Error::PoolFound) => return Err(Error::PoolFound),
            Err(e) => {
                error!(pool_id = self.pool_id, error = %e, "pool create failed");
                return Err(Error::HeapCreateFailed);
            }
        }
        let result = (|| -> Result<()> {
            pool.open(false)?;
            let (addr, avail) = pool.shared_area()?;
            let count = pool.size();
            let ownership_size = Ownership::layout_size(count);
            // SAFETY: the shared area is mapped, cache-line aligned, and
            // exclusively ours until the pool is published by create.
            unsafe {
                Ownership::create(addr, avail, count)?;
                let tail = NonNull::new_unchecked(addr.as_ptr().add(ownership_size));
                FreeLists::create(tail, avail - ownership_size, count)?;
            }
            pool.close(false)?;
            Ok(())
        })();
        result.map_err(|e| {
            error!(pool_id = self.pool_id, error = %e, "heap metadata create failed");
            Error::HeapCreateFailed
        })
    }

    /// Destroy every shelf and the backing pool.
    ///
    /// The ownership table and freelists live in the metadata shelf that is
    /// unlinked with the pool; they are not scrubbed separately.
    pub fn destroy_heap(&self) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        let mut pool = self.make_pool()?;
        if !pool.exist() {
            return Err(Error::PoolNotFound);
        }
        pool.open(false).map_err(|_| Error::HeapDestroyFailed)?;
        if let Err(e) = pool.recover() {
            warn!(pool_id = self.pool_id, error = %e, "inconsistency while destroying heap");
        }
        for idx in 0..pool.size() {
            let idx = idx as ShelfIndex;
            if pool.check_shelf(idx).map_err(|_| Error::HeapDestroyFailed)? {
                if let Ok(path) = pool.shelf_path(idx) {
                    let mut heap = ShelfHeap::new(path, ShelfId::new(self.pool_id, idx));
                    let _ = heap.destroy();
                }
                if pool.remove_shelf(idx).is_err() {
                    let _ = pool.close(false);
                    return Err(Error::HeapDestroyFailed);
                }
            }
        }
        pool.close(false).map_err(|_| Error::HeapDestroyFailed)?;
        pool.destroy().map_err(|_| Error::HeapDestroyFailed)?;
        Ok(())
    }

    fn open_heap(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        let mut pool = self.make_pool()?;
        pool.open(false).map_err(|e| {
            warn!(pool_id = self.pool_id, error = %e, "heap open failed");
            Error::HeapOpenFailed
        })?;

        let (addr, avail) = pool.shared_area()?;
        let count = pool.size();
        // SAFETY: the shared area stays mapped for as long as `pool` lives,
        // and both handles are stored beside it in HeapInner.
        let (ownership, freelists) = unsafe {
            let ownership =
                Ownership::open(addr, avail).map_err(|_| Error::HeapOpenFailed)?;
            debug_assert_eq!(ownership.count(), count);
            let tail = NonNull::new_unchecked(addr.as_ptr().add(ownership.size()));
            let freelists = FreeLists::open(tail, avail - ownership.size())
                .map_err(|_| Error::HeapOpenFailed)?;
            (ownership, freelists)
        };

        let inner = Arc::new(HeapInner {
            pool_id: self.pool_id,
            pool,
            ownership,
            freelists,
            owned: RwLock::new(BTreeMap::new()),
            stop: AtomicBool::new(false),
        });

        // Opportunistically take one shelf-heap so the first alloc is fast.
        {
            let mut owned = inner.write_owned();
            if let Some(idx) = inner.acquire_shelf_heap(true) {
                if let Err(e) = inner.open_shelf_heap(&mut owned, idx) {
                    warn!(shelf_idx = idx, error = %e, "opportunistic shelf heap open failed");
                    inner.ownership.release(idx as usize);
                }
            }
        }

        let weak = Arc::downgrade(&inner);
        let cleaner = std::thread::Builder::new()
            .name(format!("famheap-cleaner-{}", self.pool_id))
            .spawn(move || cleaner_loop(weak))
            .map_err(|_| Error::HeapOpenFailed)?;

        self.inner = Some(inner);
        self.cleaner = Some(cleaner);
        trace!(pool_id = self.pool_id, "heap opened");
        Ok(())
    }

    fn close_heap(&mut self) -> Result<()> {
        let inner = self.inner.take().ok_or(Error::PoolClosed)?;
        inner.stop.store(true, Ordering::Release);
        if let Some(cleaner) = self.cleaner.take() {
            let _ = cleaner.join();
        }

        {
            let mut owned = inner.write_owned();
            while let Some((idx, mut heap)) = owned.pop_first() {
                heap.close();
                if !inner.ownership.release(idx as usize) {
                    error!(shelf_idx = idx, "bug: close found an unowned shelf heap");
                    return Err(Error::HeapCloseFailed);
                }
            }
        }

        // The cleaner has exited and held only a weak reference.
        let mut inner = Arc::try_unwrap(inner).map_err(|_| Error::HeapCloseFailed)?;
        inner.pool.close(false).map_err(|_| Error::HeapCloseFailed)?;
        trace!(pool_id = self.pool_id, "heap closed");
        Ok(())
    }

    fn alloc_ptr(&self, size: u64) -> Option<GlobalPtr> {
        let inner = self.opened().ok()?;

        // Fast path: any shelf-heap we already own.
        {
            let owned = inner.read_owned();
            for (idx, heap) in owned.iter() {
                if let Some(offset) = heap.alloc(size) {
                    return Some(GlobalPtr::new(ShelfId::new(self.pool_id, *idx), offset));
                }
            }
        }

        // Slow path: grow the owned set.
        let mut owned = inner.write_owned();
        if owned.len() >= MAX_OWNED_HEAP {
            // Evict the longest-owned heap; it is the likeliest full.
            let evict = owned.keys().next().copied();
            if let Some(idx) = evict {
                if !inner.release_shelf_heap(&mut owned, idx) {
                    return None;
                }
            }
        }

        // An existing shelf someone released is the cheap option.
        if let Some(idx) = inner.acquire_shelf_heap(false) {
            match inner.open_shelf_heap(&mut owned, idx) {
                Ok(()) => {
                    if let Some(offset) = owned.get(&idx).and_then(|h| h.alloc(size)) {
                        return Some(GlobalPtr::new(ShelfId::new(self.pool_id, idx), offset));
                    }
                    // Full; hand it back.
                    inner.release_shelf_heap(&mut owned, idx);
                }
                Err(e) => {
                    warn!(shelf_idx = idx, error = %e, "open of acquired shelf heap failed");
                    inner.ownership.release(idx as usize);
                }
            }
        }

        // Last resort: a brand-new shelf.
        if let Some(idx) = inner.acquire_shelf_heap(true) {
            match inner.open_shelf_heap(&mut owned, idx) {
                Ok(()) => {
                    if let Some(offset) = owned.get(&idx).and_then(|h| h.alloc(size)) {
                        return Some(GlobalPtr::new(ShelfId::new(self.pool_id, idx), offset));
                    }
                    trace!(shelf_idx = idx, size, "fresh shelf heap could not serve the request");
                }
                Err(e) => {
                    warn!(shelf_idx = idx, error = %e, "open of new shelf heap failed");
                    inner.ownership.release(idx as usize);
                }
            }
        }

        None
    }

    fn free_ptr(&self, ptr: GlobalPtr) {
        let Ok(inner) = self.opened() else {
            error!("free on a closed heap");
            return;
        };
        if !ptr.is_valid() || ptr.shelf_id().pool_id() != self.pool_id {
            error!(%ptr, pool_id = self.pool_id, "free of a foreign pointer");
            return;
        }
        let idx = ptr.shelf_id().shelf_idx();

        {
            let owned = inner.read_owned();
            if let Some(heap) = owned.get(&idx) {
                heap.free(ptr.reserve_and_offset());
                return;
            }
        }

        // Remote free: park the pointer for the owner's cleaner.
        match inner.freelists.put(idx as usize, ptr) {
            Ok(()) => trace!(%ptr, "parked remote free"),
            Err(Error::FreelistFull) => {
                // Dropping the pointer would leak persistent memory with no
                // owner left to find it.
                error!(%ptr, "remote-free queue exhausted; aborting");
                std::process::abort();
            }
            Err(e) => error!(%ptr, error = %e, "remote free failed"),
        }
    }

    fn to_local(&self, ptr: GlobalPtr) -> Option<NonNull<u8>> {
        let inner = self.opened().ok()?;
        if !ptr.is_valid() || ptr.shelf_id().pool_id() != self.pool_id {
            return None;
        }
        let owned = inner.read_owned();
        let heap = owned.get(&ptr.shelf_id().shelf_idx())?;
        heap.offset_to_ptr(ptr.reserve_and_offset())
            .ok()
            .and_then(NonNull::new)
    }

    /// Number of shelf-heaps currently owned by this process.
    pub fn owned_count(&self) -> usize {
        self.inner
            .as_ref()
            .map(|inner| inner.read_owned().len())
            .unwrap_or(0)
    }
}

impl LifeCycle for DistHeap {
    fn exist(&self) -> bool {
        self.make_pool().map(|p| p.exist()).unwrap_or(false)
    }

    fn create(&mut self, size: u64) -> Result<()> {
        self.create_heap(size)
    }

    fn destroy(&mut self) -> Result<()> {
        self.destroy_heap()
    }

    fn open(&mut self) -> Result<()> {
        self.open_heap()
    }

    fn close(&mut self) -> Result<()> {
        self.close_heap()
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }
}

impl Heap for DistHeap {
    fn alloc(&self, size: u64) -> Option<GlobalPtr> {
        self.alloc_ptr(size)
    }

    fn free(&self, ptr: GlobalPtr) {
        self.free_ptr(ptr)
    }

    fn global_to_local(&self, ptr: GlobalPtr) -> Option<NonNull<u8>> {
        self.to_local(ptr)
    }
}

impl Drop for DistHeap {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close_heap();
        }
    }
}
