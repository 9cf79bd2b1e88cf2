//! One shelf formatted as a zone heap.
//!
//! The shelf-heap is the unit of ownership in the distributed heap: exactly
//! one process at a time holds the lease that lets it allocate in-line from
//! this shelf. The zone header's owner heartbeat, refreshed by the owner's
//! background cleaner, is what lets surviving peers decide that a crashed
//! owner is gone and recover the shelf for reuse.

use crate::config::{HEARTBEAT_TIMEOUT_US, ZONE_MIN_OBJECT_SIZE};
use crate::error::{Error, Result};
use crate::global_ptr::{Offset, ShelfId};
use crate::shelf_mgmt::shelf_file::{ShelfFile, ShelfMapping};
use crate::shelf_usage::zone::Zone;
use std::path::{Path, PathBuf};
use tracing::trace;

struct HeapState {
    mapping: ShelfMapping,
    zone: Zone,
}

/// A per-shelf heap instance backed by the zone allocator.
pub struct ShelfHeap {
    shelf_id: ShelfId,
    path: PathBuf,
    state: Option<HeapState>,
}

impl ShelfHeap {
    /// Wrap a committed shelf path. Nothing is opened yet.
    pub fn new(path: impl Into<PathBuf>, shelf_id: ShelfId) -> Self {
        Self {
            shelf_id,
            path: path.into(),
            state: None,
        }
    }

    /// The shelf this heap lives on.
    pub fn shelf_id(&self) -> ShelfId {
        self.shelf_id
    }

    /// Format a (not yet committed) shelf file as a zone heap. Used as the
    /// pool's format callback, so it runs while no other process can reach
    /// the file.
    ///
    /// The file is truncated to `shelf_size` up front; the zone starts at
    /// one eighth of it and grows in place.
    pub fn create(shelf: &ShelfFile, shelf_size: u64) -> Result<()> {
        if !shelf_size.is_power_of_two() {
            return Err(Error::ShelfFileInvalidFormat(format!(
                "shelf size {} is not a power of two",
                shelf_size
            )));
        }
        let mut file = ShelfFile::new(shelf.path());
        file.open()?;
        file.truncate(shelf_size)?;
        let mapping = file.map(0, shelf_size as usize)?;
        let initial = (shelf_size / 8).max(ZONE_MIN_OBJECT_SIZE);
        // SAFETY: a freshly truncated file maps as zeroes and nobody else
        // can see it before the pool commits the rename.
        unsafe {
            Zone::create(
                mapping.as_non_null(),
                initial,
                ZONE_MIN_OBJECT_SIZE,
                shelf_size,
            )?;
        }
        mapping.sync()?;
        trace!(shelf = %shelf.path().display(), shelf_size, "shelf heap formatted");
        Ok(())
    }

    /// Whether this handle is open.
    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Map the shelf and open its zone.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let mut file = ShelfFile::new(&self.path);
        file.open()?;
        let size = file.size()? as usize;
        let mapping = file.map(0, size)?;
        // SAFETY: the mapping lives in the same state struct as the zone
        // handle and outlives it.
        let zone = unsafe { Zone::open(mapping.as_non_null())? };
        self.state = Some(HeapState { mapping, zone });
        Ok(())
    }

    /// Unmap the shelf.
    pub fn close(&mut self) {
        self.state = None;
    }

    /// Scrub the zone magic so the shelf no longer opens as a heap. Called
    /// just before the pool unlinks the shelf.
    pub fn destroy(&mut self) -> Result<()> {
        self.open()?;
        if let Some(state) = &self.state {
            state.zone.invalidate();
        }
        self.close();
        Ok(())
    }

    fn opened(&self) -> Result<&HeapState> {
        self.state.as_ref().ok_or(Error::HeapOpenFailed)
    }

    /// Bytes of the backing shelf.
    pub fn size(&self) -> Result<usize> {
        Ok(self.opened()?.mapping.len())
    }

    /// Allocate `size` bytes; the returned offset carries the zone level in
    /// its reserve byte. `None` when the shelf is full.
    pub fn alloc(&self, size: u64) -> Option<Offset> {
        self.state.as_ref()?.zone.alloc(size)
    }

    /// Free an offset previously returned by [`ShelfHeap::alloc`].
    pub fn free(&self, offset: Offset) {
        if let Some(state) = &self.state {
            state.zone.free(offset);
        }
    }

    /// Whether `offset` points into this shelf's zone.
    pub fn is_valid_offset(&self, offset: Offset) -> bool {
        self.state
            .as_ref()
            .map(|s| s.zone.is_valid_offset(offset))
            .unwrap_or(false)
    }

    /// Translate an offset to a process-local address.
    pub fn offset_to_ptr(&self, offset: Offset) -> Result<*mut u8> {
        let state = self.opened()?;
        if !state.zone.is_valid_offset(offset) {
            return Err(Error::InvalidPtr);
        }
        // SAFETY: validated against the zone bounds; mapping is live.
        Ok(unsafe { state.zone.offset_to_ptr(offset) })
    }

    /// Refresh the owner heartbeat.
    pub fn touch_heartbeat(&self) {
        if let Some(state) = &self.state {
            state.zone.touch_heartbeat();
        }
    }

    /// Recover an orphaned shelf-heap.
    ///
    /// Succeeds only when the owner heartbeat has gone stale; then clears
    /// any latches and completes interrupted maintenance, after which the
    /// ownership lease may be revoked. [`Error::OwnerAlive`] means the
    /// holder is still heartbeating.
    pub fn recover(&self) -> Result<()> {
        let state = self.opened()?;
        if !state.zone.heartbeat_stale(HEARTBEAT_TIMEOUT_US) {
            return Err(Error::OwnerAlive);
        }
        state.zone.recover();
        trace!(shelf_id = %self.shelf_id, "shelf heap recovered");
        Ok(())
    }

    /// The backing path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
