//! A pool: a versioned collection of shelf files sharing one pool id.
//!
//! Per pool there is one private *metadata shelf* (stored as shelf
//! `(0, pool_id)` of the reserved metadata pool) holding the configured
//! shelf size, the membership table, and a trailing shared area that
//! downstream users lay out for their own persistent metadata.
//!
//! Shelf creation and destruction are made crash-safe without any
//! cross-process lock by combining the membership table's versioned slots
//! with versioned file names: renaming the transient `_add` file to the
//! committed name is the durable commit of an add, unlinking the committed
//! name is the durable commit of a removal, and [`Pool::recover`] reconciles
//! whatever a crash left behind. Per slot:
//!
//! ```text
//!   (0,0) ── get_free_slot ──▶ (0,v) ── rename + mark_slot_used ──▶ (1,v)
//!     ▲                          │                                    │
//!     │                          │ crash: file `_add`/`v` on disk     │
//!     │                          ▼                                    │
//!     │                    (recover deletes)                          │
//!     └──────── mark_slot_free + unlink(file v) ◀── remove_shelf ─────┘
//! ```

use crate::config::{Config, CACHE_LINE_SIZE, MAX_POOL_COUNT, MAX_SHELF_COUNT, METADATA_SHELF_SIZE};
use crate::error::{Error, Result};
use crate::fam;
use crate::global_ptr::{PoolId, ShelfId, ShelfIndex};
use crate::shelf_mgmt::membership::Membership;
use crate::shelf_mgmt::shelf_file::{ShelfFile, ShelfMapping};
use crate::shelf_mgmt::shelf_name::ShelfName;
use rand::Rng;
use std::path::PathBuf;
use std::ptr::NonNull;
use tracing::{trace, warn};

/// Pool id reserved for system-wide metadata; the metadata shelf of pool
/// `p` is shelf `(0, p)`.
pub const METADATA_POOL_ID: PoolId = 0;

/// Formats a not-yet-committed shelf file. Called after the transient file
/// is created but before its slot is armed, so exactly one process formats
/// each shelf and no reader can observe a half-formatted one. Must tolerate
/// the file disappearing underneath it (a concurrent recovery may delete
/// transient files).
pub type FormatFn<'a> = &'a (dyn Fn(&ShelfFile, u64) -> Result<()> + Send + Sync);

/// Truncate-only format, used when the shelf carries no allocator.
pub fn default_format(shelf: &ShelfFile, shelf_size: u64) -> Result<()> {
    let mut file = ShelfFile::new(shelf.path());
    file.open()?;
    file.truncate(shelf_size)?;
    Ok(())
}

struct OpenState {
    mapping: ShelfMapping,
    membership: Membership,
    shelf_size: u64,
}

/// A handle on one pool. Not internally locked: callers serialize open and
/// close; everything in between is safe under shared references because the
/// persistent state is only touched through atomics and atomic file
/// operations.
pub struct Pool {
    pool_id: PoolId,
    shelf_name: ShelfName,
    metadata_path: PathBuf,
    state: Option<OpenState>,
}

impl Pool {
    /// Create a handle for `pool_id` under the given configuration.
    pub fn new(pool_id: PoolId, config: &Config) -> Result<Self> {
        if (pool_id as usize) >= MAX_POOL_COUNT {
            return Err(Error::PoolInvalidPoolId);
        }
        let shelf_name = ShelfName::new(config);
        let metadata_path = shelf_name.path(ShelfId::new(METADATA_POOL_ID, pool_id));
        Ok(Self {
            pool_id,
            shelf_name,
            metadata_path,
            state: None,
        })
    }

    /// This pool's id.
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Maximum number of shelves in the pool.
    pub fn size(&self) -> usize {
        MAX_SHELF_COUNT
    }

    /// Whether the pool's metadata shelf exists.
    pub fn exist(&self) -> bool {
        ShelfFile::new(&self.metadata_path).exist()
    }

    /// Whether this handle is open.
    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn opened(&self) -> Result<&OpenState> {
        self.state.as_ref().ok_or(Error::PoolClosed)
    }

    fn map_metadata(&self) -> Result<ShelfMapping> {
        let mut file = ShelfFile::new(&self.metadata_path);
        file.open()?;
        let size = file.size()? as usize;
        file.map(0, size)
    }

    /// Create the pool: its metadata shelf, the configured shelf size, and
    /// an empty membership table.
    pub fn create(&self, shelf_size: u64) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        if self.exist() {
            return Err(Error::PoolFound);
        }
        std::fs::create_dir_all(self.shelf_name.base_dir())?;

        let metadata = ShelfFile::new(&self.metadata_path);
        match metadata.create(METADATA_SHELF_SIZE) {
            Ok(()) => {}
            Err(Error::ShelfFileFound) => return Err(Error::PoolFound),
            Err(e) => return Err(e),
        }

        let mapping = self.map_metadata()?;
        let addr = mapping.as_ptr();
        // SAFETY: the metadata shelf is freshly created and mapped; offset 0
        // is the cache-line holding the configured shelf size.
        unsafe {
            fam::u64_write(addr, shelf_size);
            fam::persist(addr, 8);
            let table_addr = NonNull::new_unchecked(addr.add(CACHE_LINE_SIZE));
            Membership::create(
                table_addr,
                mapping.len() - CACHE_LINE_SIZE,
                MAX_SHELF_COUNT,
            )?;
        }
        trace!(pool_id = self.pool_id, shelf_size, "pool created");
        Ok(())
    }

    /// Destroy the pool: remove every shelf, scrub the membership table,
    /// and unlink the metadata shelf.
    pub fn destroy(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        if !self.exist() {
            return Err(Error::PoolNotFound);
        }

        self.open(false)?;
        if let Err(e) = self.recover() {
            warn!(pool_id = self.pool_id, error = %e, "inconsistency while destroying pool");
        }
        for shelf_idx in 0..self.size() {
            if self.check_shelf(shelf_idx as ShelfIndex)? {
                self.remove_shelf(shelf_idx as ShelfIndex)?;
            }
        }
        self.close(false)?;

        let mapping = self.map_metadata()?;
        let addr = mapping.as_ptr();
        // SAFETY: the metadata shelf is mapped and no handle is open on it.
        unsafe {
            fam::u64_write(addr, 0);
            let table_addr = NonNull::new_unchecked(addr.add(CACHE_LINE_SIZE));
            Membership::destroy(table_addr)?;
        }
        drop(mapping);

        ShelfFile::new(&self.metadata_path).destroy()?;
        trace!(pool_id = self.pool_id, "pool destroyed");
        Ok(())
    }

    /// Check that the metadata shelf carries a valid membership table,
    /// without opening the pool.
    pub fn verify(&self) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        if !self.exist() {
            return Err(Error::PoolNotFound);
        }
        let mapping = self.map_metadata()?;
        // SAFETY: metadata shelf mapped; table starts one cache line in.
        let ok = unsafe {
            Membership::verify(NonNull::new_unchecked(
                mapping.as_ptr().add(CACHE_LINE_SIZE),
            ))
        };
        if ok {
            Ok(())
        } else {
            Err(Error::ShelfFileInvalidFormat(
                "membership magic number mismatch".to_string(),
            ))
        }
    }

    /// Open the pool; optionally run recovery immediately after.
    pub fn open(&mut self, recover: bool) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        if !self.exist() {
            return Err(Error::PoolNotFound);
        }

        let mapping = self.map_metadata()?;
        let addr = mapping.as_ptr();
        // SAFETY: metadata shelf mapped for the lifetime of the state we
        // stash it in; the membership handle never outlives the mapping.
        let (shelf_size, membership) = unsafe {
            let shelf_size = fam::u64_read(addr);
            let table_addr = NonNull::new_unchecked(addr.add(CACHE_LINE_SIZE));
            let membership = Membership::open(table_addr, mapping.len() - CACHE_LINE_SIZE)
                .map_err(|e| {
                    warn!(pool_id = self.pool_id, error = %e, "pool open failed");
                    e
                })?;
            (shelf_size, membership)
        };
        self.state = Some(OpenState {
            mapping,
            membership,
            shelf_size,
        });

        if recover {
            if let Err(e) = self.recover() {
                warn!(pool_id = self.pool_id, error = %e, "inconsistency found on open");
            }
        }
        Ok(())
    }

    /// Close the pool; optionally run recovery first.
    pub fn close(&mut self, recover: bool) -> Result<()> {
        if !self.is_open() {
            return Err(Error::PoolClosed);
        }
        if recover {
            if let Err(e) = self.recover() {
                warn!(pool_id = self.pool_id, error = %e, "inconsistency found on close");
            }
        }
        self.state = None;
        Ok(())
    }

    /// The per-shelf size configured at creation.
    pub fn shelf_size(&self) -> Result<u64> {
        Ok(self.opened()?.shelf_size)
    }

    /// Base address and size of the shared area following the membership
    /// table, for downstream persistent metadata.
    pub fn shared_area(&self) -> Result<(NonNull<u8>, usize)> {
        let state = self.opened()?;
        let used = CACHE_LINE_SIZE + state.membership.size();
        // SAFETY: `used` is within the mapping by construction.
        let addr = unsafe { NonNull::new_unchecked(state.mapping.as_ptr().add(used)) };
        Ok((addr, state.mapping.len() - used))
    }

    /// Reconcile on-disk shelf files with the membership table.
    ///
    /// Deletes transient `_add` files and files whose version is older than
    /// the slot's; when a slot is free but its current-version file still
    /// exists (a crashed removal, or an add that never armed the slot), the
    /// file is deleted as well. Returns [`Error::PoolInconsistencyFound`]
    /// when any state explainable only by a crash or an in-flight operation
    /// was observed; the error is informational and a second run that
    /// observes nothing new returns `Ok`.
    pub fn recover(&self) -> Result<()> {
        let state = self.opened()?;
        let mut inconsistent = false;

        for entry in std::fs::read_dir(self.shelf_name.base_dir())? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((shelf_idx, version, is_transient)) =
                self.shelf_name.parse_any(self.pool_id, name)
            else {
                continue;
            };
            let value = state.membership.slot(shelf_idx as usize);
            let valid = crate::shelf_mgmt::membership::test_valid(value);
            let current = crate::shelf_mgmt::membership::version_of(value);

            let stale = if is_transient {
                // An in-flight add that never renamed.
                true
            } else if valid {
                version < current
            } else {
                // A free slot owns no file; the current version lingering
                // means a removal or an unarmed add crashed mid-way.
                if version == current && current > 0 {
                    inconsistent = true;
                    trace!(
                        pool_id = self.pool_id,
                        shelf_idx,
                        version,
                        "recover: slot free but committed file present"
                    );
                }
                version <= current
            };
            if stale {
                trace!(pool_id = self.pool_id, shelf_idx, version, is_transient, "recover: deleting stale file");
                let _ = std::fs::remove_file(entry.path());
            }
        }

        for shelf_idx in 0..state.membership.count() {
            let value = state.membership.slot(shelf_idx);
            if crate::shelf_mgmt::membership::test_valid(value) {
                let version = crate::shelf_mgmt::membership::version_of(value);
                let path = self
                    .shelf_name
                    .versioned_path(ShelfId::new(self.pool_id, shelf_idx as ShelfIndex), version);
                if !path.exists() {
                    // An add armed the slot but recovery raced the rename,
                    // or the add is still in flight.
                    inconsistent = true;
                    trace!(
                        pool_id = self.pool_id,
                        shelf_idx,
                        version,
                        "recover: slot valid but committed file missing"
                    );
                }
            }
        }

        if inconsistent {
            Err(Error::PoolInconsistencyFound)
        } else {
            Ok(())
        }
    }

    /// Add a shelf at any free slot, starting the search at slot 0.
    pub fn new_shelf(&self, format: FormatFn<'_>) -> Result<ShelfIndex> {
        self.add_shelf(0, format, true)
    }

    /// Add a shelf, preferring slot `shelf_idx`.
    ///
    /// The new shelf is created as a transient file under a random version,
    /// formatted while unreachable, then committed by rename plus the
    /// membership two-phase acquire. With `reassign`, a lost race moves on
    /// to the next free slot; without it, only the given slot is attempted.
    /// Returns the slot actually assigned.
    pub fn add_shelf(
        &self,
        shelf_idx: ShelfIndex,
        format: FormatFn<'_>,
        reassign: bool,
    ) -> Result<ShelfIndex> {
        let state = self.opened()?;

        // Create the transient file, retrying version collisions.
        let shelf_id = ShelfId::new(self.pool_id, shelf_idx);
        let mut rng = rand::thread_rng();
        let mut shelf = loop {
            let tmp_version: u16 = rng.gen_range(1..=0x7fff);
            let shelf = ShelfFile::new(self.shelf_name.transient_path(shelf_id, tmp_version));
            match shelf.create(0) {
                Ok(()) => break shelf,
                Err(Error::ShelfFileFound) => continue,
                Err(e) => {
                    warn!(pool_id = self.pool_id, shelf_idx, error = %e, "add_shelf: create failed");
                    return Err(Error::PoolAddShelfFailed);
                }
            }
        };

        if let Err(e) = format(&shelf, state.shelf_size) {
            warn!(pool_id = self.pool_id, shelf_idx, error = %e, "add_shelf: format failed");
            let _ = shelf.destroy();
            return Err(Error::PoolAddShelfFailed);
        }

        let count = state.membership.count();
        let candidates: Box<dyn Iterator<Item = usize>> = if reassign {
            Box::new((shelf_idx as usize..count).chain(0..shelf_idx as usize))
        } else {
            Box::new(std::iter::once(shelf_idx as usize))
        };

        for candidate in candidates {
            if state.membership.test_valid_bit(candidate) {
                continue;
            }
            match self.try_commit_shelf(state, candidate, &mut shelf) {
                CommitOutcome::Committed => {
                    trace!(pool_id = self.pool_id, shelf_idx = candidate, "add_shelf succeeded");
                    return Ok(candidate as ShelfIndex);
                }
                CommitOutcome::LostRace => continue,
                CommitOutcome::Aborted => break,
            }
        }

        let _ = shelf.destroy();
        trace!(pool_id = self.pool_id, shelf_idx, "add_shelf: no slot could be assigned");
        Err(Error::PoolAddShelfFailed)
    }

    fn try_commit_shelf(
        &self,
        state: &OpenState,
        candidate: usize,
        shelf: &mut ShelfFile,
    ) -> CommitOutcome {
        let Some(expected) = state.membership.get_free_slot(candidate) else {
            return CommitOutcome::LostRace;
        };
        let version = crate::shelf_mgmt::membership::version_of(expected);
        let shelf_id = ShelfId::new(self.pool_id, candidate as ShelfIndex);
        let committed = self.shelf_name.versioned_path(shelf_id, version);

        if shelf.rename(&committed).is_err() {
            // The transient file vanished: a concurrent recovery deleted it.
            trace!(pool_id = self.pool_id, candidate, "add_shelf: rename lost to recovery");
            return CommitOutcome::Aborted;
        }

        if !state.membership.mark_slot_used(candidate, expected) {
            return CommitOutcome::LostRace;
        }

        // A recovery running between the rename and the arm may have deleted
        // the committed file under the free-looking slot; roll back rather
        // than publish a shelf with no backing file.
        if !shelf.exist() {
            trace!(pool_id = self.pool_id, candidate, "add_shelf: committed file lost to recovery");
            let _ = state.membership.mark_slot_free(candidate);
            return CommitOutcome::Aborted;
        }
        CommitOutcome::Committed
    }

    /// Remove the shelf at `shelf_idx` and delete its file.
    ///
    /// The caller must ensure no one is using the shelf.
    pub fn remove_shelf(&self, shelf_idx: ShelfIndex) -> Result<()> {
        let state = self.opened()?;
        match state.membership.mark_slot_free(shelf_idx as usize) {
            Some(old) => {
                let version = crate::shelf_mgmt::membership::version_of(old);
                let path = self
                    .shelf_name
                    .versioned_path(ShelfId::new(self.pool_id, shelf_idx), version);
                match ShelfFile::new(path).destroy() {
                    Ok(()) => {}
                    Err(Error::ShelfFileNotFound) => {
                        // A concurrent recovery already retired the file.
                        trace!(pool_id = self.pool_id, shelf_idx, "remove_shelf: file already gone");
                    }
                    Err(e) => return Err(e),
                }
                trace!(pool_id = self.pool_id, shelf_idx, version, "remove_shelf succeeded");
                Ok(())
            }
            None => {
                if state.membership.test_valid_bit(shelf_idx as usize) {
                    // Someone re-versioned the slot under us.
                    Err(Error::PoolRemoveShelfFailed)
                } else {
                    Err(Error::PoolShelfNotFound)
                }
            }
        }
    }

    /// Next member shelf in `start..=end` (inclusive; `end < start` wraps).
    pub fn find_next_shelf(&self, start: ShelfIndex, end: ShelfIndex) -> Result<Option<ShelfIndex>> {
        let state = self.opened()?;
        Ok(state
            .membership
            .find_first_used_slot(start as usize, end as usize)
            .map(|i| i as ShelfIndex))
    }

    /// Whether `shelf_idx` is a member of the pool.
    pub fn check_shelf(&self, shelf_idx: ShelfIndex) -> Result<bool> {
        Ok(self.opened()?.membership.test_valid_bit(shelf_idx as usize))
    }

    /// Shelf id of a member shelf.
    pub fn shelf_id(&self, shelf_idx: ShelfIndex) -> Result<ShelfId> {
        if self.check_shelf(shelf_idx)? {
            Ok(ShelfId::new(self.pool_id, shelf_idx))
        } else {
            Err(Error::PoolShelfNotFound)
        }
    }

    /// Decode the shelf index out of a shelf id belonging to this pool.
    pub fn shelf_idx(&self, shelf_id: ShelfId) -> Result<ShelfIndex> {
        if shelf_id.pool_id() != self.pool_id {
            return Err(Error::PoolInvalidPoolId);
        }
        let idx = shelf_id.shelf_idx();
        if self.check_shelf(idx)? {
            Ok(idx)
        } else {
            Err(Error::PoolShelfNotFound)
        }
    }

    /// Pathname of a member shelf's committed file.
    pub fn shelf_path(&self, shelf_idx: ShelfIndex) -> Result<PathBuf> {
        let state = self.opened()?;
        match state.membership.get_used_slot(shelf_idx as usize) {
            Some(value) => {
                let version = crate::shelf_mgmt::membership::version_of(value);
                Ok(self
                    .shelf_name
                    .versioned_path(ShelfId::new(self.pool_id, shelf_idx), version))
            }
            None => Err(Error::PoolShelfNotFound),
        }
    }
}

enum CommitOutcome {
    Committed,
    LostRace,
    Aborted,
}
