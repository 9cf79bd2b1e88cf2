//! A pool presented as one contiguous region.
//!
//! The pool carries exactly one shelf (index 0), formatted as a
//! [`ShelfRegion`] at creation. Open maps the whole shelf;
//! [`PoolRegion::map_range`] additionally offers page-aligned sub-mappings
//! for callers that only want a window.

use crate::allocator::{LifeCycle, Region};
use crate::config::{Config, CACHE_LINE_SIZE};
use crate::error::{Error, Result};
use crate::global_ptr::{PoolId, ShelfIndex};
use crate::shelf_mgmt::pool::Pool;
use crate::shelf_mgmt::shelf_file::{ShelfFile, ShelfMapping};
use crate::shelf_usage::shelf_region::ShelfRegion;
use std::ptr::NonNull;
use tracing::{trace, warn};

/// The single shelf a region pool carries.
const REGION_SHELF_IDX: ShelfIndex = 0;

struct RegionState {
    pool: Pool,
    region: ShelfRegion,
}

/// A pool region handle.
pub struct PoolRegion {
    pool_id: PoolId,
    config: Config,
    state: Option<RegionState>,
}

impl PoolRegion {
    /// Create a handle for the region over pool `pool_id`.
    pub fn new(pool_id: PoolId, config: Config) -> Result<Self> {
        if pool_id == 0 {
            return Err(Error::PoolInvalidPoolId);
        }
        Ok(Self {
            pool_id,
            config,
            state: None,
        })
    }

    /// The pool this region presents.
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    fn make_pool(&self) -> Result<Pool> {
        Pool::new(self.pool_id, &self.config)
    }

    fn opened(&self) -> Result<&RegionState> {
        self.state.as_ref().ok_or(Error::PoolClosed)
    }

    fn create_region(&self, size: u64) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        let mut pool = self.make_pool()?;
        if pool.exist() {
            return Err(Error::PoolFound);
        }
        match pool.create(size) {
            Ok(()) => {}
            Err(Error::PoolFound) => return Err(Error::PoolFound),
            Err(e) => {
                warn!(pool_id = self.pool_id, error = %e, "region pool create failed");
                return Err(Error::RegionCreateFailed);
            }
        }
        let result = (|| -> Result<()> {
            pool.open(false)?;
            pool.add_shelf(REGION_SHELF_IDX, &ShelfRegion::create, false)?;
            pool.close(false)?;
            Ok(())
        })();
        result.map_err(|e| {
            warn!(pool_id = self.pool_id, error = %e, "region shelf create failed");
            Error::RegionCreateFailed
        })
    }

    fn destroy_region(&self) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        let mut pool = self.make_pool()?;
        if !pool.exist() {
            return Err(Error::PoolNotFound);
        }
        pool.open(false)?;
        if let Err(e) = pool.recover() {
            warn!(pool_id = self.pool_id, error = %e, "inconsistency while destroying region");
        }
        if pool.check_shelf(REGION_SHELF_IDX)? {
            if let Ok(path) = pool.shelf_path(REGION_SHELF_IDX) {
                if let Ok(region) = ShelfRegion::open(path) {
                    region.invalidate();
                }
            }
            pool.remove_shelf(REGION_SHELF_IDX)?;
        }
        pool.close(false)?;
        pool.destroy()?;
        trace!(pool_id = self.pool_id, "region destroyed");
        Ok(())
    }

    fn open_region(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::PoolOpened);
        }
        let mut pool = self.make_pool()?;
        pool.open(false).map_err(|e| {
            warn!(pool_id = self.pool_id, error = %e, "region open failed");
            Error::RegionOpenFailed
        })?;
        let path = pool.shelf_path(REGION_SHELF_IDX).map_err(|e| {
            let _ = pool.close(false);
            warn!(pool_id = self.pool_id, error = %e, "region shelf missing");
            Error::RegionOpenFailed
        })?;
        let region = ShelfRegion::open(path).map_err(|e| {
            let _ = pool.close(false);
            warn!(pool_id = self.pool_id, error = %e, "region shelf invalid");
            Error::RegionOpenFailed
        })?;
        self.state = Some(RegionState { pool, region });
        Ok(())
    }

    fn close_region(&mut self) -> Result<()> {
        let mut state = self.state.take().ok_or(Error::PoolClosed)?;
        state.region.sync()?;
        drop(state.region);
        state.pool.close(false)?;
        Ok(())
    }

    /// Map a page-aligned window over `[offset, offset + len)` of the
    /// region's usable bytes, independent of the full-region mapping.
    pub fn map_range(&self, offset: u64, len: usize) -> Result<RegionMapping> {
        let state = self.opened()?;
        if offset + len as u64 > state.region.len() as u64 {
            return Err(Error::InvalidPtr);
        }
        let file_offset = offset + CACHE_LINE_SIZE as u64;
        let page_size = rustix::param::page_size() as u64;
        let aligned_start = file_offset - file_offset % page_size;
        let aligned_end = (file_offset + len as u64).div_ceil(page_size) * page_size;

        let mut file = ShelfFile::new(state.region.path());
        file.open()?;
        let mapping = file.map(aligned_start, (aligned_end - aligned_start) as usize)?;
        Ok(RegionMapping {
            mapping,
            adjust: (file_offset - aligned_start) as usize,
        })
    }
}

/// A sub-mapping of a region, unmapped on drop.
pub struct RegionMapping {
    mapping: ShelfMapping,
    adjust: usize,
}

impl RegionMapping {
    /// Address of the first requested byte.
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: adjust < page_size <= mapping length.
        unsafe { self.mapping.as_ptr().add(self.adjust) }
    }

    /// Flush the window to the backing file.
    pub fn sync(&self) -> Result<()> {
        self.mapping.sync()
    }
}

impl LifeCycle for PoolRegion {
    fn exist(&self) -> bool {
        self.make_pool().map(|p| p.exist()).unwrap_or(false)
    }

    fn create(&mut self, size: u64) -> Result<()> {
        self.create_region(size)
    }

    fn destroy(&mut self) -> Result<()> {
        self.destroy_region()
    }

    fn open(&mut self) -> Result<()> {
        self.open_region()
    }

    fn close(&mut self) -> Result<()> {
        self.close_region()
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }
}

impl Region for PoolRegion {
    fn size(&self) -> Result<u64> {
        Ok(self.opened()?.region.len() as u64)
    }

    fn base(&self) -> Result<NonNull<u8>> {
        Ok(self.opened()?.region.base())
    }
}
