//! One shelf formatted as a raw contiguous region.
//!
//! The region is the heap's sibling presentation of a pool: no allocator,
//! just a magic-stamped header line followed by user-addressable bytes.

use crate::config::CACHE_LINE_SIZE;
use crate::error::{Error, Result};
use crate::fam;
use crate::shelf_mgmt::shelf_file::{ShelfFile, ShelfMapping};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

const REGION_MAGIC: u64 = 0x6661_6d72_6567_6e31; // "famregn1"

/// An opened shelf region: the whole shelf mapped, minus the header line.
pub struct ShelfRegion {
    path: PathBuf,
    mapping: ShelfMapping,
}

impl ShelfRegion {
    /// Format a (not yet committed) shelf file as a region. Used as the
    /// pool's format callback.
    pub fn create(shelf: &ShelfFile, shelf_size: u64) -> Result<()> {
        if shelf_size <= CACHE_LINE_SIZE as u64 {
            return Err(Error::ShelfFileInvalidFormat(
                "region shelf too small for its header".to_string(),
            ));
        }
        let mut file = ShelfFile::new(shelf.path());
        file.open()?;
        file.truncate(shelf_size)?;
        let mapping = file.map(0, shelf_size as usize)?;
        // SAFETY: freshly truncated and unreachable by other processes.
        unsafe { fam::u64_write(mapping.as_ptr(), REGION_MAGIC) };
        fam::persist(mapping.as_ptr(), 8);
        mapping.sync()?;
        Ok(())
    }

    /// Map a committed region shelf.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = ShelfFile::new(&path);
        file.open()?;
        let size = file.size()? as usize;
        let mapping = file.map(0, size)?;
        // SAFETY: the mapping covers at least the header line.
        let magic = unsafe { fam::u64_read(mapping.as_ptr()) };
        if magic != REGION_MAGIC {
            return Err(Error::ShelfFileInvalidFormat(format!(
                "region magic mismatch: {:#x}",
                magic
            )));
        }
        Ok(Self { path, mapping })
    }

    /// Scrub the magic so the shelf no longer opens as a region.
    pub fn invalidate(&self) {
        // SAFETY: header line of a live mapping.
        unsafe { fam::u64_write(self.mapping.as_ptr(), 0) };
        fam::persist(self.mapping.as_ptr(), 8);
    }

    /// Base of the user-addressable bytes.
    pub fn base(&self) -> NonNull<u8> {
        // SAFETY: one header line into a mapping larger than it.
        unsafe { NonNull::new_unchecked(self.mapping.as_ptr().add(CACHE_LINE_SIZE)) }
    }

    /// User-addressable size.
    pub fn len(&self) -> usize {
        self.mapping.len() - CACHE_LINE_SIZE
    }

    /// Whether the usable area is empty (never for a valid region).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush the region to its backing file.
    pub fn sync(&self) -> Result<()> {
        self.mapping.sync()
    }

    /// The backing path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
