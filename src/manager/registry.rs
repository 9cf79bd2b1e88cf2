//! Process-local shelf base registry.
//!
//! Translating a global pointer costs a pool open, a path lookup, and an
//! mmap the first time a shelf is touched; the registry caches the mapping
//! base so every later translation is a hash lookup and an add. Mappings
//! live until the registry (normally the process) goes away.

use crate::error::{Error, Result};
use crate::global_ptr::ShelfId;
use crate::shelf_mgmt::shelf_file::{ShelfFile, ShelfMapping};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

#[derive(Clone, Copy)]
struct Entry {
    base: usize,
    len: usize,
}

/// Cache of shelf-id → mapped base address for this process.
pub struct ShelfRegistry {
    shelves: Mutex<HashMap<ShelfId, Entry>>,
}

impl ShelfRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            shelves: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<ShelfId, Entry>> {
        self.shelves.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Base address of `shelf_id` if it is already mapped here.
    pub fn find_base(&self, shelf_id: ShelfId) -> Option<*mut u8> {
        self.entries().get(&shelf_id).map(|e| e.base as *mut u8)
    }

    /// Map the whole shelf at `path` and remember its base. Idempotent per
    /// shelf id.
    pub fn map_and_register(&self, path: &Path, shelf_id: ShelfId) -> Result<*mut u8> {
        let mut entries = self.entries();
        if let Some(entry) = entries.get(&shelf_id) {
            return Ok(entry.base as *mut u8);
        }
        let mut file = ShelfFile::new(path);
        file.open()?;
        let size = file.size()? as usize;
        let (base, len) = file.map(0, size)?.into_raw();
        entries.insert(
            shelf_id,
            Entry {
                base: base as usize,
                len,
            },
        );
        Ok(base)
    }

    /// Reverse lookup: which registered shelf contains `addr`?
    pub fn find_shelf(&self, addr: *const u8) -> Result<(ShelfId, *mut u8)> {
        let addr = addr as usize;
        let entries = self.entries();
        for (shelf_id, entry) in entries.iter() {
            if addr >= entry.base && addr < entry.base + entry.len {
                return Ok((*shelf_id, entry.base as *mut u8));
            }
        }
        Err(Error::InvalidPtr)
    }
}

impl Default for ShelfRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShelfRegistry {
    fn drop(&mut self) {
        for entry in self.entries().values() {
            // SAFETY: each entry came from into_raw and is unmapped once.
            let _ = unsafe { ShelfMapping::unmap_raw(entry.base as *mut u8, entry.len) };
        }
    }
}
