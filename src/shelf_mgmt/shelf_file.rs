//! A shelf file: a named, resizable, memory-mappable persistent file.
//!
//! Creation is exclusive and rename/unlink are atomic with respect to
//! crashes, which the pool layer leans on as durable commit points. Mapping
//! hands out [`ShelfMapping`], an RAII guard that unmaps on drop; callers
//! that need the mapping to outlive the guard (the memory manager's
//! `map_pointer`) take the pointer out with [`ShelfMapping::into_raw`].

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// A shelf file handle. Holds an open file descriptor between `open` and
/// `close`; mapping requires the file to be open.
#[derive(Debug)]
pub struct ShelfFile {
    path: PathBuf,
    fd: Option<OwnedFd>,
}

impl ShelfFile {
    /// Wrap a pathname. No filesystem access happens here.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fd: None,
        }
    }

    /// The pathname this handle refers to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a file exists at the path.
    pub fn exist(&self) -> bool {
        self.path.exists()
    }

    /// Whether this handle holds an open descriptor.
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Exclusively create the file and truncate it to `size`.
    ///
    /// Fails with [`Error::ShelfFileFound`] if any file exists at the path.
    /// The file is closed again on success.
    pub fn create(&self, size: u64) -> Result<()> {
        let fd = rustix::fs::open(
            &self.path,
            OFlags::RDWR | OFlags::CREATE | OFlags::EXCL,
            Mode::from_raw_mode(0o600),
        )
        .map_err(|e| {
            if e == rustix::io::Errno::EXIST {
                Error::ShelfFileFound
            } else {
                Error::System(e)
            }
        })?;
        rustix::fs::ftruncate(&fd, size)?;
        Ok(())
    }

    /// Unlink the file.
    pub fn destroy(&self) -> Result<()> {
        rustix::fs::unlink(&self.path).map_err(|e| {
            if e == rustix::io::Errno::NOENT {
                Error::ShelfFileNotFound
            } else {
                Error::System(e)
            }
        })
    }

    /// Open the file read-write.
    pub fn open(&mut self) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        let fd = rustix::fs::open(&self.path, OFlags::RDWR, Mode::empty()).map_err(|e| {
            if e == rustix::io::Errno::NOENT {
                Error::ShelfFileNotFound
            } else {
                Error::System(e)
            }
        })?;
        self.fd = Some(fd);
        Ok(())
    }

    /// Close the descriptor. Mappings created from it stay valid.
    pub fn close(&mut self) {
        self.fd = None;
    }

    /// Resize the file. Requires an open descriptor.
    pub fn truncate(&self, size: u64) -> Result<()> {
        let fd = self.fd.as_ref().ok_or(Error::ShelfFileNotFound)?;
        rustix::fs::ftruncate(fd, size)?;
        Ok(())
    }

    /// Persistent length of the file.
    pub fn size(&self) -> Result<u64> {
        match &self.fd {
            Some(fd) => Ok(rustix::fs::fstat(fd)?.st_size as u64),
            None => {
                let meta = std::fs::metadata(&self.path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        Error::ShelfFileNotFound
                    } else {
                        Error::Io(e)
                    }
                })?;
                Ok(meta.len())
            }
        }
    }

    /// Atomically rename the file; the handle follows the new name.
    ///
    /// A crash leaves either the old name or the new name, never both.
    pub fn rename(&mut self, new_path: impl Into<PathBuf>) -> Result<()> {
        let new_path = new_path.into();
        if !self.exist() {
            return Err(Error::ShelfFileNotFound);
        }
        rustix::fs::rename(&self.path, &new_path)?;
        self.path = new_path;
        Ok(())
    }

    /// Map `len` bytes at file offset `offset`, shared read-write.
    ///
    /// `offset` must be page-aligned. Multiple concurrent maps of the same
    /// shelf are allowed; each returns an independent process-private view.
    pub fn map(&self, offset: u64, len: usize) -> Result<ShelfMapping> {
        let fd = self.fd.as_ref().ok_or(Error::ShelfFileNotFound)?;
        // SAFETY: mapping a file descriptor we own; the kernel validates the
        // range and alignment.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                offset,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::ShelfFileInvalidFormat("mmap returned null".into()))?;
        Ok(ShelfMapping { ptr, len })
    }
}

/// A shared read-write mapping of (part of) a shelf file.
///
/// Synced and unmapped on drop.
pub struct ShelfMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl ShelfMapping {
    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Base address as `NonNull`.
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a live mapping).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Synchronously flush the mapped range to the backing file.
    pub fn sync(&self) -> Result<()> {
        // SAFETY: the range is a live mapping owned by self.
        unsafe {
            rustix::mm::msync(
                self.ptr.as_ptr().cast(),
                self.len,
                rustix::mm::MsyncFlags::SYNC,
            )?;
        }
        Ok(())
    }

    /// Release ownership of the mapping, returning its raw parts. The caller
    /// becomes responsible for unmapping via [`ShelfMapping::unmap_raw`].
    pub fn into_raw(self) -> (*mut u8, usize) {
        let parts = (self.ptr.as_ptr(), self.len);
        std::mem::forget(self);
        parts
    }

    /// Unmap a range previously released with [`ShelfMapping::into_raw`].
    ///
    /// # Safety
    ///
    /// `addr..addr+len` must be exactly a range returned by `into_raw` that
    /// has not been unmapped yet, with no live references into it.
    pub unsafe fn unmap_raw(addr: *mut u8, len: usize) -> Result<()> {
        // SAFETY: per the contract above.
        unsafe { rustix::mm::munmap(addr.cast(), len)? };
        Ok(())
    }
}

impl Drop for ShelfMapping {
    fn drop(&mut self) {
        let _ = self.sync();
        // SAFETY: we own the mapping and it has not been released.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is shared memory; concurrent access is governed by the
// atomic protocols of the structures laid out inside it, not by this handle.
unsafe impl Send for ShelfMapping {}
unsafe impl Sync for ShelfMapping {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shelf_in(dir: &TempDir, name: &str) -> ShelfFile {
        ShelfFile::new(dir.path().join(name))
    }

    #[test]
    fn test_create_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let shelf = shelf_in(&dir, "shelf");
        shelf.create(4096).unwrap();
        assert!(shelf.exist());
        assert!(matches!(shelf.create(4096), Err(Error::ShelfFileFound)));
        assert_eq!(shelf.size().unwrap(), 4096);
    }

    #[test]
    fn test_map_write_reopen_read() {
        let dir = TempDir::new().unwrap();
        let mut shelf = shelf_in(&dir, "shelf");
        shelf.create(4096).unwrap();
        shelf.open().unwrap();
        {
            let mapping = shelf.map(0, 4096).unwrap();
            // SAFETY: freshly mapped, exclusive in this test.
            unsafe { *mapping.as_ptr() = 0xab };
            mapping.sync().unwrap();
        }
        shelf.close();

        let mut reopened = shelf_in(&dir, "shelf");
        reopened.open().unwrap();
        let mapping = reopened.map(0, 4096).unwrap();
        assert_eq!(unsafe { *mapping.as_ptr() }, 0xab);
    }

    #[test]
    fn test_rename_moves_the_handle() {
        let dir = TempDir::new().unwrap();
        let mut shelf = shelf_in(&dir, "shelf_1_add");
        shelf.create(1024).unwrap();
        shelf.rename(dir.path().join("shelf_1")).unwrap();
        assert!(shelf.exist());
        assert!(!dir.path().join("shelf_1_add").exists());
        assert!(dir.path().join("shelf_1").exists());
    }

    #[test]
    fn test_destroy_missing_file() {
        let dir = TempDir::new().unwrap();
        let shelf = shelf_in(&dir, "nope");
        assert!(matches!(shelf.destroy(), Err(Error::ShelfFileNotFound)));
    }

    #[test]
    fn test_into_raw_and_unmap() {
        let dir = TempDir::new().unwrap();
        let mut shelf = shelf_in(&dir, "shelf");
        shelf.create(8192).unwrap();
        shelf.open().unwrap();
        let (addr, len) = shelf.map(0, 8192).unwrap().into_raw();
        unsafe {
            *addr = 7;
            ShelfMapping::unmap_raw(addr, len).unwrap();
        }
    }
}
