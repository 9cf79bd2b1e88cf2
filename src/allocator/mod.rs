//! The user-facing allocators: a pool presented as a variable-size heap or
//! as one contiguous region.
//!
//! Both share the same lifecycle surface; which presentation a pool gets is
//! the creator's choice and is not recorded in the pool metadata (each
//! presentation stamps its own magic into the shelves it formats, so
//! cross-use fails at open).

pub mod dist_heap;
pub mod pool_region;

use crate::error::Result;
use crate::global_ptr::GlobalPtr;
use std::ptr::NonNull;

pub use dist_heap::DistHeap;
pub use pool_region::{PoolRegion, RegionMapping};

/// Lifecycle shared by every pool presentation.
pub trait LifeCycle {
    /// Whether the backing pool exists.
    fn exist(&self) -> bool;
    /// Create the backing pool and its persistent metadata.
    fn create(&mut self, size: u64) -> Result<()>;
    /// Destroy the backing pool and everything in it.
    fn destroy(&mut self) -> Result<()>;
    /// Open for use in this process.
    fn open(&mut self) -> Result<()>;
    /// Close; persistent state survives.
    fn close(&mut self) -> Result<()>;
    /// Whether this handle is open.
    fn is_open(&self) -> bool;
}

/// A variable-size allocator handing out stable global pointers.
pub trait Heap: LifeCycle {
    /// Allocate `size` bytes. An invalid request or exhausted heap yields
    /// `None`.
    fn alloc(&self, size: u64) -> Option<GlobalPtr>;
    /// Free a pointer obtained from any process's `alloc` on this heap.
    fn free(&self, ptr: GlobalPtr);
    /// Translate a pointer into this process's address space. The shelf
    /// must be mapped here (owned by this heap handle).
    fn global_to_local(&self, ptr: GlobalPtr) -> Option<NonNull<u8>>;
}

/// A single contiguous range of persistent memory.
pub trait Region: LifeCycle {
    /// Usable bytes in the region.
    fn size(&self) -> Result<u64>;
    /// Process-local base of the usable bytes.
    fn base(&self) -> Result<NonNull<u8>>;
}
