//! # famheap
//!
//! A persistent, shared, crash-tolerant memory manager over file-backed
//! byte-addressable memory (fabric-attached memory, DAX filesystems, or
//! tmpfs for testing).
//!
//! famheap partitions the persistent address space into named *pools* of
//! mmap'd *shelf files*. A pool is presented either as a single contiguous
//! region or as a distributed heap: variable-size allocate/free returning
//! stable [`GlobalPtr`]s usable from any participating process on any node
//! sharing the filesystem.
//!
//! ## Architecture
//!
//! - [`shelf_mgmt`]: shelf files, versioned naming, the membership table,
//!   and pools — the crash-safe directory of which shelves exist.
//! - [`shelf_usage`]: the persistent structures inside shelves — lock-free
//!   stacks, the fixed-block and buddy-style zone allocators, ownership
//!   leases, and remote-free queues.
//! - [`allocator`]: the user-facing presentations, [`DistHeap`] and
//!   [`PoolRegion`].
//! - [`manager`]: the process-wide [`MemoryManager`] tying it together.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use famheap::prelude::*;
//!
//! let mm = MemoryManager::global();
//! mm.create_heap(1, 128 * 1024 * 1024)?;
//!
//! let mut heap = mm.find_heap(1)?;
//! heap.open()?;
//! let ptr = heap.alloc(64).expect("heap not exhausted");
//!
//! // The pointer is meaningful in every process sharing the base dir.
//! let local = heap.global_to_local(ptr).unwrap();
//! unsafe { *local.as_ptr() = 42 };
//!
//! heap.free(ptr);
//! heap.close()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod config;
pub mod error;
pub mod fam;
pub mod global_ptr;
pub mod manager;
pub mod shelf_mgmt;
pub mod shelf_usage;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::allocator::{DistHeap, Heap, LifeCycle, PoolRegion, Region};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::global_ptr::{GlobalPtr, PoolId, ShelfId, ShelfIndex};
    pub use crate::manager::MemoryManager;
}

pub use allocator::{DistHeap, Heap, LifeCycle, PoolRegion, Region};
pub use config::Config;
pub use error::{Error, Result};
pub use global_ptr::{GlobalPtr, Offset, PoolId, ShelfId, ShelfIndex};
pub use manager::MemoryManager;
