//! Shelf usage: the persistent structures laid out inside shelves.
//!
//! Everything here operates on offsets relative to a mapped shelf (or a
//! sub-region of one): the lock-free stack, the two allocators built on it,
//! the ownership lease table, the remote-free queues, and the two shelf
//! presentations (heap and region).

pub mod fixed_block;
pub mod freelists;
pub mod ownership;
pub mod shelf_heap;
pub mod shelf_region;
pub mod stack;
pub mod zone;

pub use fixed_block::FixedBlockAllocator;
pub use freelists::FreeLists;
pub use ownership::Ownership;
pub use shelf_heap::ShelfHeap;
pub use shelf_region::ShelfRegion;
pub use stack::Stack;
pub use zone::Zone;
