//! Error types for famheap.

use thiserror::Error;

/// Result type alias using famheap's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for famheap operations.
///
/// Each subsystem returns the variant closest to the failure; the higher
/// layers (distributed heap, memory manager) translate component errors into
/// their own kinds (`Heap*`, `Id*`) before surfacing them to callers.
#[derive(Error, Debug)]
pub enum Error {
    /// A shelf file already exists at the target path.
    #[error("shelf file already exists")]
    ShelfFileFound,

    /// The shelf file does not exist.
    #[error("shelf file not found")]
    ShelfFileNotFound,

    /// The shelf file content does not match the expected format.
    #[error("shelf file has invalid format: {0}")]
    ShelfFileInvalidFormat(String),

    /// The pool already exists.
    #[error("pool already exists")]
    PoolFound,

    /// The pool does not exist.
    #[error("pool not found")]
    PoolNotFound,

    /// The operation requires a closed pool.
    #[error("pool is open")]
    PoolOpened,

    /// The operation requires an open pool.
    #[error("pool is closed")]
    PoolClosed,

    /// No shelf slot could be assigned.
    #[error("failed to add a shelf to the pool")]
    PoolAddShelfFailed,

    /// The shelf was concurrently re-versioned during removal.
    #[error("failed to remove the shelf from the pool")]
    PoolRemoveShelfFailed,

    /// The shelf index is not a member of the pool.
    #[error("shelf not found in the pool")]
    PoolShelfNotFound,

    /// The pool id does not match or is out of range.
    #[error("invalid pool id")]
    PoolInvalidPoolId,

    /// Recovery observed a state explainable only by a crash or a concurrent
    /// in-flight operation. Informational; recovery still made progress.
    #[error("pool inconsistency found during recovery")]
    PoolInconsistencyFound,

    /// Membership table creation failed (insufficient space).
    #[error("membership create failed: {0}")]
    MembershipCreateFailed(String),

    /// Membership table open failed (bad magic or truncated region).
    #[error("membership open failed: {0}")]
    MembershipOpenFailed(String),

    /// Membership table destroy failed (not a valid table).
    #[error("membership destroy failed")]
    MembershipDestroyFailed,

    /// Heap creation failed.
    #[error("heap create failed")]
    HeapCreateFailed,

    /// Heap open failed.
    #[error("heap open failed")]
    HeapOpenFailed,

    /// Heap close failed.
    #[error("heap close failed")]
    HeapCloseFailed,

    /// Heap destroy failed.
    #[error("heap destroy failed")]
    HeapDestroyFailed,

    /// Region creation failed.
    #[error("region create failed")]
    RegionCreateFailed,

    /// Region open failed.
    #[error("region open failed")]
    RegionOpenFailed,

    /// The given pool id is already in use.
    #[error("id already in use")]
    IdFound,

    /// No pool with the given id exists.
    #[error("id not found")]
    IdNotFound,

    /// The global pointer is zero or malformed.
    #[error("invalid global pointer")]
    InvalidPtr,

    /// Mapping the pointed-to range failed.
    #[error("map pointer failed")]
    MapPointerFailed,

    /// The remote-free record allocator is exhausted. Fatal to the caller:
    /// dropping the pointer instead would leak persistent memory.
    #[error("freelist is out of record space")]
    FreelistFull,

    /// A zone grow or merge latch is held by another process.
    #[error("zone maintenance already in progress")]
    ZoneBusy,

    /// A shelf-heap's owner heartbeat is fresh; its lease cannot be revoked.
    #[error("shelf heap owner appears to be alive")]
    OwnerAlive,

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
