//! Crate-wide configuration and fixed limits.
//!
//! The persistent file surface is rooted at a single directory; every shelf
//! file name is prefixed with a user tag so several users can share one
//! fabric-attached filesystem. Both are environment-overridable, which is
//! also how the test suites isolate themselves from each other.

use std::path::PathBuf;

/// Cache line size assumed for shared-memory layout. Every independently
/// CAS'd word lives in its own cache line.
pub const CACHE_LINE_SIZE: usize = 64;

/// Number of pools, including the reserved metadata pool 0.
pub const MAX_POOL_COUNT: usize = 256;

/// Number of shelf slots per pool.
pub const MAX_SHELF_COUNT: usize = 256;

/// Default per-shelf size for a pool (bytes).
pub const SHELF_SIZE: u64 = 128 * 1024 * 1024;

/// Size of each pool's metadata shelf (bytes).
pub const METADATA_SHELF_SIZE: u64 = 128 * 1024 * 1024;

/// Size of the root shelf holding the per-pool spinlocks (bytes).
pub const ROOT_SHELF_SIZE: u64 = 64 * 1024;

/// Maximum number of shelf-heaps a single process owns concurrently.
pub const MAX_OWNED_HEAP: usize = 4;

/// Sleep between background cleaner iterations (microseconds).
pub const WORKER_SLEEP_US: u64 = 100_000;

/// A shelf-heap whose owner heartbeat is older than this is considered
/// orphaned and its ownership lease revocable (microseconds).
pub const HEARTBEAT_TIMEOUT_US: u64 = 500_000;

/// Smallest object served by the zone allocator (bytes, power of two).
pub const ZONE_MIN_OBJECT_SIZE: u64 = 64;

/// Largest zone a single shelf may carry (bytes, power of two).
pub const ZONE_MAX_SIZE: u64 = 128 * 1024 * 1024 * 1024;

/// Where the manager looks for its base directory when not configured.
const BASE_DIR_ENV: &str = "FAMHEAP_BASE_DIR";
const USER_ENV: &str = "FAMHEAP_USER";
const DEFAULT_BASE_DIR: &str = "/tmp/famheap";

/// Filesystem configuration: where shelf files live and how they are tagged.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding every shelf file. Created on first use if absent.
    pub base_dir: PathBuf,
    /// Per-user prefix applied to every file name.
    pub user: String,
}

impl Config {
    /// Build a config with an explicit base directory, keeping the
    /// environment-derived user tag.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            user: default_user(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let base_dir = std::env::var_os(BASE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));
        Self {
            base_dir,
            user: default_user(),
        }
    }
}

fn default_user() -> String {
    std::env::var(USER_ENV)
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "famheap".to_string())
}
