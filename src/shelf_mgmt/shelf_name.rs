//! Shelf file naming.
//!
//! Pathnames are a pure function of the shelf id plus an optional version
//! suffix. Rename from the transient `_add` name to the committed versioned
//! name is the durable commit point of shelf creation, so the naming scheme
//! is part of the crash-consistency protocol, not just cosmetics:
//!
//! ```text
//! {base_dir}/{user}_NVMM_Shelf_{pool}_{idx}              metadata shelves
//! {base_dir}/{user}_NVMM_Shelf_{pool}_{idx}_{version}    committed shelves
//! {base_dir}/{user}_NVMM_Shelf_{pool}_{idx}_{version}_add  in-flight adds
//! ```

use crate::config::Config;
use crate::global_ptr::ShelfId;
use std::path::{Path, PathBuf};

const SHELF_TAG: &str = "NVMM_Shelf";

/// Suffix of transient files produced by an in-flight shelf add.
pub const ADD_SUFFIX: &str = "add";

/// Maps shelf ids to pathnames under one base directory.
#[derive(Debug, Clone)]
pub struct ShelfName {
    base_dir: PathBuf,
    prefix: String,
}

impl ShelfName {
    /// Build the naming scheme for a configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            base_dir: config.base_dir.clone(),
            prefix: format!("{}_{}", config.user, SHELF_TAG),
        }
    }

    /// The directory every shelf file lives in.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Unversioned path, used for metadata shelves.
    pub fn path(&self, shelf_id: ShelfId) -> PathBuf {
        self.base_dir.join(format!(
            "{}_{}_{}",
            self.prefix,
            shelf_id.pool_id(),
            shelf_id.shelf_idx()
        ))
    }

    /// Committed path of a versioned shelf.
    pub fn versioned_path(&self, shelf_id: ShelfId, version: u16) -> PathBuf {
        self.base_dir.join(format!(
            "{}_{}_{}_{}",
            self.prefix,
            shelf_id.pool_id(),
            shelf_id.shelf_idx(),
            version
        ))
    }

    /// Transient path of an in-flight shelf add.
    pub fn transient_path(&self, shelf_id: ShelfId, version: u16) -> PathBuf {
        self.base_dir.join(format!(
            "{}_{}_{}_{}_{}",
            self.prefix,
            shelf_id.pool_id(),
            shelf_id.shelf_idx(),
            version,
            ADD_SUFFIX
        ))
    }

    /// If `file_name` names a versioned or transient file of any shelf in
    /// `pool_id`, return `(shelf_idx, version, is_transient)`. Used by
    /// recovery's single directory pass.
    pub fn parse_any(
        &self,
        pool_id: crate::global_ptr::PoolId,
        file_name: &str,
    ) -> Option<(crate::global_ptr::ShelfIndex, u16, bool)> {
        let prefix = format!("{}_{}_", self.prefix, pool_id);
        let rest = file_name.strip_prefix(&prefix)?;
        let (idx_str, rest) = rest.split_once('_')?;
        let shelf_idx = idx_str.parse::<u8>().ok()?;
        if let Some(version_str) = rest.strip_suffix(&format!("_{}", ADD_SUFFIX)) {
            version_str.parse::<u16>().ok().map(|v| (shelf_idx, v, true))
        } else {
            rest.parse::<u16>().ok().map(|v| (shelf_idx, v, false))
        }
    }

    /// If `file_name` names a versioned or transient file of `shelf_id`,
    /// return `(version, is_transient)`. Used by recovery's directory scan.
    pub fn parse_versioned(&self, shelf_id: ShelfId, file_name: &str) -> Option<(u16, bool)> {
        let prefix = format!(
            "{}_{}_{}_",
            self.prefix,
            shelf_id.pool_id(),
            shelf_id.shelf_idx()
        );
        let rest = file_name.strip_prefix(&prefix)?;
        if let Some(version_str) = rest.strip_suffix(&format!("_{}", ADD_SUFFIX)) {
            version_str.parse::<u16>().ok().map(|v| (v, true))
        } else {
            rest.parse::<u16>().ok().map(|v| (v, false))
        }
    }
}
