//! State directory layout and build metadata for Templar.
//!
//! `StoreLayout` owns the paths under the state directory (metadata file,
//! image cache, work directory, run lock) and `MetadataStore` persists the
//! per-template build metadata map with atomic rewrites.

pub mod layout;
pub mod metadata;

pub use layout::{StoreLayout, WORK_DIR_PREFIX};
pub use metadata::{now_timestamp, BuildMetadata, MetadataMap, MetadataStore};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("path has no parent directory: {0}")]
    NoParent(PathBuf),
}
