//! Durable build state for kiln.
//!
//! This crate provides the storage layer: the [`BuildState`] document recording
//! built images, clobber observations and the reusable content-sync container,
//! the [`StateStore`] that rewrites it atomically on every mutation, and
//! [`ClobberMarkers`] for external cache invalidation.

pub mod clobber;
pub mod state;

pub use clobber::ClobberMarkers;
pub use state::{BuildState, StateStore};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename is persisted until its parent
/// directory is synced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("state document {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_error_names_path() {
        let e = StoreError::Corrupt {
            path: PathBuf::from("/tmp/state.json"),
            reason: "expected value".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("/tmp/state.json"));
        assert!(msg.contains("expected value"));
    }

    #[test]
    fn fsync_dir_on_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        fsync_dir(dir.path()).unwrap();
    }
}
