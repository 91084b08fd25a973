//! One-way mirrored file transfer into the content-sync container.

use crate::CoreError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub trait FileTransfer: Send + Sync {
    /// Mirror `files` (relative to `source_root`) to `destination`. Files
    /// missing from the list are deleted at the destination. Permissions and
    /// timestamps are preserved, ownership is not.
    fn push(&self, source_root: &Path, files: &[String], destination: &str)
        -> Result<(), CoreError>;
}

/// Transfer through the `rsync` binary.
#[derive(Debug, Clone, Default)]
pub struct Rsync;

impl Rsync {
    /// Argument list for one push. Ownership is never synced.
    pub fn args(source_root: &Path, files_from: &Path, destination: &str) -> Vec<String> {
        vec![
            "-rlpt".to_owned(),
            "--delete-before".to_owned(),
            "--files-from".to_owned(),
            files_from.to_string_lossy().into_owned(),
            source_root.to_string_lossy().into_owned(),
            destination.to_owned(),
        ]
    }
}

impl FileTransfer for Rsync {
    fn push(
        &self,
        source_root: &Path,
        files: &[String],
        destination: &str,
    ) -> Result<(), CoreError> {
        let mut list = tempfile::NamedTempFile::new()?;
        for f in files {
            writeln!(list, "{f}")?;
        }
        list.flush()?;

        let args = Self::args(source_root, list.path(), destination);
        debug!("rsync {} ({} files)", args.join(" "), files.len());
        let status = Command::new("rsync")
            .args(&args)
            .current_dir("/")
            .status()
            .map_err(|e| CoreError::Command {
                command: "rsync".to_owned(),
                detail: e.to_string(),
            })?;
        if !status.success() {
            return Err(CoreError::Command {
                command: format!("rsync {}", args.join(" ")),
                detail: status.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub source_root: PathBuf,
    pub files: Vec<String>,
    pub destination: String,
}

/// Transfer that only records what it was asked to push.
#[derive(Debug, Default)]
pub struct RecordingTransfer {
    pushes: Mutex<Vec<TransferRecord>>,
}

impl RecordingTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushes(&self) -> Vec<TransferRecord> {
        self.pushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FileTransfer for RecordingTransfer {
    fn push(
        &self,
        source_root: &Path,
        files: &[String],
        destination: &str,
    ) -> Result<(), CoreError> {
        self.pushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TransferRecord {
                source_root: source_root.to_owned(),
                files: files.to_vec(),
                destination: destination.to_owned(),
            });
        Ok(())
    }
}
