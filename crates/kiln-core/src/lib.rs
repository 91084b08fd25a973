//! Core orchestration engine for kiln.
//!
//! This crate ties together the schema, state store and container engine into
//! [`Kiln`], the central API for building and provisioning images. It covers
//! digest-verified base image import, build-context assembly, the per-role
//! build state machine, provisioning runs with re-attach, the content-sync
//! container, the bounded parallel scheduler, image pruning, coverage
//! extraction, wait helpers, and the advisory state-file lock.

pub mod build;
pub mod concurrency;
pub mod containers;
pub mod context;
pub mod coverage;
pub mod engine;
pub mod import;
pub mod provision;
pub mod prune;
pub mod scheduler;
pub mod source;
pub mod sync;
pub mod transfer;
pub mod wait;

pub use build::Session;
pub use concurrency::{
    install_signal_handler, limited_workers, shutdown_requested, worker_pool, StoreLock,
};
pub use containers::{
    auto_clean_orphans, directory_contents, read_container_file, started_container,
};
pub use context::{assemble_context, BuildContext};
pub use coverage::{get_coverage, CoverageRecord};
pub use engine::Kiln;
pub use import::SecureImporter;
pub use provision::ProvisionedImage;
pub use prune::{prune_images, PruneReport};
pub use scheduler::BuildRequest;
pub use source::{SourceTree, StaticTree, VcsTree};
pub use sync::{SyncHandle, SyncMode};
pub use transfer::{FileTransfer, RecordingTransfer, Rsync, TransferRecord};
pub use wait::{
    assert_running_fn, available_port, host_endpoint, wait_for_http, wait_for_ssh, wait_for_tcp,
};

use kiln_engine::EngineError;
use kiln_schema::{ContainerId, Role, SchemaError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Schema(SchemaError),
    #[error("state store error: {0}")]
    Store(#[from] kiln_store::StoreError),
    #[error("container engine error: {0}")]
    Engine(EngineError),
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("downloaded image does not match digest: {url}; got {actual} expected {expected}")]
    Integrity {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("unknown builder '{role}': {} is not a directory", .path.display())]
    UnknownBuilder { role: Role, path: PathBuf },
    #[error(".dockerignore is not supported in build contexts: {}", .0.display())]
    IgnoreFileUnsupported(PathBuf),
    #[error("included path is not under version control: {0}")]
    NotTracked(String),
    #[error("unable to confirm image was built: {role}")]
    BuildFailed { role: Role },
    #[error(
        "provisioning of {role} exited with code {exit_code}; last output:\n{}",
        .output.join("\n")
    )]
    ProvisioningFailed {
        role: Role,
        exit_code: i64,
        output: Vec<String>,
    },
    #[error("output of {role} disconnected {attempts} times while its container kept running")]
    AttachExhausted { role: Role, attempts: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("timeout reached waiting for {what} after {after:?}")]
    Timeout { what: String, after: Duration },
    #[error("container {container} does not publish port {port}")]
    PortNotPublished { container: ContainerId, port: u16 },
    #[error("unable to determine a host address for container {0}")]
    NoHostAddress(ContainerId),
    #[error("container stopped running: {0}")]
    ContainerStopped(ContainerId),
    #[error("'{command}' failed: {detail}")]
    Command { command: String, detail: String },
    #[error("failed to create worker pool: {0}")]
    WorkerPool(String),
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Shared(Arc<CoreError>),
}

impl From<EngineError> for CoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Unavailable(msg) => CoreError::EngineUnavailable(msg),
            other => CoreError::Engine(other),
        }
    }
}

impl From<SchemaError> for CoreError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::InvalidArgument(msg) => CoreError::InvalidArgument(msg),
            other => CoreError::Schema(other),
        }
    }
}

impl CoreError {
    /// The error behind any number of [`CoreError::Shared`] wrappers.
    pub fn root(&self) -> &CoreError {
        match self {
            CoreError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether this is a caller or configuration mistake rather than a
    /// runtime failure.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self.root(),
            CoreError::Schema(_) | CoreError::InvalidArgument(_) | CoreError::UnknownBuilder { .. }
        )
    }
}
