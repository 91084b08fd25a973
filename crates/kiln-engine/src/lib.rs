//! Container-engine access for kiln.
//!
//! This crate implements the engine layer: the [`ContainerEngine`] capability
//! trait covering the image, container, network, build, exec and attach
//! operations kiln needs from a daemon, an HTTP implementation
//! ([`HttpEngine`]), an in-memory [`MockEngine`] for tests, the
//! [`Transaction`] wrapper that tears down resources created in a failed
//! scope, output-stream decoding, and host prerequisite checks.

pub mod engine;
pub mod http;
pub mod mock;
pub mod prereq;
pub mod stream;
pub mod transaction;

pub use engine::{
    api_version_at_least, ContainerEngine, ContainerInfo, ContainerSpec, ContainerSummary,
    EngineVersion, ExecOutput, HistoryEntry, ImageSummary, NetworkSummary, PortBinding,
};
pub use http::HttpEngine;
pub use mock::{EngineCall, MockEngine};
pub use prereq::{check_prereqs, format_missing, MissingPrereq};
pub use transaction::{rollback_on_error, Transaction};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container engine unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("engine request '{context}' failed with HTTP {status}")]
    Api { status: u16, context: String },
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unexpected engine response: {0}")]
    Protocol(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display() {
        let e = EngineError::Api {
            status: 409,
            context: "DELETE /images/abc".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("409"));
        assert!(msg.contains("/images/abc"));
    }

    #[test]
    fn not_found_predicate() {
        assert!(EngineError::NotFound("c1".to_owned()).is_not_found());
        assert!(!EngineError::Unavailable("down".to_owned()).is_not_found());
    }
}
