//! Configuration, role definitions, identifiers, and build-script parsing for kiln.
//!
//! This crate defines the schema layer: the `kiln.toml` configuration document
//! (`KilnConfig`), validated role definitions (`ImageSpec`, `StartPoint`),
//! string newtypes for engine identifiers, and the build-script extensions
//! (`# %include` directives and `FROM secure:` base references).

pub mod buildscript;
pub mod config;
pub mod roles;
pub mod types;

pub use buildscript::{BuildScript, SecureBaseRef};
pub use config::{
    load_config, parse_config_str, EngineSection, ImageSection, KilnConfig, PathsSection,
    ProvisionSection, PruneSection, SourceSection, SyncSection, Vcs, CONFIG_FILE,
};
pub use roles::{builder_dir_name, builder_role, ImageSpec, StartPoint};
pub use types::{split_repo_tag, ContainerId, ImageId, NetworkId, Role};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid build script directive: {0}")]
    InvalidDirective(String),
}
