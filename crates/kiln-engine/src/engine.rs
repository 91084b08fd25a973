use crate::EngineError;
use kiln_schema::{split_repo_tag, ContainerId, ImageId, NetworkId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Daemon identity reported by the version endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersion {
    pub version: String,
    pub api_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: ImageId,
    /// `repository:tag` references; empty for untagged images.
    pub repo_tags: Vec<String>,
    /// Creation time, unix seconds.
    pub created: i64,
}

impl ImageSummary {
    /// Repositories this image is tagged into.
    pub fn repositories(&self) -> impl Iterator<Item = &str> {
        self.repo_tags.iter().map(|rt| split_repo_tag(rt).0)
    }

    pub fn has_repo_tag(&self, repository: &str, tag: &str) -> bool {
        self.repo_tags
            .iter()
            .any(|rt| split_repo_tag(rt) == (repository, tag))
    }
}

/// One layer of an image's ancestry, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// `<missing>` for layers that are not addressable images.
    pub id: String,
    pub created_by: String,
}

/// Parameters for creating a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Anonymous volumes mounted at these container paths.
    pub volumes: Vec<String>,
    /// TCP ports published to a random host port.
    pub published_ports: Vec<u16>,
    /// Containers (by name or id) whose volumes are mounted.
    pub volumes_from: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn volume(mut self, path: impl Into<String>) -> Self {
        self.volumes.push(path.into());
        self
    }

    #[must_use]
    pub fn publish(mut self, port: u16) -> Self {
        self.published_ports.push(port);
        self
    }

    #[must_use]
    pub fn volumes_from(mut self, container: impl Into<String>) -> Self {
        self.volumes_from.push(container.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
}

/// Inspected state of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    /// Name without the leading `/`.
    pub name: String,
    pub image: ImageId,
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Host bindings per published TCP port.
    pub ports: BTreeMap<u16, Vec<PortBinding>>,
    /// Gateways of the networks the container is attached to.
    pub gateways: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub image: ImageId,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub id: NetworkId,
    pub name: String,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Demultiplexed standard output.
    pub stdout: Vec<u8>,
}

/// The container daemon, as a black-box RPC service.
///
/// Everything is addressed by opaque string ids. Implementations must be
/// usable from several worker threads at once.
pub trait ContainerEngine: Send + Sync {
    fn version(&self) -> Result<EngineVersion, EngineError>;

    /// Hostname of the daemon as seen from this process. Local daemons
    /// report `localhost`.
    fn daemon_host(&self) -> String;

    fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError>;

    fn image_history(&self, image: &ImageId) -> Result<Vec<HistoryEntry>, EngineError>;

    /// Import a root filesystem tarball as `repository:tag`.
    fn import_image(&self, archive: &Path, repository: &str, tag: &str)
        -> Result<ImageId, EngineError>;

    /// Build from a tar context. Every output line is handed to `on_line`;
    /// the caller decides from the output whether the build succeeded.
    fn build_image(
        &self,
        context: &[u8],
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError>;

    fn tag_image(&self, image: &ImageId, repository: &str, tag: &str) -> Result<(), EngineError>;

    fn remove_image(&self, image: &ImageId) -> Result<(), EngineError>;

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError>;

    fn start_container(&self, id: &ContainerId) -> Result<(), EngineError>;

    fn stop_container(&self, id: &ContainerId, timeout_secs: u32) -> Result<(), EngineError>;

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo, EngineError>;

    fn remove_container(
        &self,
        id: &ContainerId,
        force: bool,
        volumes: bool,
    ) -> Result<(), EngineError>;

    fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Stream combined output of a container, line by line, until the stream
    /// ends. With `logs` the output produced before attaching is replayed
    /// first. The stream may end while the container is still running.
    fn attach(
        &self,
        id: &ContainerId,
        logs: bool,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError>;

    fn exec(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecOutput, EngineError>;

    fn commit_container(
        &self,
        id: &ContainerId,
        repository: &str,
        tag: &str,
    ) -> Result<ImageId, EngineError>;

    /// Tar archive of `path` inside the container.
    fn get_archive(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>, EngineError>;

    fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError>;

    fn create_network(&self, name: &str) -> Result<NetworkId, EngineError>;

    fn remove_network(&self, id: &NetworkId) -> Result<(), EngineError>;
}

/// Compare dotted API versions numerically (`1.9 < 1.22`).
pub fn api_version_at_least(actual: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> { v.split('.').map(|p| p.parse().unwrap_or(0)).collect() };
    let (a, m) = (parse(actual), parse(minimum));
    let len = a.len().max(m.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = m.get(i).copied().unwrap_or(0);
        if x != y {
            return x > y;
        }
    }
    true
}
