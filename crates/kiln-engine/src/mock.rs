//! In-memory container engine for tests.
//!
//! Images, containers and networks live in a map behind a mutex. Builds are
//! deterministic (ids derive from the build context), provisioning containers
//! "run" a scripted output and exit with a configurable code, and attach
//! streams can be made to end early while the container keeps running.

use crate::engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerSummary, EngineVersion, ExecOutput,
    HistoryEntry, ImageSummary, NetworkSummary, PortBinding,
};
use crate::EngineError;
use kiln_schema::{ContainerId, ImageId, NetworkId};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const BRIDGE_GATEWAY: &str = "172.17.0.1";
const FIRST_HOST_PORT: u16 = 32768;

/// A call observed by the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Build { script: String, entries: Vec<String> },
    Import { repository: String, tag: String, content: Vec<u8> },
    Tag { image: ImageId, repository: String, tag: String },
    RemoveImage(ImageId),
    CreateContainer { image: String, cmd: Vec<String> },
    StartContainer(ContainerId),
    StopContainer(ContainerId),
    RemoveContainer(ContainerId),
    Attach { container: ContainerId, logs: bool },
    Exec { container: ContainerId, cmd: Vec<String> },
    Commit { container: ContainerId, repository: String, tag: String },
    CreateNetwork(String),
    RemoveNetwork(NetworkId),
}

#[derive(Debug, Clone)]
struct MockImage {
    repo_tags: Vec<String>,
    created: i64,
    parent: Option<ImageId>,
    created_by: String,
}

#[derive(Debug, Clone)]
struct MockContainer {
    name: String,
    image: ImageId,
    cmd: Vec<String>,
    running: bool,
    exit_code: Option<i64>,
    ports: BTreeMap<u16, Vec<PortBinding>>,
    output: Vec<String>,
    produced: usize,
    files: BTreeMap<String, Vec<u8>>,
}

impl MockContainer {
    /// Containers with a command run to completion; others idle until stopped.
    fn is_job(&self) -> bool {
        !self.cmd.is_empty()
    }
}

#[derive(Debug, Default)]
struct MockState {
    images: BTreeMap<ImageId, MockImage>,
    containers: BTreeMap<ContainerId, MockContainer>,
    networks: BTreeMap<NetworkId, NetworkSummary>,
    counter: u64,
    next_port: u16,
    calls: Vec<EngineCall>,
    failing_builds: Vec<String>,
    exit_codes: Vec<(String, i64)>,
    job_output: Option<Vec<String>>,
    attach_interruptions: u32,
    failing_creates: u32,
    failing_removals: u32,
}

impl MockState {
    fn next_hex(&mut self, seed: &str) -> String {
        self.counter += 1;
        blake3::hash(format!("{seed}:{}", self.counter).as_bytes())
            .to_hex()
            .to_string()
    }

    fn tick(&mut self) -> i64 {
        self.counter += 1;
        self.counter as i64
    }

    fn insert_image(
        &mut self,
        id: ImageId,
        parent: Option<ImageId>,
        created_by: &str,
        repo_tags: Vec<String>,
    ) {
        let created = self.tick();
        for rt in &repo_tags {
            self.untag_everywhere(rt);
        }
        self.images.insert(
            id,
            MockImage {
                repo_tags,
                created,
                parent,
                created_by: created_by.to_owned(),
            },
        );
    }

    fn untag_everywhere(&mut self, repo_tag: &str) {
        for image in self.images.values_mut() {
            image.repo_tags.retain(|rt| rt != repo_tag);
        }
    }

    fn resolve_image(&self, reference: &str) -> Option<ImageId> {
        let id = ImageId::from(reference);
        if self.images.contains_key(&id) {
            return Some(id);
        }
        let with_algo = ImageId::new(format!("sha256:{reference}"));
        if self.images.contains_key(&with_algo) {
            return Some(with_algo);
        }
        self.images
            .iter()
            .find(|(_, img)| img.repo_tags.iter().any(|rt| rt == reference))
            .map(|(id, _)| id.clone())
    }

    fn container(&self, id: &ContainerId) -> Result<&MockContainer, EngineError> {
        self.containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))
    }

    fn container_mut(&mut self, id: &ContainerId) -> Result<&mut MockContainer, EngineError> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))
    }

    fn exit_code_for(&self, cmd: &[String]) -> i64 {
        let joined = cmd.join(" ");
        self.exit_codes
            .iter()
            .find(|(needle, _)| joined.contains(needle.as_str()))
            .map_or(0, |(_, code)| *code)
    }
}

/// Container engine that keeps everything in memory.
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        let mut state = MockState {
            next_port: FIRST_HOST_PORT,
            ..MockState::default()
        };
        let bridge = NetworkId::new(state.next_hex("network:bridge"));
        state.networks.insert(
            bridge.clone(),
            NetworkSummary {
                id: bridge,
                name: "bridge".to_owned(),
                gateway: Some(BRIDGE_GATEWAY.to_owned()),
            },
        );
        Self {
            state: Mutex::new(state),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds whose script contains `needle` end without a success marker.
    pub fn fail_builds_containing(&self, needle: &str) {
        self.lock().failing_builds.push(needle.to_owned());
    }

    /// Job containers whose command contains `needle` exit with `code`.
    pub fn set_exit_code(&self, needle: &str, code: i64) {
        self.lock().exit_codes.push((needle.to_owned(), code));
    }

    /// Lines every job container prints.
    pub fn set_job_output(&self, lines: &[&str]) {
        self.lock().job_output = Some(lines.iter().map(|l| (*l).to_owned()).collect());
    }

    /// The next `n` attach streams to a running job end after one more line.
    pub fn interrupt_attach(&self, n: u32) {
        self.lock().attach_interruptions = n;
    }

    /// The next `n` container creations fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.lock().failing_creates = n;
    }

    /// The next `n` container removals fail with a server error and leave
    /// the container in place.
    pub fn fail_next_removals(&self, n: u32) {
        self.lock().failing_removals = n;
    }

    /// Seed an image with the given `repository:tag` references.
    pub fn add_image(&self, repo_tags: &[&str]) -> ImageId {
        self.add_image_with_parent(None, "", repo_tags)
    }

    /// Seed an image on top of `parent`, recording `created_by` in its history.
    pub fn add_image_with_parent(
        &self,
        parent: Option<&ImageId>,
        created_by: &str,
        repo_tags: &[&str],
    ) -> ImageId {
        let mut state = self.lock();
        let id = ImageId::new(format!("sha256:{}", state.next_hex("image")));
        state.insert_image(
            id.clone(),
            parent.cloned(),
            created_by,
            repo_tags.iter().map(|rt| (*rt).to_owned()).collect(),
        );
        id
    }

    /// Create and start an idle container from `image`.
    pub fn run_container(&self, image: &ImageId) -> Result<ContainerId, EngineError> {
        let id = self.create_container(&ContainerSpec::new(image.as_str()))?;
        self.start_container(&id)?;
        Ok(id)
    }

    /// Place a file inside a container's filesystem.
    pub fn put_file(&self, id: &ContainerId, path: &str, data: &[u8]) -> Result<(), EngineError> {
        let mut state = self.lock();
        state
            .container_mut(id)?
            .files
            .insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Scripts of every build submitted, in order.
    pub fn builds(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::Build { script, .. } => Some(script.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn commits(&self) -> Vec<(String, String)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::Commit {
                    repository, tag, ..
                } => Some((repository.clone(), tag.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn image_exists(&self, id: &ImageId) -> bool {
        self.lock().images.contains_key(id)
    }

    pub fn container_exists(&self, id: &ContainerId) -> bool {
        self.lock().containers.contains_key(id)
    }

    pub fn network_exists(&self, id: &NetworkId) -> bool {
        self.lock().networks.contains_key(id)
    }

    pub fn repo_tags(&self, id: &ImageId) -> Vec<String> {
        self.lock()
            .images
            .get(id)
            .map(|i| i.repo_tags.clone())
            .unwrap_or_default()
    }

    /// Number of ancestors including the image itself.
    pub fn image_depth(&self, id: &ImageId) -> usize {
        self.image_history(id).map_or(0, |h| h.len())
    }
}

fn read_dockerfile(context: &[u8]) -> Result<(String, Vec<String>), EngineError> {
    let mut archive = tar::Archive::new(context);
    let mut script = None;
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if name == "Dockerfile" {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            script = Some(text);
        }
        entries.push(name);
    }
    let script =
        script.ok_or_else(|| EngineError::Protocol("build context has no Dockerfile".to_owned()))?;
    Ok((script, entries))
}

fn archive_files<'a>(
    files: impl Iterator<Item = (String, &'a [u8])>,
) -> Result<Vec<u8>, EngineError> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data)?;
    }
    Ok(builder.into_inner()?)
}

impl ContainerEngine for MockEngine {
    fn version(&self) -> Result<EngineVersion, EngineError> {
        Ok(EngineVersion {
            version: "mock".to_owned(),
            api_version: "1.41".to_owned(),
        })
    }

    fn daemon_host(&self) -> String {
        "localhost".to_owned()
    }

    fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        Ok(self
            .lock()
            .images
            .iter()
            .map(|(id, img)| ImageSummary {
                id: id.clone(),
                repo_tags: img.repo_tags.clone(),
                created: img.created,
            })
            .collect())
    }

    fn image_history(&self, image: &ImageId) -> Result<Vec<HistoryEntry>, EngineError> {
        let state = self.lock();
        let mut current = state
            .resolve_image(image)
            .ok_or_else(|| EngineError::NotFound(format!("image {image}")))?;
        let mut history = Vec::new();
        loop {
            let Some(img) = state.images.get(&current) else {
                break;
            };
            history.push(HistoryEntry {
                id: current.to_string(),
                created_by: img.created_by.clone(),
            });
            match &img.parent {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }
        Ok(history)
    }

    fn import_image(
        &self,
        archive: &Path,
        repository: &str,
        tag: &str,
    ) -> Result<ImageId, EngineError> {
        let content = std::fs::read(archive)?;
        let id = ImageId::new(format!("sha256:{}", blake3::hash(&content).to_hex()));
        let mut state = self.lock();
        state.calls.push(EngineCall::Import {
            repository: repository.to_owned(),
            tag: tag.to_owned(),
            content,
        });
        state.insert_image(
            id.clone(),
            None,
            "imported",
            vec![format!("{repository}:{tag}")],
        );
        Ok(id)
    }

    fn build_image(
        &self,
        context: &[u8],
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError> {
        let (script, entries) = read_dockerfile(context)?;
        let steps: Vec<&str> = script
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        let mut lines = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            lines.push(format!("Step {}/{} : {step}", i + 1, steps.len()));
        }

        {
            let mut state = self.lock();
            state.calls.push(EngineCall::Build {
                script: script.clone(),
                entries,
            });

            if state
                .failing_builds
                .iter()
                .any(|needle| script.contains(needle.as_str()))
            {
                lines.push("error: The command returned a non-zero code: 1".to_owned());
            } else {
                let id = ImageId::new(format!("sha256:{}", blake3::hash(context).to_hex()));
                let parent = steps
                    .iter()
                    .find_map(|s| s.strip_prefix("FROM "))
                    .and_then(|base| state.resolve_image(base.trim()));
                if !state.images.contains_key(&id) {
                    state.insert_image(id.clone(), parent, "/bin/sh -c #(nop) build", Vec::new());
                }
                lines.push(format!("Successfully built {}", id.short()));
            }
        }

        for line in &lines {
            on_line(line);
        }
        Ok(())
    }

    fn tag_image(&self, image: &ImageId, repository: &str, tag: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        let id = state
            .resolve_image(image)
            .ok_or_else(|| EngineError::NotFound(format!("image {image}")))?;
        let repo_tag = format!("{repository}:{tag}");
        state.untag_everywhere(&repo_tag);
        if let Some(img) = state.images.get_mut(&id) {
            img.repo_tags.push(repo_tag);
        }
        state.calls.push(EngineCall::Tag {
            image: id,
            repository: repository.to_owned(),
            tag: tag.to_owned(),
        });
        Ok(())
    }

    fn remove_image(&self, image: &ImageId) -> Result<(), EngineError> {
        let mut state = self.lock();
        if !state.images.contains_key(image) {
            return Err(EngineError::NotFound(format!("image {image}")));
        }
        if state.containers.values().any(|c| &c.image == image) {
            return Err(EngineError::Api {
                status: 409,
                context: format!("image {image} is in use by a container"),
            });
        }
        state.images.remove(image);
        state.calls.push(EngineCall::RemoveImage(image.clone()));
        Ok(())
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::CreateContainer {
            image: spec.image.clone(),
            cmd: spec.cmd.clone(),
        });
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(EngineError::Api {
                status: 500,
                context: "create container".to_owned(),
            });
        }
        let image = state
            .resolve_image(&spec.image)
            .ok_or_else(|| EngineError::NotFound(format!("image {}", spec.image)))?;

        let mut ports = BTreeMap::new();
        for port in &spec.published_ports {
            let host_port = state.next_port;
            state.next_port += 1;
            ports.insert(
                *port,
                vec![PortBinding {
                    host_ip: "0.0.0.0".to_owned(),
                    host_port,
                }],
            );
        }

        let hex = state.next_hex("container");
        let id = ContainerId::new(hex.clone());
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: format!("mock-{}", &hex[..12]),
                image,
                cmd: spec.cmd.clone(),
                running: false,
                exit_code: None,
                ports,
                output: Vec::new(),
                produced: 0,
                files: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn start_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        let mut state = self.lock();
        let output = state.job_output.clone();
        let container = state.container_mut(id)?;
        if !container.running {
            container.running = true;
            container.exit_code = None;
            container.produced = 0;
            container.output = if container.is_job() {
                output.unwrap_or_else(|| {
                    vec![
                        format!("PLAY [{}]", container.cmd.join(" ")),
                        "TASK [Gathering Facts]".to_owned(),
                        "ok: [localhost]".to_owned(),
                        "PLAY RECAP".to_owned(),
                    ]
                })
            } else {
                Vec::new()
            };
        }
        state.calls.push(EngineCall::StartContainer(id.clone()));
        Ok(())
    }

    fn stop_container(&self, id: &ContainerId, _timeout_secs: u32) -> Result<(), EngineError> {
        let mut state = self.lock();
        let container = state.container_mut(id)?;
        if container.running {
            container.running = false;
            container.exit_code.get_or_insert(0);
        }
        state.calls.push(EngineCall::StopContainer(id.clone()));
        Ok(())
    }

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo, EngineError> {
        let state = self.lock();
        let container = state.container(id)?;
        Ok(ContainerInfo {
            id: id.clone(),
            name: container.name.clone(),
            image: container.image.clone(),
            running: container.running,
            exit_code: container.exit_code,
            ports: container.ports.clone(),
            gateways: vec![BRIDGE_GATEWAY.to_owned()],
        })
    }

    fn remove_container(
        &self,
        id: &ContainerId,
        force: bool,
        _volumes: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.failing_removals > 0 {
            state.failing_removals -= 1;
            return Err(EngineError::Api {
                status: 500,
                context: format!("DELETE /containers/{id}"),
            });
        }
        if state.container(id)?.running && !force {
            return Err(EngineError::Api {
                status: 409,
                context: format!("container {id} is running"),
            });
        }
        state.containers.remove(id);
        state.calls.push(EngineCall::RemoveContainer(id.clone()));
        Ok(())
    }

    fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| all || c.running)
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                image: c.image.clone(),
                running: c.running,
            })
            .collect())
    }

    fn attach(
        &self,
        id: &ContainerId,
        logs: bool,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError> {
        let lines = {
            let mut state = self.lock();
            state.calls.push(EngineCall::Attach {
                container: id.clone(),
                logs,
            });
            let interrupt = state.attach_interruptions > 0;
            let exit_code = state.exit_code_for(&state.container(id)?.cmd);
            let container = state.container_mut(id)?;
            if !container.is_job() || !container.running {
                let start = if logs { 0 } else { container.produced };
                container.output[start..container.produced].to_vec()
            } else {
                let start = if logs { 0 } else { container.produced };
                if interrupt {
                    container.produced = (container.produced + 1).min(container.output.len());
                } else {
                    container.produced = container.output.len();
                    container.running = false;
                    container.exit_code = Some(exit_code);
                }
                let lines = container.output[start..container.produced].to_vec();
                if interrupt {
                    state.attach_interruptions -= 1;
                }
                lines
            }
        };
        for line in &lines {
            on_line(line);
        }
        Ok(())
    }

    fn exec(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecOutput, EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Exec {
            container: id.clone(),
            cmd: cmd.to_vec(),
        });
        let container = state.container(id)?;

        let is_tar = cmd.first().is_some_and(|c| c.ends_with("tar"));
        let dir = cmd
            .iter()
            .position(|a| a == "-C")
            .and_then(|i| cmd.get(i + 1));
        let (true, Some(dir)) = (is_tar, dir) else {
            return Ok(ExecOutput {
                exit_code: 0,
                stdout: Vec::new(),
            });
        };

        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let files: Vec<(String, &[u8])> = container
            .files
            .iter()
            .filter_map(|(path, data)| {
                path.strip_prefix(&prefix)
                    .map(|rel| (format!("./{rel}"), data.as_slice()))
            })
            .collect();
        if files.is_empty() {
            return Ok(ExecOutput {
                exit_code: 2,
                stdout: Vec::new(),
            });
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: archive_files(files.into_iter())?,
        })
    }

    fn commit_container(
        &self,
        id: &ContainerId,
        repository: &str,
        tag: &str,
    ) -> Result<ImageId, EngineError> {
        let mut state = self.lock();
        let container = state.container(id)?;
        let parent = container.image.clone();
        let created_by = container.cmd.join(" ");
        let image = ImageId::new(format!("sha256:{}", state.next_hex(&format!("commit:{id}"))));
        state.insert_image(
            image.clone(),
            Some(parent),
            &created_by,
            vec![format!("{repository}:{tag}")],
        );
        state.calls.push(EngineCall::Commit {
            container: id.clone(),
            repository: repository.to_owned(),
            tag: tag.to_owned(),
        });
        Ok(image)
    }

    fn get_archive(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>, EngineError> {
        let state = self.lock();
        let container = state.container(id)?;
        let base = path.trim_end_matches('/');
        let name = base.rsplit('/').next().unwrap_or(base);

        if let Some(data) = container.files.get(base) {
            return archive_files(std::iter::once((name.to_owned(), data.as_slice())));
        }
        let prefix = format!("{base}/");
        let files: Vec<(String, &[u8])> = container
            .files
            .iter()
            .filter_map(|(p, data)| {
                p.strip_prefix(&prefix)
                    .map(|rel| (format!("{name}/{rel}"), data.as_slice()))
            })
            .collect();
        if files.is_empty() {
            return Err(EngineError::NotFound(format!("{path} in container {id}")));
        }
        archive_files(files.into_iter())
    }

    fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError> {
        Ok(self.lock().networks.values().cloned().collect())
    }

    fn create_network(&self, name: &str) -> Result<NetworkId, EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::CreateNetwork(name.to_owned()));
        if state.networks.values().any(|n| n.name == name) {
            return Err(EngineError::Api {
                status: 409,
                context: format!("network {name} already exists"),
            });
        }
        let id = NetworkId::new(state.next_hex(&format!("network:{name}")));
        state.networks.insert(
            id.clone(),
            NetworkSummary {
                id: id.clone(),
                name: name.to_owned(),
                gateway: None,
            },
        );
        Ok(id)
    }

    fn remove_network(&self, id: &NetworkId) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.networks.remove(id).is_none() {
            return Err(EngineError::NotFound(format!("network {id}")));
        }
        state.calls.push(EngineCall::RemoveNetwork(id.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(script: &str) -> Vec<u8> {
        archive_files(std::iter::once(("Dockerfile".to_owned(), script.as_bytes()))).unwrap()
    }

    fn build(engine: &MockEngine, script: &str) -> Vec<String> {
        let mut lines = Vec::new();
        engine
            .build_image(&context(script), &mut |l| lines.push(l.to_owned()))
            .unwrap();
        lines
    }

    #[test]
    fn build_is_deterministic() {
        let engine = MockEngine::new();
        let a = build(&engine, "FROM centos:7\nRUN true\n");
        let b = build(&engine, "FROM centos:7\nRUN true\n");
        assert_eq!(a.last(), b.last());
        assert!(a.last().unwrap().starts_with("Successfully built "));
        assert_eq!(engine.list_images().unwrap().len(), 1);
        assert_eq!(engine.builds().len(), 2);
    }

    #[test]
    fn failing_build_has_no_marker() {
        let engine = MockEngine::new();
        engine.fail_builds_containing("broken");
        let lines = build(&engine, "FROM x\nRUN broken\n");
        assert!(lines.iter().all(|l| !l.starts_with("Successfully built")));
        assert!(engine.list_images().unwrap().is_empty());
    }

    #[test]
    fn job_container_runs_to_exit_code() {
        let engine = MockEngine::new();
        engine.set_exit_code("bad.yml", 2);
        let image = engine.add_image(&["base:1"]);
        let id = engine
            .create_container(&ContainerSpec::new(image.as_str()).cmd(["/run", "bad.yml"]))
            .unwrap();
        engine.start_container(&id).unwrap();

        let mut lines = Vec::new();
        engine.attach(&id, true, &mut |l| lines.push(l.to_owned())).unwrap();
        assert_eq!(lines.len(), 4);
        let info = engine.inspect_container(&id).unwrap();
        assert!(!info.running);
        assert_eq!(info.exit_code, Some(2));
    }

    #[test]
    fn interrupted_attach_keeps_container_running() {
        let engine = MockEngine::new();
        engine.interrupt_attach(2);
        let image = engine.add_image(&[]);
        let id = engine
            .create_container(&ContainerSpec::new(image.as_str()).cmd(["/run"]))
            .unwrap();
        engine.start_container(&id).unwrap();

        let mut lines = Vec::new();
        engine.attach(&id, true, &mut |l| lines.push(l.to_owned())).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(engine.inspect_container(&id).unwrap().running);

        lines.clear();
        engine.attach(&id, true, &mut |l| lines.push(l.to_owned())).unwrap();
        assert_eq!(lines.len(), 2, "logs=true replays earlier output");

        lines.clear();
        engine.attach(&id, false, &mut |l| lines.push(l.to_owned())).unwrap();
        assert_eq!(lines.len(), 2, "logs=false only delivers new output");
        assert!(!engine.inspect_container(&id).unwrap().running);
    }

    #[test]
    fn commit_chains_history() {
        let engine = MockEngine::new();
        let base = engine.add_image(&["base:1"]);
        let id = engine
            .create_container(&ContainerSpec::new(base.as_str()).cmd(["/sync-and-build", "x.yml"]))
            .unwrap();
        let committed = engine.commit_container(&id, "x", "t1").unwrap();
        let history = engine.image_history(&committed).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].created_by, "/sync-and-build x.yml");
        assert_eq!(history[1].id, base.as_str());
        assert_eq!(engine.repo_tags(&committed), vec!["x:t1"]);
    }

    #[test]
    fn tags_move_between_images() {
        let engine = MockEngine::new();
        let a = engine.add_image(&["ldap:t"]);
        let b = engine.add_image(&[]);
        engine.tag_image(&b, "ldap", "t").unwrap();
        assert!(engine.repo_tags(&a).is_empty());
        assert_eq!(engine.repo_tags(&b), vec!["ldap:t"]);
    }

    #[test]
    fn images_in_use_cannot_be_removed() {
        let engine = MockEngine::new();
        let image = engine.add_image(&["vct:1"]);
        let container = engine.run_container(&image).unwrap();
        assert!(engine.remove_image(&image).is_err());
        engine.remove_container(&container, true, true).unwrap();
        engine.remove_image(&image).unwrap();
        assert!(!engine.image_exists(&image));
    }

    #[test]
    fn published_ports_get_host_bindings() {
        let engine = MockEngine::new();
        let image = engine.add_image(&[]);
        let id = engine
            .create_container(&ContainerSpec::new(image.as_str()).publish(873))
            .unwrap();
        let info = engine.inspect_container(&id).unwrap();
        assert_eq!(info.ports[&873][0].host_port, FIRST_HOST_PORT);
        assert_eq!(info.ports[&873][0].host_ip, "0.0.0.0");
    }

    #[test]
    fn archive_and_exec_tar_expose_files() {
        let engine = MockEngine::new();
        let image = engine.add_image(&[]);
        let id = engine.run_container(&image).unwrap();
        engine.put_file(&id, "/coverage/coverage.1", b"{}").unwrap();
        engine.put_file(&id, "/etc/hostname", b"mock").unwrap();

        let archive = engine.get_archive(&id, "/etc/hostname").unwrap();
        let mut tar = tar::Archive::new(&archive[..]);
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["hostname"]);

        let cmd: Vec<String> = ["tar", "-c", "-C", "/coverage", "-f", "-", "."]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let out = engine.exec(&id, &cmd).unwrap();
        assert_eq!(out.exit_code, 0);
        let mut tar = tar::Archive::new(&out.stdout[..]);
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["./coverage.1"]);
    }

    #[test]
    fn networks_have_bridge_and_reject_duplicates() {
        let engine = MockEngine::new();
        let networks = engine.list_networks().unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].gateway.as_deref(), Some(BRIDGE_GATEWAY));

        let id = engine.create_network("test").unwrap();
        assert!(engine.create_network("test").is_err());
        engine.remove_network(&id).unwrap();
        assert!(engine.remove_network(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn injected_create_failures() {
        let engine = MockEngine::new();
        let image = engine.add_image(&[]);
        engine.fail_next_creates(1);
        assert!(engine.create_container(&ContainerSpec::new(image.as_str())).is_err());
        assert!(engine.create_container(&ContainerSpec::new(image.as_str())).is_ok());
    }
}
