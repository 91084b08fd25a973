use crate::engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerSummary, EngineVersion, ExecOutput,
    HistoryEntry, ImageSummary, NetworkSummary,
};
use crate::EngineError;
use kiln_schema::{ContainerId, ImageId, NetworkId};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Engine wrapper that remembers every container and network created
/// through it, so a failed scope can tear them down again.
///
/// Resources removed through the wrapper are forgotten. Everything else is
/// delegated unchanged.
pub struct Transaction<'a> {
    inner: &'a dyn ContainerEngine,
    containers: Mutex<Vec<ContainerId>>,
    networks: Mutex<Vec<NetworkId>>,
}

impl<'a> Transaction<'a> {
    pub fn new(inner: &'a dyn ContainerEngine) -> Self {
        Self {
            inner,
            containers: Mutex::new(Vec::new()),
            networks: Mutex::new(Vec::new()),
        }
    }

    pub fn created_containers(&self) -> Vec<ContainerId> {
        lock(&self.containers).clone()
    }

    pub fn created_networks(&self) -> Vec<NetworkId> {
        lock(&self.networks).clone()
    }

    /// Remove every tracked container (forcefully, with volumes) and network.
    ///
    /// Every resource is attempted; failures are logged and skipped.
    pub fn rollback(&self) {
        let containers = std::mem::take(&mut *lock(&self.containers));
        let networks = std::mem::take(&mut *lock(&self.networks));
        if containers.is_empty() && networks.is_empty() {
            return;
        }
        debug!(
            "rolling back {} container(s) and {} network(s)",
            containers.len(),
            networks.len()
        );

        for id in &containers {
            match self.inner.remove_container(id, true, true) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("rollback: failed to remove container {id}: {e}"),
            }
        }
        for id in &networks {
            match self.inner.remove_network(id) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("rollback: failed to remove network {id}: {e}"),
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` against a [`Transaction`] over `engine`. When `f` fails, every
/// container and network it created is removed before the original error
/// is returned unchanged.
pub fn rollback_on_error<T, E>(
    engine: &dyn ContainerEngine,
    f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
) -> Result<T, E> {
    let tx = Transaction::new(engine);
    let result = f(&tx);
    if result.is_err() {
        tx.rollback();
    }
    result
}

impl ContainerEngine for Transaction<'_> {
    fn version(&self) -> Result<EngineVersion, EngineError> {
        self.inner.version()
    }

    fn daemon_host(&self) -> String {
        self.inner.daemon_host()
    }

    fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        self.inner.list_images()
    }

    fn image_history(&self, image: &ImageId) -> Result<Vec<HistoryEntry>, EngineError> {
        self.inner.image_history(image)
    }

    fn import_image(
        &self,
        archive: &Path,
        repository: &str,
        tag: &str,
    ) -> Result<ImageId, EngineError> {
        self.inner.import_image(archive, repository, tag)
    }

    fn build_image(
        &self,
        context: &[u8],
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError> {
        self.inner.build_image(context, on_line)
    }

    fn tag_image(&self, image: &ImageId, repository: &str, tag: &str) -> Result<(), EngineError> {
        self.inner.tag_image(image, repository, tag)
    }

    fn remove_image(&self, image: &ImageId) -> Result<(), EngineError> {
        self.inner.remove_image(image)
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        let id = self.inner.create_container(spec)?;
        lock(&self.containers).push(id.clone());
        Ok(id)
    }

    fn start_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.inner.start_container(id)
    }

    fn stop_container(&self, id: &ContainerId, timeout_secs: u32) -> Result<(), EngineError> {
        self.inner.stop_container(id, timeout_secs)
    }

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo, EngineError> {
        self.inner.inspect_container(id)
    }

    fn remove_container(
        &self,
        id: &ContainerId,
        force: bool,
        volumes: bool,
    ) -> Result<(), EngineError> {
        self.inner.remove_container(id, force, volumes)?;
        lock(&self.containers).retain(|c| c != id);
        Ok(())
    }

    fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        self.inner.list_containers(all)
    }

    fn attach(
        &self,
        id: &ContainerId,
        logs: bool,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError> {
        self.inner.attach(id, logs, on_line)
    }

    fn exec(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecOutput, EngineError> {
        self.inner.exec(id, cmd)
    }

    fn commit_container(
        &self,
        id: &ContainerId,
        repository: &str,
        tag: &str,
    ) -> Result<ImageId, EngineError> {
        self.inner.commit_container(id, repository, tag)
    }

    fn get_archive(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>, EngineError> {
        self.inner.get_archive(id, path)
    }

    fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError> {
        self.inner.list_networks()
    }

    fn create_network(&self, name: &str) -> Result<NetworkId, EngineError> {
        let id = self.inner.create_network(name)?;
        lock(&self.networks).push(id.clone());
        Ok(id)
    }

    fn remove_network(&self, id: &NetworkId) -> Result<(), EngineError> {
        self.inner.remove_network(id)?;
        lock(&self.networks).retain(|n| n != id);
        Ok(())
    }
}
