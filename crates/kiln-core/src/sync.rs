//! The content-sync container.
//!
//! A long-lived container holding a mirror of the source tree on a volume.
//! Provisioning containers mount that volume, so every build in one call
//! sees the same snapshot of the tree.

use crate::build::Session;
use crate::containers::started_container;
use crate::source::{sync_file_list, write_node_file};
use crate::wait::host_endpoint;
use crate::CoreError;
use kiln_engine::{ContainerInfo, ContainerSpec};
use kiln_schema::{ContainerId, ImageId, Role};
use tracing::{debug, info, warn};

/// How the sync container of a [`SyncHandle`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Passed in by the caller, already running and synchronized.
    Supplied,
    /// The container recorded in the state store, restarted and resynced.
    Restarted,
    /// Freshly created from the sync image.
    Created,
}

/// A running content-sync container.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    pub container: ContainerId,
    pub name: String,
    pub info: ContainerInfo,
    pub mode: SyncMode,
}

impl SyncHandle {
    fn new(info: ContainerInfo, mode: SyncMode) -> Self {
        Self {
            container: info.id.clone(),
            name: info.name.clone(),
            info,
            mode,
        }
    }
}

impl Session<'_> {
    pub fn sync_role(&self) -> Role {
        Role::from(self.config.sync.role.as_str())
    }

    /// Run `f` with a running, synchronized content-sync container.
    ///
    /// A supplied `container` is used as-is and must be running. Otherwise
    /// the recorded container is restarted, or a new one is created from
    /// `image` (built from the sync role when `None`). A touched clobber
    /// marker for the sync role skips the recorded container. Restarted and
    /// created containers are synced before `f` runs and stopped after it.
    pub fn with_content_sync<T>(
        &self,
        image: Option<ImageId>,
        container: Option<ContainerId>,
        f: impl FnOnce(&SyncHandle) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        if let Some(id) = container {
            let info = self.engine.inspect_container(&id)?;
            if !info.running {
                return Err(CoreError::ContainerStopped(id));
            }
            debug!("using supplied content-sync container {id}");
            return f(&SyncHandle::new(info, SyncMode::Supplied));
        }

        let role = self.sync_role();
        if self.clobber.clobber_needed(self.store, &role)? {
            self.discard_recorded_sync();
        } else if let Some(id) = self.recorded_sync_container()? {
            debug!("restarting content-sync container {id}");
            return self.run_synced(&id, SyncMode::Restarted, None, f);
        }

        let image = match image {
            Some(image) => image,
            None => self.ensure_built(&role, false)?,
        };
        let spec = ContainerSpec::new(image.as_str())
            .volume(self.config.sync.mount.as_str())
            .publish(self.config.sync.port)
            .label(role.as_str(), "");
        let id = self.engine.create_container(&spec)?;
        info!("created content-sync container {id} from {image}");
        self.run_synced(&id, SyncMode::Created, Some(image), f)
    }

    /// The recorded sync container if it still exists. A vanished container
    /// is forgotten.
    fn recorded_sync_container(&self) -> Result<Option<ContainerId>, CoreError> {
        let Some(id) = self.store.snapshot().sync_container else {
            return Ok(None);
        };
        match self.engine.inspect_container(&id) {
            Ok(_) => Ok(Some(id)),
            Err(e) if e.is_not_found() => {
                debug!("recorded content-sync container {id} no longer exists");
                self.store.update(|s| s.sync_container = None)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn discard_recorded_sync(&self) {
        let Some(id) = self.store.snapshot().sync_container else {
            return;
        };
        match self.engine.remove_container(&id, true, true) {
            Ok(()) => debug!("removed clobbered content-sync container {id}"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("failed to remove clobbered content-sync container {id}: {e}"),
        }
    }

    fn run_synced<T>(
        &self,
        id: &ContainerId,
        mode: SyncMode,
        image: Option<ImageId>,
        f: impl FnOnce(&SyncHandle) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        started_container(self.engine, id, |info| {
            self.sync_sources(info)?;
            let role = self.sync_role();
            self.store.update(|s| {
                s.sync_container = Some(id.clone());
                if let Some(image) = image {
                    s.last_ids.insert(role, image);
                }
            })?;
            f(&SyncHandle::new(info.clone(), mode))
        })
    }

    /// Mirror the source tree into the container's rsync module.
    fn sync_sources(&self, info: &ContainerInfo) -> Result<(), CoreError> {
        let (host, port) = host_endpoint(self.engine, info, self.config.sync.port)?;
        let url = format!("rsync://{host}:{port}/{}/", self.config.sync.module);

        let node_file = &self.config.source.node_file;
        let node = write_node_file(self.source, node_file)?;
        let files = sync_file_list(self.source, &self.config.paths.extra_files_dir, node_file)?;
        info!("syncing {} files at {node} to {url}", files.len());
        self.transfer.push(self.source.root(), &files, &url)
    }
}
