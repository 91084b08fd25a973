//! Scoped container helpers and in-container file access.

use crate::concurrency::worker_pool;
use crate::CoreError;
use kiln_engine::{ContainerEngine, ContainerInfo};
use kiln_schema::ContainerId;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

const STOP_TIMEOUT_SECS: u32 = 20;
const CONTAINER_TAR: &str = "/bin/tar";

/// Start `id`, hand its inspected state to `f`, and stop it again on exit.
///
/// A container that disappeared in the meantime counts as stopped. When `f`
/// fails, a stop failure is logged and `f`'s error is returned.
pub fn started_container<T>(
    engine: &dyn ContainerEngine,
    id: &ContainerId,
    f: impl FnOnce(&ContainerInfo) -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    engine.start_container(id)?;
    let result = engine.inspect_container(id).map_err(CoreError::from).and_then(|info| f(&info));

    match engine.stop_container(id, STOP_TIMEOUT_SECS) {
        Ok(()) => result,
        Err(e) if e.is_not_found() => result,
        Err(e) => match result {
            Ok(_) => Err(e.into()),
            Err(original) => {
                warn!("failed to stop container {id}: {e}");
                Err(original)
            }
        },
    }
}

/// Contents of a single file inside a container.
pub fn read_container_file(
    engine: &dyn ContainerEngine,
    id: &ContainerId,
    path: &str,
) -> Result<Vec<u8>, CoreError> {
    let archive = engine.get_archive(id, path)?;
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut ar = tar::Archive::new(archive.as_slice());
    for entry in ar.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == name {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Ok(data);
        }
    }
    Err(CoreError::Engine(kiln_engine::EngineError::NotFound(format!(
        "{path} in container {id}"
    ))))
}

/// Every regular file below `path` inside a container, as (relative name,
/// content) pairs. Runs `tar` inside the container.
pub fn directory_contents(
    engine: &dyn ContainerEngine,
    id: &ContainerId,
    path: &str,
) -> Result<Vec<(String, Vec<u8>)>, CoreError> {
    let cmd: Vec<String> = [CONTAINER_TAR, "-c", "-C", path, "-f", "-", "."]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
    let output = engine.exec(id, &cmd)?;
    if output.exit_code != 0 {
        return Err(CoreError::Command {
            command: cmd.join(" "),
            detail: format!("exited with code {} in container {id}", output.exit_code),
        });
    }

    let mut files = Vec::new();
    let mut ar = tar::Archive::new(output.stdout.as_slice());
    for entry in ar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = entry.path()?.to_string_lossy().into_owned();
        let name = raw.strip_prefix("./").unwrap_or(&raw).to_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.push((name, data));
    }
    Ok(files)
}

/// Run `f`, then remove every container, image and network that appeared
/// while it ran. Removal is best-effort on a pool of `workers` threads;
/// failures are logged. When the engine is not reachable `f` simply runs.
pub fn auto_clean_orphans<T>(
    engine: &dyn ContainerEngine,
    workers: usize,
    f: impl FnOnce() -> T,
) -> T {
    let Ok(before) = Snapshot::take(engine) else {
        return f();
    };

    let result = f();

    match Snapshot::take(engine) {
        Ok(after) => {
            if let Err(e) = before.remove_new(engine, &after, workers) {
                warn!("orphan cleanup failed: {e}");
            }
        }
        Err(e) => warn!("orphan cleanup skipped: {e}"),
    }
    result
}

struct Snapshot {
    containers: BTreeSet<String>,
    images: BTreeSet<String>,
    networks: BTreeSet<String>,
}

impl Snapshot {
    fn take(engine: &dyn ContainerEngine) -> Result<Self, CoreError> {
        Ok(Self {
            containers: engine
                .list_containers(true)?
                .into_iter()
                .map(|c| c.id.into_inner())
                .collect(),
            images: engine
                .list_images()?
                .into_iter()
                .map(|i| i.id.into_inner())
                .collect(),
            networks: engine
                .list_networks()?
                .into_iter()
                .map(|n| n.id.into_inner())
                .collect(),
        })
    }

    fn remove_new(
        &self,
        engine: &dyn ContainerEngine,
        after: &Snapshot,
        workers: usize,
    ) -> Result<(), CoreError> {
        let pool = worker_pool(workers)?;
        let new = |before: &BTreeSet<String>, now: &BTreeSet<String>| -> Vec<String> {
            now.difference(before).cloned().collect()
        };

        let containers = new(&self.containers, &after.containers);
        let images = new(&self.images, &after.images);
        let networks = new(&self.networks, &after.networks);
        debug!(
            "removing {} orphan container(s), {} image(s), {} network(s)",
            containers.len(),
            images.len(),
            networks.len()
        );

        pool.install(|| {
            containers.par_iter().for_each(|id| {
                if let Err(e) = engine.remove_container(&id.as_str().into(), true, true) {
                    warn!("failed to remove orphan container {id}: {e}");
                }
            });
            images.par_iter().for_each(|id| {
                if let Err(e) = engine.remove_image(&id.as_str().into()) {
                    warn!("failed to remove orphan image {id}: {e}");
                }
            });
            networks.par_iter().for_each(|id| {
                if let Err(e) = engine.remove_network(&id.as_str().into()) {
                    warn!("failed to remove orphan network {id}: {e}");
                }
            });
        });
        Ok(())
    }
}
