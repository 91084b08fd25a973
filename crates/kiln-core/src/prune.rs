//! Removal of stale role images.

use crate::build::get_full_image;
use crate::concurrency::{limited_workers, worker_pool};
use crate::CoreError;
use kiln_engine::ContainerEngine;
use kiln_schema::{ImageId, Role};
use kiln_store::StateStore;
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Outcome of a prune.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<(Role, ImageId)>,
    pub failed: Vec<(ImageId, String)>,
}

/// Remove images tagged with one of the `relevant` roles.
///
/// Images backing a running container and images recorded as last used in
/// the store are kept. Each removal runs independently on a pool of at most
/// `workers` threads. Removed ids are dropped from the store's image cache.
pub fn prune_images(
    engine: &dyn ContainerEngine,
    store: &StateStore,
    relevant: &[Role],
    workers: usize,
) -> Result<PruneReport, CoreError> {
    let running: BTreeSet<ImageId> = engine
        .list_containers(false)?
        .into_iter()
        .filter(|c| c.running)
        .map(|c| get_full_image(engine, &c.image))
        .collect::<Result<_, _>>()?;
    let protected: BTreeSet<ImageId> = store.snapshot().protected_images().into_iter().collect();

    let targets: Vec<(Role, ImageId)> = engine
        .list_images()?
        .into_iter()
        .filter(|i| !running.contains(&i.id) && !protected.contains(&i.id))
        .filter_map(|i| {
            let role = i
                .repositories()
                .find(|repo| relevant.iter().any(|r| r == repo))
                .map(Role::from)?;
            Some((role, i.id))
        })
        .collect();

    debug!(
        "{} running and {} protected image(s) kept",
        running.len(),
        protected.len()
    );
    if targets.is_empty() {
        info!("no images to prune");
        return Ok(PruneReport::default());
    }

    let pool = worker_pool(limited_workers(targets.len(), Some(workers)))?;
    let outcomes: Vec<(Role, ImageId, Result<(), String>)> = pool.install(|| {
        targets
            .into_par_iter()
            .map(|(role, id)| {
                let outcome = match engine.remove_image(&id) {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(e.to_string()),
                };
                (role, id, outcome)
            })
            .collect()
    });

    let mut report = PruneReport::default();
    for (role, id, outcome) in outcomes {
        match outcome {
            Ok(()) => {
                debug!("removed {role} image {id}");
                report.removed.push((role, id));
            }
            Err(reason) => {
                warn!("failed to remove {role} image {id}: {reason}");
                report.failed.push((id, reason));
            }
        }
    }

    let removed: BTreeSet<&ImageId> = report.removed.iter().map(|(_, id)| id).collect();
    store.update(|s| s.images.retain(|_, id| !removed.contains(&*id)))?;
    info!(
        "pruned {} image(s), {} failure(s)",
        report.removed.len(),
        report.failed.len()
    );
    Ok(report)
}
