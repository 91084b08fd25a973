//! Bounded parallel builds of many roles.
//!
//! Missing roles are built on a pool that lives for one call. Provisioned
//! roles that share a builder wait on one memoized build of it, and all
//! provisioning runs share a single content-sync container.

use crate::build::{latest_by_role, sorted_images, Session};
use crate::concurrency::{limited_workers, shutdown_requested, worker_pool};
use crate::sync::SyncHandle;
use crate::CoreError;
use kiln_schema::{builder_role, ImageId, ImageSpec, Role, StartPoint};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{mpsc, Arc, OnceLock};
use tracing::{debug, error, info};

/// Input of [`Session::ensure_images_built`].
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub roles: Vec<Role>,
    /// Images already known per role. Defaults to the state store's cache.
    pub existing: Option<BTreeMap<Role, ImageId>>,
    /// Satisfy missing roles from their newest tagged image without building.
    pub use_last: bool,
    pub max_workers: Option<usize>,
}

impl BuildRequest {
    pub fn new<I, R>(roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Role>,
    {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn existing(mut self, existing: BTreeMap<Role, ImageId>) -> Self {
        self.existing = Some(existing);
        self
    }

    #[must_use]
    pub fn use_last(mut self, use_last: bool) -> Self {
        self.use_last = use_last;
        self
    }

    #[must_use]
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }
}

#[derive(Debug, Clone)]
enum Task {
    Direct(Role),
    Provision {
        role: Role,
        script: String,
        start: TaskStart,
    },
}

impl Task {
    fn role(&self) -> &Role {
        match self {
            Task::Direct(role) | Task::Provision { role, .. } => role,
        }
    }
}

#[derive(Debug, Clone)]
enum TaskStart {
    Image(ImageId),
    /// A shared builder role, already expanded with the builder prefix.
    Builder(Role),
}

type BuilderMemo = BTreeMap<Role, OnceLock<Result<ImageId, Arc<CoreError>>>>;

impl Session<'_> {
    /// Image ids for every requested role, building only what is missing.
    ///
    /// Results are recorded in the state store as each role completes. A
    /// failing role does not stop its siblings; the first failure is
    /// returned once every submitted task has finished.
    pub fn ensure_images_built(
        &self,
        request: &BuildRequest,
    ) -> Result<BTreeMap<Role, ImageId>, CoreError> {
        let requested: BTreeSet<Role> = request.roles.iter().cloned().collect();
        let images = sorted_images(self.engine)?;
        let known: BTreeSet<&ImageId> = images.iter().map(|i| &i.id).collect();

        let mut existing: BTreeMap<Role, ImageId> = request
            .existing
            .clone()
            .unwrap_or_else(|| self.store.snapshot().images)
            .into_iter()
            .filter(|(role, id)| requested.contains(role) && known.contains(id))
            .collect();

        let sync_role = self.sync_role();
        let mut clobbered = BTreeSet::new();
        for role in &requested {
            if self.clobber.clobber_needed(self.store, role)? {
                // The marker is consumed here, so the stale sync container
                // has to go now or it would be restarted below.
                if *role == sync_role {
                    self.discard_recorded_sync();
                }
                existing.remove(role);
                clobbered.insert(role.clone());
            }
        }

        let latest = latest_by_role(&images);
        let mut missing: Vec<Role> = requested
            .iter()
            .filter(|role| !existing.contains_key(*role))
            .cloned()
            .collect();

        if request.use_last && !missing.is_empty() {
            let mut reused = BTreeMap::new();
            missing.retain(|role| match latest.get(role) {
                Some(id) if !clobbered.contains(role) => {
                    reused.insert(role.clone(), id.clone());
                    false
                }
                _ => true,
            });
            if !reused.is_empty() {
                debug!("reusing last images for {} role(s)", reused.len());
                self.store.update(|s| {
                    s.images.extend(reused.clone());
                })?;
                existing.extend(reused);
            }
        }

        if missing.is_empty() {
            debug!("all {} requested image(s) are up to date", requested.len());
            return Ok(existing);
        }

        let tasks = self.plan(&missing, &clobbered, &latest);
        let memo: BuilderMemo = tasks
            .iter()
            .filter_map(|t| match t {
                Task::Provision {
                    start: TaskStart::Builder(builder),
                    ..
                } => Some((builder.clone(), OnceLock::new())),
                _ => None,
            })
            .collect();
        info!(
            "building {} image(s): {}",
            tasks.len(),
            missing
                .iter()
                .map(Role::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let needs_sync = tasks.iter().any(|t| matches!(t, Task::Provision { .. }));
        let built = if needs_sync {
            self.with_content_sync(None, None, |sync| {
                self.run_tasks(&tasks, &memo, Some(sync), request.max_workers)
            })?
        } else {
            self.run_tasks(&tasks, &memo, None, request.max_workers)?
        };

        existing.extend(built);
        Ok(existing)
    }

    /// One task per missing role. A provisioned role starts from its newest
    /// image unless clobbered, then from its configured start point.
    fn plan(
        &self,
        missing: &[Role],
        clobbered: &BTreeSet<Role>,
        latest: &BTreeMap<Role, ImageId>,
    ) -> Vec<Task> {
        let prefix = &self.config.provision.builder_prefix;
        missing
            .iter()
            .map(|role| match self.spec_for(role) {
                ImageSpec::Direct { .. } => Task::Direct(role.clone()),
                ImageSpec::Provisioned { script, start } => {
                    let start = match (latest.get(role), start) {
                        (Some(previous), _) if !clobbered.contains(role) => {
                            TaskStart::Image(previous.clone())
                        }
                        (_, StartPoint::Image(image)) => TaskStart::Image(image),
                        (_, StartPoint::Builder(builder)) => {
                            TaskStart::Builder(builder_role(prefix, &builder))
                        }
                    };
                    Task::Provision {
                        role: role.clone(),
                        script,
                        start,
                    }
                }
            })
            .collect()
    }

    fn run_tasks(
        &self,
        tasks: &[Task],
        memo: &BuilderMemo,
        sync: Option<&SyncHandle>,
        max_workers: Option<usize>,
    ) -> Result<BTreeMap<Role, ImageId>, CoreError> {
        let pool = worker_pool(limited_workers(tasks.len(), max_workers))?;
        let (tx, rx) = mpsc::channel();
        let mut built = BTreeMap::new();
        let mut first_error: Option<CoreError> = None;

        pool.in_place_scope(|scope| {
            for task in tasks {
                if shutdown_requested() {
                    first_error.get_or_insert(CoreError::Interrupted);
                    break;
                }
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let outcome = self.run_task(task, memo, sync);
                    let _ = tx.send((task.role().clone(), outcome));
                });
            }
            drop(tx);

            for (role, outcome) in rx {
                let recorded = outcome.and_then(|image| {
                    self.store.update(|s| {
                        s.images.insert(role.clone(), image.clone());
                        s.last_ids.insert(role.clone(), image.clone());
                    })?;
                    Ok(image)
                });
                match recorded {
                    Ok(image) => {
                        info!("{role} is {image}");
                        built.insert(role, image);
                    }
                    Err(e) => {
                        error!("failed to build {role}: {e}");
                        first_error.get_or_insert(e);
                    }
                }
            }
        });

        let builders: Vec<(Role, ImageId)> = memo
            .iter()
            .filter_map(|(role, cell)| match cell.get() {
                Some(Ok(image)) => Some((role.clone(), image.clone())),
                _ => None,
            })
            .collect();
        if !builders.is_empty() {
            self.store.update(|s| s.last_ids.extend(builders))?;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(built),
        }
    }

    fn run_task(
        &self,
        task: &Task,
        memo: &BuilderMemo,
        sync: Option<&SyncHandle>,
    ) -> Result<ImageId, CoreError> {
        match task {
            Task::Direct(role) => self.shared_builder(role, memo),
            Task::Provision {
                role,
                script,
                start,
            } => {
                let start_image = match start {
                    TaskStart::Image(image) => image.clone(),
                    TaskStart::Builder(builder) => self.shared_builder(builder, memo)?,
                };
                Ok(self
                    .provision_synced(role, script, &start_image, sync)?
                    .image)
            }
        }
    }

    /// Build `builder` at most once per call; concurrent callers block on
    /// the same build and share its outcome. A builder that was also
    /// requested directly goes through the same cell.
    fn shared_builder(&self, builder: &Role, memo: &BuilderMemo) -> Result<ImageId, CoreError> {
        let Some(cell) = memo.get(builder) else {
            return self.ensure_built(builder, false);
        };
        cell.get_or_init(|| self.ensure_built(builder, false).map_err(Arc::new))
            .clone()
            .map_err(CoreError::Shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let request = BuildRequest::new(["hgmaster", "ldap"])
            .use_last(true)
            .max_workers(2);
        assert_eq!(
            request.roles,
            vec![Role::from("hgmaster"), Role::from("ldap")]
        );
        assert!(request.use_last);
        assert_eq!(request.max_workers, Some(2));
        assert!(request.existing.is_none());
    }
}
