//! Provisioning runs: a script executed in a container on top of a start
//! image, committed as a new image for the role.

use crate::build::{emit_output, get_full_image, Session};
use crate::concurrency::shutdown_requested;
use crate::sync::SyncHandle;
use crate::CoreError;
use kiln_engine::{ContainerSpec, HistoryEntry};
use kiln_schema::{builder_role, ContainerId, ImageId, Role, StartPoint};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

/// History ids the engine reports for layers it has no image for.
const MISSING_LAYER: &str = "<missing>";

/// Result of a successful provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedImage {
    pub image: ImageId,
    pub role: Role,
    pub tag: String,
}

/// Where the output stream of a provisioning container stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachState {
    Attached,
    Disconnected,
    Stopped { exit_code: i64 },
}

impl Session<'_> {
    /// Provision `role` by running `script` on top of `start`.
    ///
    /// Without a `sync` handle a content-sync container is acquired for the
    /// duration of the run.
    pub fn run_ansible(
        &self,
        role: &Role,
        script: &str,
        start: &StartPoint,
        sync: Option<&SyncHandle>,
    ) -> Result<ProvisionedImage, CoreError> {
        let start_image = match start {
            StartPoint::Builder(builder) => {
                let builder = builder_role(&self.config.provision.builder_prefix, builder);
                self.ensure_built(&builder, false)?
            }
            StartPoint::Image(image) => image.clone(),
        };
        self.provision_synced(role, script, &start_image, sync)
    }

    pub(crate) fn provision_synced(
        &self,
        role: &Role,
        script: &str,
        start_image: &ImageId,
        sync: Option<&SyncHandle>,
    ) -> Result<ProvisionedImage, CoreError> {
        match sync {
            Some(sync) => self.provision(role, script, start_image, sync),
            None => self.with_content_sync(None, None, |sync| {
                self.provision(role, script, start_image, sync)
            }),
        }
    }

    fn provision(
        &self,
        role: &Role,
        script: &str,
        start_image: &ImageId,
        sync: &SyncHandle,
    ) -> Result<ProvisionedImage, CoreError> {
        let settings = &self.config.provision;
        let start = self.rebase(start_image)?;

        let spec = ContainerSpec::new(start.as_str())
            .cmd([
                settings.entrypoint.clone(),
                format!("{script}{}", settings.script_suffix),
            ])
            .volumes_from(sync.container.as_str());
        let id = self.engine.create_container(&spec)?;
        info!("provisioning {role} from {start} in container {id}");
        self.engine.start_container(&id)?;

        let (exit_code, output) = self.follow_output(role, &id)?;
        if exit_code != 0 {
            // The container stays until the enclosing transaction rolls back.
            for line in &output {
                error!("{role}> {line}");
            }
            return Err(CoreError::ProvisioningFailed {
                role: role.clone(),
                exit_code,
                output,
            });
        }

        let tag = uuid::Uuid::new_v4().to_string();
        let committed = self.engine.commit_container(&id, role.as_str(), &tag)?;
        let image = get_full_image(self.engine, &committed)?;
        if let Err(e) = self.engine.remove_container(&id, true, true) {
            warn!("failed to remove provisioning container {id}: {e}");
        }

        info!("provisioned {role} as {image}");
        Ok(ProvisionedImage {
            image,
            role: role.clone(),
            tag,
        })
    }

    /// Start image to use instead of `image` when its history is too deep.
    fn rebase(&self, image: &ImageId) -> Result<ImageId, CoreError> {
        let settings = &self.config.provision;
        let history = self.engine.image_history(image)?;
        match rebase_target(&history, settings.history_limit, &settings.entrypoint) {
            Some(base) if base != image.as_str() => {
                info!(
                    "{image} has {} layers; rebasing onto {base}",
                    history.len()
                );
                get_full_image(self.engine, base)
            }
            _ => Ok(image.clone()),
        }
    }

    /// Stream the container's output until it stops, re-attaching while the
    /// stream ends early. Returns the exit code and the last output lines.
    fn follow_output(
        &self,
        role: &Role,
        id: &ContainerId,
    ) -> Result<(i64, Vec<String>), CoreError> {
        let settings = &self.config.provision;
        let window_size = settings.output_window.max(1);
        let mut window: VecDeque<String> = VecDeque::with_capacity(window_size);
        let mut seen = 0usize;
        let mut reattached = 0u32;
        let mut state = AttachState::Attached;

        loop {
            state = match state {
                AttachState::Attached => {
                    // Every attach replays the log from the start; skip what
                    // was already shown.
                    let mut index = 0usize;
                    self.engine.attach(id, true, &mut |line: &str| {
                        index += 1;
                        if index <= seen {
                            return;
                        }
                        seen = index;
                        emit_output(self.verbose, role, line);
                        if window.len() == window_size {
                            window.pop_front();
                        }
                        window.push_back(line.to_owned());
                    })?;
                    AttachState::Disconnected
                }
                AttachState::Disconnected => {
                    let info = self.engine.inspect_container(id)?;
                    if !info.running {
                        AttachState::Stopped {
                            exit_code: info.exit_code.unwrap_or(-1),
                        }
                    } else if shutdown_requested() {
                        return Err(CoreError::Interrupted);
                    } else if reattached >= settings.max_reattach {
                        return Err(CoreError::AttachExhausted {
                            role: role.clone(),
                            attempts: reattached,
                        });
                    } else {
                        reattached += 1;
                        debug!("output of {role} ended while {id} is running, re-attaching");
                        AttachState::Attached
                    }
                }
                AttachState::Stopped { exit_code } => {
                    return Ok((exit_code, window.into_iter().collect()));
                }
            };
        }
    }
}

/// The layer a too-deep image should be rebased onto: the oldest ancestor
/// committed by a provisioning run. `None` when the history is within
/// `limit` or holds no provisioning commit.
fn rebase_target<'h>(history: &'h [HistoryEntry], limit: usize, entrypoint: &str) -> Option<&'h str> {
    if history.len() <= limit {
        return None;
    }
    history
        .iter()
        .filter(|h| h.id != MISSING_LAYER)
        .filter(|h| h.created_by.starts_with(entrypoint))
        .last()
        .map(|h| h.id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, created_by: &str) -> HistoryEntry {
        HistoryEntry {
            id: id.to_owned(),
            created_by: created_by.to_owned(),
        }
    }

    fn history() -> Vec<HistoryEntry> {
        vec![
            entry("sha256:c3", "/sync-and-build docker-hgmaster.yml"),
            entry("<missing>", "/sync-and-build docker-hgmaster.yml"),
            entry("sha256:c2", "/sync-and-build docker-hgmaster.yml"),
            entry("sha256:c1", "/sync-and-build docker-hgmaster.yml"),
            entry("sha256:b1", "/bin/sh -c yum install -y ansible"),
            entry("sha256:b0", "/bin/sh -c #(nop) FROM centos:7"),
        ]
    }

    #[test]
    fn shallow_history_is_kept() {
        assert_eq!(rebase_target(&history(), 6, "/sync-and-build"), None);
        assert_eq!(rebase_target(&history(), 120, "/sync-and-build"), None);
    }

    #[test]
    fn deep_history_rebases_onto_oldest_provisioned_layer() {
        assert_eq!(
            rebase_target(&history(), 3, "/sync-and-build"),
            Some("sha256:c1")
        );
    }

    #[test]
    fn deep_history_without_provisioned_layer_is_kept() {
        let builder_only = vec![
            entry("sha256:b1", "/bin/sh -c yum install -y ansible"),
            entry("sha256:b0", "/bin/sh -c #(nop) FROM centos:7"),
        ];
        assert_eq!(rebase_target(&builder_only, 1, "/sync-and-build"), None);
    }
}
