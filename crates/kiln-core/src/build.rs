//! The per-role build state machine.

use crate::context::assemble_context;
use crate::import::SecureImporter;
use crate::source::SourceTree;
use crate::transfer::FileTransfer;
use crate::CoreError;
use kiln_engine::{ContainerEngine, ImageSummary};
use kiln_schema::{
    builder_dir_name, split_repo_tag, ImageId, ImageSpec, KilnConfig, Role, SecureBaseRef,
};
use kiln_store::{ClobberMarkers, StateStore};
use std::collections::BTreeMap;
use tracing::{debug, info};

const SUCCESS_MARKER: &str = "Successfully built ";

/// Everything one orchestration call works with.
///
/// `engine` is usually a rollback transaction, so every container and
/// network created through a session belongs to the calling scope.
pub struct Session<'a> {
    pub(crate) engine: &'a dyn ContainerEngine,
    pub(crate) config: &'a KilnConfig,
    pub(crate) specs: &'a BTreeMap<Role, ImageSpec>,
    pub(crate) store: &'a StateStore,
    pub(crate) clobber: &'a ClobberMarkers,
    pub(crate) source: &'a dyn SourceTree,
    pub(crate) transfer: &'a dyn FileTransfer,
    pub(crate) importer: &'a SecureImporter,
    pub(crate) verbose: bool,
}

impl Session<'_> {
    pub fn engine(&self) -> &dyn ContainerEngine {
        self.engine
    }

    /// How `role` is produced. Roles without an `[images]` entry (builders,
    /// the content-sync role) build from `builder-<role>`.
    pub fn spec_for(&self, role: &Role) -> ImageSpec {
        self.specs
            .get(role)
            .cloned()
            .unwrap_or_else(|| ImageSpec::Direct {
                builder_dir: role.to_string(),
            })
    }

    /// Return an up-to-date image for `role`, building it if necessary.
    ///
    /// With `use_last`, the newest image tagged with the role is returned
    /// without building. Otherwise the context is assembled and submitted;
    /// the engine's layer cache makes an unchanged context cheap. A build
    /// whose log lacks the success marker fails with
    /// [`CoreError::BuildFailed`].
    pub fn ensure_built(&self, role: &Role, use_last: bool) -> Result<ImageId, CoreError> {
        if use_last {
            if let Some(image) = self.last_tagged(role)? {
                debug!("reusing last {role} image {image}");
                return Ok(image);
            }
        }

        let builder_dir = match self.spec_for(role) {
            ImageSpec::Direct { builder_dir } => builder_dir,
            ImageSpec::Provisioned { .. } => role.to_string(),
        };
        let dir = self
            .config
            .paths
            .builders_dir
            .join(builder_dir_name(&builder_dir));
        if !dir.is_dir() {
            return Err(CoreError::UnknownBuilder {
                role: role.clone(),
                path: dir,
            });
        }

        let context = assemble_context(&dir, self.source, &mut |base: &SecureBaseRef| {
            self.importer
                .import(self.engine, base)
                .map(ImageId::into_inner)
        })?;
        info!("building {role}");

        let mut built: Option<String> = None;
        self.engine.build_image(&context.archive, &mut |line: &str| {
            emit_output(self.verbose, role, line);
            if built.is_none() {
                built = parse_success(line).map(str::to_owned);
            }
        })?;
        let Some(short) = built else {
            return Err(CoreError::BuildFailed { role: role.clone() });
        };

        let full = get_full_image(self.engine, &short)?;

        // Tag once. The cache matches on image id; the tag only records
        // that the image belongs to this role.
        let have_tag = self
            .engine
            .list_images()?
            .iter()
            .find(|i| i.id == full)
            .is_some_and(|i| i.repositories().any(|r| r == role.as_str()));
        if !have_tag {
            let tag = uuid::Uuid::new_v4().to_string();
            self.engine.tag_image(&full, role.as_str(), &tag)?;
            debug!("tagged {full} as {role}:{tag}");
        }

        info!("built {role} as {full}");
        Ok(full)
    }

    /// Newest image tagged with repository `role`.
    pub fn last_tagged(&self, role: &Role) -> Result<Option<ImageId>, CoreError> {
        Ok(latest_by_role(&sorted_images(self.engine)?).remove(role))
    }
}

/// Extract the short id from a `Successfully built <12 hex>` line.
fn parse_success(line: &str) -> Option<&str> {
    let short = line.trim_end().strip_prefix(SUCCESS_MARKER)?;
    (short.len() == 12 && short.bytes().all(|b| b.is_ascii_hexdigit())).then_some(short)
}

/// Log one line of streamed output for `role`.
pub(crate) fn emit_output(verbose: bool, role: &Role, line: &str) {
    if verbose {
        info!("{role}> {line}");
    } else {
        debug!("{role}> {line}");
    }
}

/// Images, newest first.
pub fn sorted_images(engine: &dyn ContainerEngine) -> Result<Vec<ImageSummary>, CoreError> {
    let mut images = engine.list_images()?;
    images.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(images)
}

/// Newest image per repository, from a newest-first list.
pub fn latest_by_role(images: &[ImageSummary]) -> BTreeMap<Role, ImageId> {
    let mut latest = BTreeMap::new();
    for image in images {
        for repo_tag in &image.repo_tags {
            let (repo, _) = split_repo_tag(repo_tag);
            latest
                .entry(Role::from(repo))
                .or_insert_with(|| image.id.clone());
        }
    }
    latest
}

/// Expand a short or bare id to the full id the engine reports. Unknown ids
/// are returned unchanged.
pub fn get_full_image(engine: &dyn ContainerEngine, image: &str) -> Result<ImageId, CoreError> {
    let wanted = image.strip_prefix("sha256:").unwrap_or(image);
    for summary in engine.list_images()? {
        let bare = summary.id.bare();
        if bare == wanted || (wanted.len() == 12 && bare.starts_with(wanted)) {
            return Ok(summary.id);
        }
    }
    Ok(ImageId::from(image))
}
