use crate::build::Session;
use crate::containers::auto_clean_orphans;
use crate::coverage::{get_coverage, CoverageRecord};
use crate::import::SecureImporter;
use crate::provision::ProvisionedImage;
use crate::prune::{prune_images, PruneReport};
use crate::scheduler::BuildRequest;
use crate::source::{SourceTree, VcsTree};
use crate::sync::SyncHandle;
use crate::transfer::{FileTransfer, Rsync};
use crate::CoreError;
use kiln_engine::{rollback_on_error, ContainerEngine};
use kiln_schema::{ContainerId, ImageId, ImageSpec, KilnConfig, Role, StartPoint};
use kiln_store::{BuildState, ClobberMarkers, StateStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Central orchestration API.
///
/// Owns the configuration, the state store and the collaborators every
/// operation needs. Operations that create containers run inside a rollback
/// transaction: if they fail, whatever they created is removed again.
pub struct Kiln {
    config: KilnConfig,
    specs: BTreeMap<Role, ImageSpec>,
    engine: Arc<dyn ContainerEngine>,
    store: StateStore,
    clobber: ClobberMarkers,
    source: Arc<dyn SourceTree>,
    transfer: Arc<dyn FileTransfer>,
    importer: SecureImporter,
    verbose: bool,
}

impl Kiln {
    /// Validate `config` and open its state store. The source tree defaults
    /// to the configured VCS checkout and transfers go through `rsync`.
    pub fn new(config: KilnConfig, engine: Arc<dyn ContainerEngine>) -> Result<Self, CoreError> {
        let specs = config.image_specs()?;
        let store = StateStore::open(&config.paths.state_file)?;
        let clobber = ClobberMarkers::new(&config.paths.clobber_dir);
        let source: Arc<dyn SourceTree> =
            Arc::new(VcsTree::new(&config.paths.source_root, config.source.vcs));
        let importer = SecureImporter::new(Duration::from_secs(config.engine.request_timeout_secs));
        debug!(
            "state at {}, {} configured image(s)",
            store.path().display(),
            specs.len()
        );
        Ok(Self {
            config,
            specs,
            engine,
            store,
            clobber,
            source,
            transfer: Arc::new(Rsync),
            importer,
            verbose: false,
        })
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SourceTree>) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_transfer(mut self, transfer: Arc<dyn FileTransfer>) -> Self {
        self.transfer = transfer;
        self
    }

    /// Log streamed build and provisioning output at info level.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn engine(&self) -> &dyn ContainerEngine {
        self.engine.as_ref()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn state(&self) -> BuildState {
        self.store.snapshot()
    }

    /// A session issuing its engine calls through `engine`.
    pub fn session<'a>(&'a self, engine: &'a dyn ContainerEngine) -> Session<'a> {
        Session {
            engine,
            config: &self.config,
            specs: &self.specs,
            store: &self.store,
            clobber: &self.clobber,
            source: self.source.as_ref(),
            transfer: self.transfer.as_ref(),
            importer: &self.importer,
            verbose: self.verbose,
        }
    }

    /// Role to image id for every requested role, building what is missing.
    pub fn build(&self, request: &BuildRequest) -> Result<BTreeMap<Role, ImageId>, CoreError> {
        rollback_on_error(self.engine(), |tx| {
            self.session(tx).ensure_images_built(request)
        })
    }

    pub fn ensure_built(&self, role: &Role, use_last: bool) -> Result<ImageId, CoreError> {
        rollback_on_error(self.engine(), |tx| self.session(tx).ensure_built(role, use_last))
    }

    /// Provision `role` with `script` on top of exactly one of `builder` or
    /// `start_image`.
    pub fn run_ansible(
        &self,
        role: &Role,
        script: &str,
        builder: Option<Role>,
        start_image: Option<ImageId>,
    ) -> Result<ProvisionedImage, CoreError> {
        let start = StartPoint::from_options(builder, start_image)?;
        rollback_on_error(self.engine(), |tx| {
            self.session(tx).run_ansible(role, script, &start, None)
        })
    }

    /// Run `f` with a synchronized content-sync container. See
    /// [`Session::with_content_sync`].
    pub fn ensure_content_sync<T>(
        &self,
        image: Option<ImageId>,
        container: Option<ContainerId>,
        f: impl FnOnce(&SyncHandle) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        rollback_on_error(self.engine(), |tx| {
            self.session(tx).with_content_sync(image, container, f)
        })
    }

    /// Remove stale images of the configured relevant roles.
    pub fn prune(&self) -> Result<PruneReport, CoreError> {
        prune_images(
            self.engine(),
            &self.store,
            &self.config.relevant_roles(),
            self.config.prune.workers,
        )
    }

    pub fn get_coverage(
        &self,
        container: &ContainerId,
        filemap: &BTreeMap<String, String>,
    ) -> Result<Vec<CoverageRecord>, CoreError> {
        get_coverage(self.engine(), container, filemap)
    }

    /// Run `f` and remove every container, image and network it left behind.
    pub fn auto_clean_orphans<T>(&self, f: impl FnOnce(&Self) -> T) -> T {
        auto_clean_orphans(self.engine(), self.config.prune.workers, || f(self))
    }
}
