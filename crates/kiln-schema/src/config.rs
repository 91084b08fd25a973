use crate::roles::{ImageSpec, StartPoint};
use crate::types::{ImageId, Role};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config file name, looked up at the source-tree root.
pub const CONFIG_FILE: &str = "kiln.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KilnConfig {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub provision: ProvisionSection,
    #[serde(default)]
    pub prune: PruneSection,
    #[serde(default)]
    pub images: BTreeMap<String, ImageSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PathsSection {
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,
    #[serde(default = "default_builders_dir")]
    pub builders_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_clobber_dir")]
    pub clobber_dir: PathBuf,
    #[serde(default = "default_extra_files_dir")]
    pub extra_files_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            source_root: default_source_root(),
            builders_dir: default_builders_dir(),
            state_file: default_state_file(),
            clobber_dir: default_clobber_dir(),
            extra_files_dir: default_extra_files_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Daemon URL. Falls back to `DOCKER_HOST` when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_min_api_version")]
    pub min_api_version: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            url: None,
            min_api_version: default_min_api_version(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Vcs {
    #[default]
    Hg,
    Git,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SourceSection {
    #[serde(default)]
    pub vcs: Vcs,
    /// File written at the tree root carrying the snapshot identity token.
    #[serde(default = "default_node_file")]
    pub node_file: String,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            vcs: Vcs::default(),
            node_file: default_node_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    #[serde(default = "default_sync_role")]
    pub role: String,
    #[serde(default = "default_sync_port")]
    pub port: u16,
    #[serde(default = "default_sync_mount")]
    pub mount: String,
    #[serde(default = "default_sync_module")]
    pub module: String,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            role: default_sync_role(),
            port: default_sync_port(),
            mount: default_sync_mount(),
            module: default_sync_module(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProvisionSection {
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default = "default_builder_prefix")]
    pub builder_prefix: String,
    #[serde(default = "default_script_suffix")]
    pub script_suffix: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_output_window")]
    pub output_window: usize,
    #[serde(default = "default_max_reattach")]
    pub max_reattach: u32,
}

impl Default for ProvisionSection {
    fn default() -> Self {
        Self {
            entrypoint: default_entrypoint(),
            builder_prefix: default_builder_prefix(),
            script_suffix: default_script_suffix(),
            history_limit: default_history_limit(),
            output_window: default_output_window(),
            max_reattach: default_max_reattach(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PruneSection {
    /// Repositories whose images may be pruned. Empty means every configured
    /// role plus the content-sync role.
    #[serde(default)]
    pub relevant: Vec<String>,
    #[serde(default = "default_prune_workers")]
    pub workers: usize,
}

impl Default for PruneSection {
    fn default() -> Self {
        Self {
            relevant: Vec::new(),
            workers: default_prune_workers(),
        }
    }
}

/// Raw `[images.<role>]` table. Validated into an [`ImageSpec`].
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    /// Builder directory name for a direct build (`builder-<build>`).
    #[serde(default)]
    pub build: Option<String>,
    /// Provisioning script name.
    #[serde(default)]
    pub provision: Option<String>,
    /// Shared builder the provisioning script runs on.
    #[serde(default)]
    pub builder: Option<String>,
    /// Existing image the provisioning script runs on.
    #[serde(default)]
    pub start_image: Option<String>,
}

impl ImageSection {
    pub fn to_spec(&self, role: &str) -> Result<ImageSpec, SchemaError> {
        match (&self.build, &self.provision) {
            (Some(_), Some(_)) => Err(SchemaError::InvalidArgument(format!(
                "image '{role}' sets both 'build' and 'provision'"
            ))),
            (None, None) => Err(SchemaError::InvalidArgument(format!(
                "image '{role}' must set one of 'build' or 'provision'"
            ))),
            (Some(dir), None) => {
                if self.builder.is_some() || self.start_image.is_some() {
                    return Err(SchemaError::InvalidArgument(format!(
                        "image '{role}': 'builder' and 'start_image' only apply to provisioned images"
                    )));
                }
                Ok(ImageSpec::Direct {
                    builder_dir: dir.clone(),
                })
            }
            (None, Some(script)) => {
                let start = StartPoint::from_options(
                    self.builder.as_deref().map(Role::from),
                    self.start_image.as_deref().map(ImageId::from),
                )?;
                Ok(ImageSpec::Provisioned {
                    script: script.clone(),
                    start,
                })
            }
        }
    }
}

impl KilnConfig {
    /// Validated role definitions, keyed by role.
    pub fn image_specs(&self) -> Result<BTreeMap<Role, ImageSpec>, SchemaError> {
        self.images
            .iter()
            .map(|(role, section)| Ok((Role::from(role.as_str()), section.to_spec(role)?)))
            .collect()
    }

    /// Roles whose images the garbage collector may remove.
    pub fn relevant_roles(&self) -> Vec<Role> {
        if !self.prune.relevant.is_empty() {
            return self.prune.relevant.iter().map(|r| Role::from(r.as_str())).collect();
        }
        let mut roles: Vec<Role> = self.images.keys().map(|r| Role::from(r.as_str())).collect();
        roles.push(Role::from(self.sync.role.as_str()));
        roles.sort();
        roles.dedup();
        roles
    }

    /// Rebase every relative path onto `base` (the directory holding the config file).
    #[must_use]
    pub fn rooted_at(mut self, base: &Path) -> Self {
        let root = base.join(&self.paths.source_root);
        self.paths.builders_dir = root.join(&self.paths.builders_dir);
        self.paths.state_file = root.join(&self.paths.state_file);
        self.paths.clobber_dir = root.join(&self.paths.clobber_dir);
        self.paths.extra_files_dir = root.join(&self.paths.extra_files_dir);
        self.paths.source_root = root;
        self
    }
}

fn default_source_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_builders_dir() -> PathBuf {
    PathBuf::from("testing/docker")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("testing/.kiln-state.json")
}

fn default_clobber_dir() -> PathBuf {
    PathBuf::from("testing")
}

fn default_extra_files_dir() -> PathBuf {
    PathBuf::from("extra-files")
}

fn default_min_api_version() -> String {
    "1.22".to_owned()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_node_file() -> String {
    ".vctnode".to_owned()
}

fn default_sync_role() -> String {
    "vct".to_owned()
}

fn default_sync_port() -> u16 {
    873
}

fn default_sync_mount() -> String {
    "/vct-mount".to_owned()
}

fn default_sync_module() -> String {
    "vct-mount".to_owned()
}

fn default_entrypoint() -> String {
    "/sync-and-build".to_owned()
}

fn default_builder_prefix() -> String {
    "ansible-".to_owned()
}

fn default_script_suffix() -> String {
    ".yml".to_owned()
}

fn default_history_limit() -> usize {
    120
}

fn default_output_window() -> usize {
    20
}

fn default_max_reattach() -> u32 {
    1000
}

fn default_prune_workers() -> usize {
    8
}

pub fn parse_config_str(input: &str) -> Result<KilnConfig, SchemaError> {
    let config: KilnConfig = toml::from_str(input)?;
    config.image_specs()?;
    Ok(config)
}

/// Parse a config file and root its relative paths at the file's directory.
pub fn load_config(path: impl AsRef<Path>) -> Result<KilnConfig, SchemaError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let base = path.parent().unwrap_or(Path::new("."));
    Ok(parse_config_str(&content)?.rooted_at(base))
}
