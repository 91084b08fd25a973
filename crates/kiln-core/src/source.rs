//! Access to the outer source tree: tracked files and a snapshot token.

use crate::CoreError;
use kiln_schema::Vcs;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// The tree whose files are synced into containers and pulled into build
/// contexts by `# %include`.
pub trait SourceTree: Send + Sync {
    fn root(&self) -> &Path;

    /// Version-controlled files, relative to [`root`](Self::root) with `/`
    /// separators. Files deleted from the working copy are omitted.
    fn tracked_files(&self) -> Result<Vec<String>, CoreError>;

    /// A stable identity token for the current snapshot of the tree.
    fn snapshot_id(&self) -> Result<String, CoreError>;
}

/// A working copy managed by Mercurial or Git.
#[derive(Debug, Clone)]
pub struct VcsTree {
    root: PathBuf,
    vcs: Vcs,
}

impl VcsTree {
    pub fn new(root: impl Into<PathBuf>, vcs: Vcs) -> Self {
        Self {
            root: root.into(),
            vcs,
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String, CoreError> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.root);
        if self.vcs == Vcs::Hg {
            cmd.env("HGRCPATH", "/dev/null").env("HGPLAIN", "1");
        }
        debug!("running {program} {}", args.join(" "));
        let output = cmd.output().map_err(|e| CoreError::Command {
            command: format!("{program} {}", args.join(" ")),
            detail: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(CoreError::Command {
                command: format!("{program} {}", args.join(" ")),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl SourceTree for VcsTree {
    fn root(&self) -> &Path {
        &self.root
    }

    fn tracked_files(&self) -> Result<Vec<String>, CoreError> {
        let listing = match self.vcs {
            Vcs::Hg => self.run("hg", &["-R", ".", "locate"])?,
            Vcs::Git => self.run("git", &["ls-files"])?,
        };
        Ok(listing
            .lines()
            .filter(|f| !f.is_empty() && self.root.join(f).exists())
            .map(str::to_owned)
            .collect())
    }

    fn snapshot_id(&self) -> Result<String, CoreError> {
        let out = match self.vcs {
            Vcs::Hg => self.run("hg", &["log", "-r", ".", "-T", "{node}"])?,
            Vcs::Git => self.run("git", &["rev-parse", "HEAD"])?,
        };
        Ok(out.trim().to_owned())
    }
}

/// A tree with an explicit file list, for tests and trees without a VCS.
#[derive(Debug, Clone)]
pub struct StaticTree {
    root: PathBuf,
    files: Vec<String>,
}

impl StaticTree {
    pub fn new<I, S>(root: impl Into<PathBuf>, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut files: Vec<String> = files.into_iter().map(Into::into).collect();
        files.sort();
        files.dedup();
        Self {
            root: root.into(),
            files,
        }
    }
}

impl SourceTree for StaticTree {
    fn root(&self) -> &Path {
        &self.root
    }

    fn tracked_files(&self) -> Result<Vec<String>, CoreError> {
        Ok(self
            .files
            .iter()
            .filter(|f| self.root.join(f).exists())
            .cloned()
            .collect())
    }

    /// BLAKE3 over every tracked path and its content.
    fn snapshot_id(&self) -> Result<String, CoreError> {
        let mut hasher = blake3::Hasher::new();
        for f in self.tracked_files()? {
            hasher.update(f.as_bytes());
            hasher.update(&[0]);
            hasher.update(&fs::read(self.root.join(&f))?);
            hasher.update(&[0]);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// Write the snapshot token to `<root>/<node_file>`.
pub fn write_node_file(source: &dyn SourceTree, node_file: &str) -> Result<String, CoreError> {
    let node = source.snapshot_id()?;
    fs::write(source.root().join(node_file), format!("{node}\n"))?;
    Ok(node)
}

/// Sorted list of files mirrored into the content-sync container: tracked
/// files, the top-level entries of `extra_files_dir`, and the node file.
pub fn sync_file_list(
    source: &dyn SourceTree,
    extra_files_dir: &Path,
    node_file: &str,
) -> Result<Vec<String>, CoreError> {
    let mut files: BTreeSet<String> = source.tracked_files()?.into_iter().collect();

    if extra_files_dir.is_dir() {
        let rel_dir = extra_files_dir
            .strip_prefix(source.root())
            .unwrap_or(extra_files_dir)
            .to_string_lossy()
            .into_owned();
        for entry in fs::read_dir(extra_files_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            files.insert(format!("{rel_dir}/{name}"));
        }
    }

    let mut list: Vec<String> = files.into_iter().filter(|f| f != node_file).collect();
    list.push(node_file.to_owned());
    Ok(list)
}
