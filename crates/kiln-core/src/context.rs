//! Build-context assembly.
//!
//! The context archive holds every file of a builder directory, the build
//! script rewritten with resolved secure bases, and the source-tree files
//! named by `# %include` directives under `extra/vct/`.
//!
//! Builder files come first, sorted by name, followed by included files in
//! tracked order. Every member is owned by root with mtime 0, so an
//! unchanged tree always yields the same archive and the engine's layer
//! cache applies.

use crate::source::SourceTree;
use crate::CoreError;
use kiln_schema::{BuildScript, SecureBaseRef};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const BUILD_SCRIPT: &str = "Dockerfile";
pub const IGNORE_FILE: &str = ".dockerignore";
pub const EXTRA_PREFIX: &str = "extra/vct/";

/// An assembled build context.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// The build script as sent, secure bases replaced by image ids.
    pub script: String,
    /// Archive member names, in archive order.
    pub entries: Vec<String>,
    pub archive: Vec<u8>,
}

/// Assemble the context for `builder_dir`. Each `FROM secure:` reference is
/// passed to `resolve`, which returns the image id to build from.
pub fn assemble_context(
    builder_dir: &Path,
    source: &dyn SourceTree,
    resolve: &mut dyn FnMut(&SecureBaseRef) -> Result<String, CoreError>,
) -> Result<BuildContext, CoreError> {
    let text = fs::read_to_string(builder_dir.join(BUILD_SCRIPT))?;
    let parsed = BuildScript::parse(&text)?;
    let script = parsed.render(&mut *resolve)?;

    let local = builder_files(builder_dir)?;
    let mut writer = ContextWriter::new();
    for file in &local {
        match &file.link {
            Some(target) => writer.link(&file.name, file.mode, target)?,
            None if file.name == BUILD_SCRIPT => {
                writer.file(&file.name, file.mode, script.as_bytes())?
            }
            None => writer.file(&file.name, file.mode, &fs::read(&file.path)?)?,
        }
    }

    let includes = parsed.includes();
    if !includes.is_empty() {
        let tracked = source.tracked_files()?;
        let mut added = BTreeSet::new();
        for include in includes {
            for file in resolve_include(include, &tracked)? {
                if !added.insert(file) {
                    continue;
                }
                let path = source.root().join(file);
                let mode = fs::metadata(&path)?.permissions().mode();
                writer.file(&format!("{EXTRA_PREFIX}{file}"), mode, &fs::read(&path)?)?;
            }
        }
    }

    let (entries, archive) = writer.finish()?;
    debug!(
        "assembled context for {} ({} entries, {} bytes)",
        builder_dir.display(),
        entries.len(),
        archive.len()
    );
    Ok(BuildContext {
        script,
        entries,
        archive,
    })
}

/// Tracked files matched by one `# %include` path. A trailing `/` selects a
/// subtree (`/` alone selects everything); otherwise the path must itself be
/// tracked.
fn resolve_include<'a>(include: &str, tracked: &'a [String]) -> Result<Vec<&'a str>, CoreError> {
    if include.split('/').any(|c| c == "..") {
        return Err(CoreError::NotTracked(include.to_owned()));
    }

    let matched: Vec<&str> = if include == "/" {
        tracked.iter().map(String::as_str).collect()
    } else if include.ends_with('/') {
        tracked
            .iter()
            .map(String::as_str)
            .filter(|f| f.starts_with(include))
            .collect()
    } else {
        tracked
            .iter()
            .map(String::as_str)
            .filter(|f| *f == include)
            .collect()
    };

    if matched.is_empty() {
        return Err(CoreError::NotTracked(include.to_owned()));
    }
    Ok(matched)
}

/// A regular file or symlink found under a builder directory.
struct BuilderFile {
    /// Slash-separated name relative to the builder directory.
    name: String,
    path: PathBuf,
    mode: u32,
    link: Option<PathBuf>,
}

/// Every file under `dir`, sorted by name. Directories are descended into
/// but not archived. An ignore file anywhere is an error.
fn builder_files(dir: &Path) -> Result<Vec<BuilderFile>, CoreError> {
    let mut files = Vec::new();
    let mut pending = vec![(String::new(), dir.to_path_buf())];
    while let Some((prefix, current)) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            let name = format!("{prefix}{}", entry.file_name().to_string_lossy());
            let meta = path.symlink_metadata()?;
            let kind = meta.file_type();
            if kind.is_dir() {
                pending.push((format!("{name}/"), path));
                continue;
            }
            if entry.file_name() == IGNORE_FILE {
                return Err(CoreError::IgnoreFileUnsupported(path));
            }
            let link = if kind.is_symlink() {
                Some(fs::read_link(&path)?)
            } else if kind.is_file() {
                None
            } else {
                warn!("leaving {} out of the build context", path.display());
                continue;
            };
            files.push(BuilderFile {
                name,
                path,
                mode: meta.permissions().mode(),
                link,
            });
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Tar writer that stamps every member as root-owned at mtime 0.
struct ContextWriter {
    ar: tar::Builder<Vec<u8>>,
    entries: Vec<String>,
}

impl ContextWriter {
    fn new() -> Self {
        let mut ar = tar::Builder::new(Vec::new());
        ar.follow_symlinks(false);
        Self {
            ar,
            entries: Vec::new(),
        }
    }

    fn header(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_size(size);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header
    }

    fn file(&mut self, name: &str, mode: u32, data: &[u8]) -> Result<(), CoreError> {
        let mut header = Self::header(tar::EntryType::Regular, mode, data.len() as u64);
        header.set_cksum();
        self.ar.append_data(&mut header, name, data)?;
        self.entries.push(name.to_owned());
        Ok(())
    }

    fn link(&mut self, name: &str, mode: u32, target: &Path) -> Result<(), CoreError> {
        let mut header = Self::header(tar::EntryType::Symlink, mode, 0);
        self.ar.append_link(&mut header, name, target)?;
        self.entries.push(name.to_owned());
        Ok(())
    }

    /// Member names in archive order, and the archive itself.
    fn finish(self) -> Result<(Vec<String>, Vec<u8>), CoreError> {
        Ok((self.entries, self.ar.into_inner()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticTree;
    use std::io::Read;

    struct Fixture {
        _dir: tempfile::TempDir,
        builder: PathBuf,
        tree: StaticTree,
    }

    fn fixture(script: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let builder = root.join("testing/docker/builder-vct");
        fs::create_dir_all(builder.join("conf")).unwrap();
        fs::write(builder.join(BUILD_SCRIPT), script).unwrap();
        fs::write(builder.join("conf/rsyncd.conf"), "[vct-mount]\n").unwrap();

        fs::create_dir_all(root.join("ansible/roles")).unwrap();
        fs::write(root.join("ansible/site.yml"), "site").unwrap();
        fs::write(root.join("ansible/roles/main.yml"), "main").unwrap();
        fs::write(root.join("README"), "readme").unwrap();
        fs::write(root.join("untracked.txt"), "x").unwrap();
        let tree = StaticTree::new(
            root,
            ["README", "ansible/site.yml", "ansible/roles/main.yml"],
        );
        Fixture {
            _dir: dir,
            builder,
            tree,
        }
    }

    fn members(archive: &[u8]) -> Vec<(String, u64, u64, String)> {
        let mut ar = tar::Archive::new(archive);
        ar.entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().into_owned();
                let uid = e.header().uid().unwrap();
                let gid = e.header().gid().unwrap();
                let mut body = String::new();
                e.read_to_string(&mut body).unwrap();
                (name, uid, gid, body)
            })
            .collect()
    }

    fn no_secure(_: &SecureBaseRef) -> Result<String, CoreError> {
        panic!("no secure bases expected")
    }

    #[test]
    fn archives_builder_dir_and_includes() {
        let f = fixture("FROM centos:7\n# %include ansible/\n# %include README\nADD extra/vct /vct\n");
        let ctx = assemble_context(&f.builder, &f.tree, &mut no_secure).unwrap();

        assert_eq!(
            ctx.entries,
            vec![
                "Dockerfile",
                "conf/rsyncd.conf",
                "extra/vct/ansible/roles/main.yml",
                "extra/vct/ansible/site.yml",
                "extra/vct/README",
            ]
        );
        for (_, uid, gid, _) in members(&ctx.archive) {
            assert_eq!((uid, gid), (0, 0));
        }
    }

    #[test]
    fn includes_are_deduplicated() {
        let f = fixture("FROM centos:7\n# %include ansible/\n# %include ansible/site.yml\n");
        let ctx = assemble_context(&f.builder, &f.tree, &mut no_secure).unwrap();
        let site = ctx
            .entries
            .iter()
            .filter(|e| e.as_str() == "extra/vct/ansible/site.yml")
            .count();
        assert_eq!(site, 1);
    }

    #[test]
    fn secure_base_is_rewritten_in_archive() {
        let digest = "ab".repeat(32);
        let f = fixture(&format!(
            "FROM secure:centos:centos7:sha256 {digest}:https://example.com/c7.tar.xz\nRUN true\n"
        ));
        let mut seen = Vec::new();
        let ctx = assemble_context(&f.builder, &f.tree, &mut |base: &SecureBaseRef| {
            seen.push(base.url.clone());
            Ok("sha256:0123456789ab".to_owned())
        })
        .unwrap();

        assert_eq!(seen, vec!["https://example.com/c7.tar.xz".to_owned()]);
        assert_eq!(ctx.script, "FROM sha256:0123456789ab\nRUN true");
        let dockerfile = members(&ctx.archive)
            .into_iter()
            .find(|m| m.0 == "Dockerfile")
            .unwrap();
        assert_eq!(dockerfile.3, ctx.script);
    }

    #[test]
    fn untracked_include_is_rejected() {
        let f = fixture("FROM centos:7\n# %include untracked.txt\n");
        let err = assemble_context(&f.builder, &f.tree, &mut no_secure).unwrap_err();
        assert!(matches!(err, CoreError::NotTracked(p) if p == "untracked.txt"));

        let f = fixture("FROM centos:7\n# %include ../etc/passwd\n");
        assert!(assemble_context(&f.builder, &f.tree, &mut no_secure).is_err());
    }

    #[test]
    fn ignore_file_is_rejected() {
        let f = fixture("FROM centos:7\n");
        fs::write(f.builder.join(IGNORE_FILE), "*.pyc\n").unwrap();
        let err = assemble_context(&f.builder, &f.tree, &mut no_secure).unwrap_err();
        assert!(matches!(err, CoreError::IgnoreFileUnsupported(_)));
    }

    #[test]
    fn malformed_secure_digest_fails() {
        let f = fixture("FROM secure:centos:centos7:md5 abc:https://example.com/x.tar\n");
        let err = assemble_context(&f.builder, &f.tree, &mut no_secure).unwrap_err();
        assert!(matches!(err, CoreError::Schema(_)));
    }

    #[test]
    fn members_are_root_owned_at_epoch() {
        let f = fixture("FROM centos:7\n# %include README\n# %include ansible/\n");
        std::os::unix::fs::symlink("rsyncd.conf", f.builder.join("conf/current")).unwrap();
        let ctx = assemble_context(&f.builder, &f.tree, &mut no_secure).unwrap();

        assert_eq!(
            ctx.entries,
            vec![
                "Dockerfile",
                "conf/current",
                "conf/rsyncd.conf",
                "extra/vct/README",
                "extra/vct/ansible/roles/main.yml",
                "extra/vct/ansible/site.yml",
            ]
        );
        let mut ar = tar::Archive::new(&ctx.archive[..]);
        for entry in ar.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mtime().unwrap(), 0);
            assert_eq!((header.uid().unwrap(), header.gid().unwrap()), (0, 0));
            if entry.path().unwrap().ends_with("conf/current") {
                assert_eq!(header.entry_type(), tar::EntryType::Symlink);
                assert_eq!(
                    entry.link_name().unwrap().unwrap().to_string_lossy(),
                    "rsyncd.conf"
                );
            }
        }
    }

    #[test]
    fn archive_is_deterministic() {
        let f = fixture("FROM centos:7\n# %include ansible/\n");
        let a = assemble_context(&f.builder, &f.tree, &mut no_secure).unwrap();
        let b = assemble_context(&f.builder, &f.tree, &mut no_secure).unwrap();
        assert_eq!(a.archive, b.archive);
    }
}
