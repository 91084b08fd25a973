#![allow(dead_code)]

use filetime::{set_file_mtime, FileTime};
use kiln_core::{Kiln, RecordingTransfer, StaticTree};
use kiln_engine::{ContainerEngine, EngineCall, MockEngine};
use kiln_schema::{parse_config_str, ImageId, KilnConfig, Role};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CONFIG: &str = r#"
[images.ldap]
build = "ldap"

[images.hgmaster]
provision = "docker-hgmaster"
builder = "centos7"

[images.hgweb]
provision = "docker-hgweb"
builder = "centos7"
"#;

pub const TRACKED: [&str; 3] = ["README", "ansible/docker-hgmaster.yml", "ansible/roles/hg/main.yml"];

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub config: KilnConfig,
    pub engine: Arc<MockEngine>,
    pub transfer: Arc<RecordingTransfer>,
    pub kiln: Kiln,
    pub base: ImageId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(CONFIG)
    }

    pub fn with_config(toml: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_builder(root, "vct", "FROM centos:7\nRUN yum install -y rsync\n");
        write_builder(
            root,
            "ansible-centos7",
            "FROM centos:7\n# %include ansible/\nRUN yum install -y ansible\n",
        );
        write_builder(root, "ldap", "FROM centos:7\nRUN yum install -y openldap-servers\n");
        for file in TRACKED {
            let path = root.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, format!("# {file}\n")).unwrap();
        }

        let config = parse_config_str(toml).unwrap().rooted_at(root);
        let engine = Arc::new(MockEngine::new());
        let base = engine.add_image(&["centos:7"]);
        let transfer = Arc::new(RecordingTransfer::new());
        let kiln = Self::open(&config, &engine, &transfer, root);
        Self {
            dir,
            config,
            engine,
            transfer,
            kiln,
            base,
        }
    }

    fn open(
        config: &KilnConfig,
        engine: &Arc<MockEngine>,
        transfer: &Arc<RecordingTransfer>,
        root: &Path,
    ) -> Kiln {
        Kiln::new(config.clone(), engine.clone())
            .unwrap()
            .with_source(Arc::new(StaticTree::new(root, TRACKED)))
            .with_transfer(transfer.clone())
    }

    /// A fresh `Kiln` over the same state file and engine, as a second
    /// invocation would see them.
    pub fn reopen(&self) -> Kiln {
        Self::open(&self.config, &self.engine, &self.transfer, self.dir.path())
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn builder_dir(&self, name: &str) -> PathBuf {
        self.root().join("testing/docker").join(format!("builder-{name}"))
    }

    /// Create or move the clobber marker of `role` to `secs`.
    pub fn touch_clobber(&self, role: &str, secs: i64) {
        let path = self.root().join("testing").join(format!("clobber.{role}"));
        fs::write(&path, b"").unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    pub fn builds_containing(&self, needle: &str) -> usize {
        self.engine
            .builds()
            .iter()
            .filter(|script| script.contains(needle))
            .count()
    }

    /// Image each provisioning container for `script` was created from.
    pub fn provision_starts(&self, script: &str) -> Vec<String> {
        self.engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::CreateContainer { image, cmd } if cmd.join(" ").contains(script) => {
                    Some(image)
                }
                _ => None,
            })
            .collect()
    }

    pub fn containers(&self) -> usize {
        self.engine.list_containers(true).unwrap().len()
    }

    pub fn last_id(&self, role: &str) -> ImageId {
        self.kiln.state().last_ids[&Role::from(role)].clone()
    }
}

pub fn write_builder(root: &Path, name: &str, dockerfile: &str) {
    let dir = root.join("testing/docker").join(format!("builder-{name}"));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("Dockerfile"), dockerfile).unwrap();
}
