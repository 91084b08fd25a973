//! CLI subprocess integration tests.
//!
//! These tests invoke the `kiln` binary as a subprocess and verify exit
//! codes, stdout content, and JSON output. None of them needs a running
//! container daemon: engine-backed commands are pointed at a closed port.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const UNREACHABLE_ENGINE: &str = r#"
[engine]
url = "tcp://127.0.0.1:1"
request_timeout_secs = 2
"#;

const IMAGES: &str = r#"
[images.ldap]
build = "ldap"

[images.hgmaster]
provision = "docker-hgmaster"
builder = "centos7"
"#;

fn kiln_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_kiln"));
    cmd.env_remove("DOCKER_HOST").env_remove("KILN_LOG");
    cmd
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("kiln.toml");
    std::fs::write(&path, body).unwrap();
    path
}

fn run(config: &Path, args: &[&str]) -> Output {
    kiln_bin()
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .unwrap()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn cli_version_exits_zero() {
    let output = kiln_bin().arg("--version").output().unwrap();
    assert!(output.status.success(), "kiln --version must exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("kiln"), "version output must name kiln: {stdout}");
}

#[test]
fn cli_help_lists_commands() {
    let output = kiln_bin().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["build", "prune", "coverage", "state", "doctor"] {
        assert!(stdout.contains(command), "help must list '{command}': {stdout}");
    }
}

#[test]
fn cli_state_json_prints_document() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &format!("[paths]\nstate_file = \"state.json\"\n{IMAGES}"),
    );
    std::fs::write(
        dir.path().join("state.json"),
        r#"{"images": {"ldap": "sha256:aaaa"}, "last-ldap-id": "sha256:aaaa", "vct-cid": "c1"}"#,
    )
    .unwrap();

    let output = run(&config, &["--json", "state"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["images"]["ldap"], "sha256:aaaa");
    assert_eq!(doc["last-ldap-id"], "sha256:aaaa");
    assert_eq!(doc["content-sync-container-id"], "c1");
}

#[test]
fn cli_state_without_document_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), IMAGES);

    let output = run(&config, &["state"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("no images recorded"), "got: {stdout}");
    assert!(
        !dir.path().join("testing/.kiln-state.json").exists(),
        "reading state must not create the document"
    );
}

#[test]
fn cli_missing_config_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&dir.path().join("absent.toml"), &["state"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("failed to read config file"));
}

#[test]
fn cli_ambiguous_start_point_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[images.hgweb]
provision = "docker-hgweb"
builder = "centos7"
start_image = "sha256:abc"
"#,
    );
    let output = run(&config, &["state"]);
    assert_eq!(output.status.code(), Some(2), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("invalid argument"));
}

#[test]
fn cli_unknown_config_key_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[sync]\nrole = \"vct\"\nbogus = 1\n");
    let output = run(&config, &["state"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_corrupt_state_exits_3() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[paths]\nstate_file = \"state.json\"\n");
    std::fs::write(dir.path().join("state.json"), "{truncated").unwrap();

    let output = run(&config, &["state"]);
    assert_eq!(output.status.code(), Some(3), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("corrupt"));
}

#[test]
fn cli_build_without_engine_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &format!("{UNREACHABLE_ENGINE}{IMAGES}"));

    let output = run(&config, &["--json", "build", "ldap", "--max-workers", "2"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr(&output).contains("container engine unavailable"),
        "stderr: {}",
        stderr(&output)
    );
    assert!(output.stdout.is_empty());
}

#[test]
fn cli_build_rejects_bad_worker_count() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), IMAGES);
    let output = run(&config, &["build", "--max-workers", "many"]);
    assert!(!output.status.success());
}

#[test]
fn cli_prune_without_engine_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), UNREACHABLE_ENGINE);
    let output = run(&config, &["prune"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cli_coverage_bad_filemap_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), UNREACHABLE_ENGINE);
    let filemap = dir.path().join("filemap.json");
    std::fs::write(&filemap, "not json").unwrap();

    let output = run(
        &config,
        &["coverage", "c1", "--filemap", &filemap.to_string_lossy()],
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("invalid filemap"));
}

#[test]
fn cli_doctor_json_reports_unreachable_engine() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &format!("{UNREACHABLE_ENGINE}{IMAGES}"));

    let output = run(&config, &["--json", "doctor"]);
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["healthy"], false);

    let checks = report["checks"].as_array().unwrap();
    let status = |name: &str| {
        checks
            .iter()
            .find(|c| c["name"] == name)
            .map(|c| c["status"].as_str().unwrap_or_default().to_owned())
    };
    assert_eq!(status("config").as_deref(), Some("pass"));
    assert_eq!(status("engine").as_deref(), Some("fail"));
    assert_eq!(status("state").as_deref(), Some("pass"));
    assert_eq!(status("state_lock").as_deref(), Some("pass"));
}

#[test]
fn cli_doctor_reports_broken_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[images.x]\n");

    let output = run(&config, &["--json", "doctor"]);
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let checks = report["checks"].as_array().unwrap();
    assert!(checks
        .iter()
        .any(|c| c["name"] == "config" && c["status"] == "fail"));
    assert!(!checks.iter().any(|c| c["name"] == "state"));
}
