//! Coverage snapshots left inside containers.

use crate::containers::directory_contents;
use crate::CoreError;
use kiln_engine::ContainerEngine;
use kiln_schema::ContainerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Directory inside a container that holds coverage snapshots.
pub const COVERAGE_DIR: &str = "/coverage";
const SNAPSHOT_PREFIX: &str = "coverage.";

/// One coverage snapshot with file names as seen by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageRecord {
    pub name: String,
    pub lines: BTreeMap<String, BTreeSet<u32>>,
    pub arcs: BTreeMap<String, BTreeSet<(i64, i64)>>,
}

impl CoverageRecord {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.arcs.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    lines: BTreeMap<String, Vec<u32>>,
    #[serde(default)]
    arcs: BTreeMap<String, Vec<(i64, i64)>>,
}

/// Read every `coverage.*` snapshot under [`COVERAGE_DIR`] in `container`.
///
/// A non-empty `filemap` translates in-container paths to host paths;
/// files it does not mention are dropped. Snapshots left empty are skipped.
pub fn get_coverage(
    engine: &dyn ContainerEngine,
    container: &ContainerId,
    filemap: &BTreeMap<String, String>,
) -> Result<Vec<CoverageRecord>, CoreError> {
    let mut records = Vec::new();
    for (name, data) in directory_contents(engine, container, COVERAGE_DIR)? {
        let base = name.rsplit('/').next().unwrap_or(&name);
        if !base.starts_with(SNAPSHOT_PREFIX) {
            continue;
        }
        let snapshot: Snapshot = serde_json::from_slice(&data)?;
        let record = remap(base, snapshot, filemap);
        if record.is_empty() {
            debug!("skipping empty coverage snapshot {name}");
            continue;
        }
        records.push(record);
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

fn remap(name: &str, snapshot: Snapshot, filemap: &BTreeMap<String, String>) -> CoverageRecord {
    let host_name = |file: String| -> Option<String> {
        if filemap.is_empty() {
            Some(file)
        } else {
            filemap.get(&file).cloned()
        }
    };

    let mut record = CoverageRecord {
        name: name.to_owned(),
        ..CoverageRecord::default()
    };
    for (file, lines) in snapshot.lines {
        if let Some(file) = host_name(file) {
            record.lines.entry(file).or_default().extend(lines);
        }
    }
    for (file, arcs) in snapshot.arcs {
        if let Some(file) = host_name(file) {
            record.arcs.entry(file).or_default().extend(arcs);
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_engine::MockEngine;

    fn container_with(files: &[(&str, &str)]) -> (MockEngine, ContainerId) {
        let engine = MockEngine::new();
        let image = engine.add_image(&["hgweb:1"]);
        let id = engine.run_container(&image).unwrap();
        for (path, body) in files {
            engine.put_file(&id, path, body.as_bytes()).unwrap();
        }
        (engine, id)
    }

    #[test]
    fn reads_and_remaps_snapshots() {
        let (engine, id) = container_with(&[
            (
                "/coverage/coverage.hgweb.1",
                r#"{"lines": {"/var/hg/ext/a.py": [3, 1], "/usr/lib/x.py": [7]},
                    "arcs": {"/var/hg/ext/a.py": [[-1, 1], [1, 3]]}}"#,
            ),
            ("/coverage/README", "not a snapshot"),
        ]);
        let filemap = BTreeMap::from([(
            "/var/hg/ext/a.py".to_owned(),
            "hgext/a.py".to_owned(),
        )]);

        let records = get_coverage(&engine, &id, &filemap).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.name, "coverage.hgweb.1");
        assert_eq!(
            record.lines,
            BTreeMap::from([("hgext/a.py".to_owned(), BTreeSet::from([1, 3]))])
        );
        assert_eq!(
            record.arcs["hgext/a.py"],
            BTreeSet::from([(-1, 1), (1, 3)])
        );
    }

    #[test]
    fn empty_filemap_keeps_names() {
        let (engine, id) = container_with(&[(
            "/coverage/coverage.1",
            r#"{"lines": {"/usr/lib/x.py": [7]}}"#,
        )]);
        let records = get_coverage(&engine, &id, &BTreeMap::new()).unwrap();
        assert_eq!(records[0].lines["/usr/lib/x.py"], BTreeSet::from([7]));
        assert!(records[0].arcs.is_empty());
    }

    #[test]
    fn snapshots_emptied_by_filemap_are_skipped() {
        let (engine, id) = container_with(&[
            ("/coverage/coverage.1", r#"{"lines": {"/usr/lib/x.py": [7]}}"#),
            ("/coverage/coverage.2", r#"{}"#),
        ]);
        let filemap = BTreeMap::from([("/other.py".to_owned(), "other.py".to_owned())]);
        assert!(get_coverage(&engine, &id, &filemap).unwrap().is_empty());
    }

    #[test]
    fn malformed_snapshot_is_an_error() {
        let (engine, id) = container_with(&[("/coverage/coverage.1", "{not json")]);
        assert!(matches!(
            get_coverage(&engine, &id, &BTreeMap::new()),
            Err(CoreError::Serialization(_))
        ));
    }
}
