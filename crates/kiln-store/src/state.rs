use crate::{fsync_dir, StoreError};
use kiln_schema::{ContainerId, ImageId, Role};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use tracing::debug;

const IMAGES_KEY: &str = "images";
const SYNC_CONTAINER_KEY: &str = "content-sync-container-id";
const LEGACY_SYNC_CONTAINER_KEY: &str = "vct-cid";
const CLOBBER_PREFIX: &str = "clobber-";
const LAST_PREFIX: &str = "last-";
const LAST_SUFFIX: &str = "-id";

/// The durable build record.
///
/// Serialized as one flat JSON object:
///
/// ```json
/// {
///   "images": { "<role>": "<image-id>" },
///   "clobber-<role>": 1700000000.25,
///   "last-<role>-id": "<image-id>",
///   "content-sync-container-id": "<container-id>"
/// }
/// ```
///
/// Missing keys default to empty/null. Keys that are `null` are treated as
/// absent. The legacy `vct-cid` key is read as the sync container id when the
/// current key is missing. Unrecognized keys are carried through unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildState {
    /// Last successfully produced image per role.
    pub images: BTreeMap<Role, ImageId>,
    /// Last observed modification time (unix seconds) of each clobber marker.
    pub clobber: BTreeMap<Role, f64>,
    /// Most recent image per role; protected from garbage collection.
    pub last_ids: BTreeMap<Role, ImageId>,
    /// Reusable content-sync container.
    pub sync_container: Option<ContainerId>,
    /// Keys this version does not understand.
    pub extra: BTreeMap<String, Value>,
}

impl BuildState {
    /// Every image id recorded as "last used".
    pub fn protected_images(&self) -> Vec<ImageId> {
        self.last_ids.values().cloned().collect()
    }
}

impl Serialize for BuildState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut entries: BTreeMap<String, Value> = self.extra.clone();
        entries.insert(
            IMAGES_KEY.to_owned(),
            serde_json::to_value(&self.images).map_err(serde::ser::Error::custom)?,
        );
        entries.insert(
            SYNC_CONTAINER_KEY.to_owned(),
            self.sync_container
                .as_ref()
                .map_or(Value::Null, |c| Value::String(c.to_string())),
        );
        for (role, mtime) in &self.clobber {
            entries.insert(format!("{CLOBBER_PREFIX}{role}"), Value::from(*mtime));
        }
        for (role, id) in &self.last_ids {
            entries.insert(
                format!("{LAST_PREFIX}{role}{LAST_SUFFIX}"),
                Value::String(id.to_string()),
            );
        }

        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (k, v) in &entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for BuildState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let mut state = BuildState::default();
        let mut legacy_sync = None;

        for (key, value) in raw {
            if value.is_null() {
                continue;
            }
            if key == IMAGES_KEY {
                state.images = serde_json::from_value(value).map_err(D::Error::custom)?;
            } else if key == SYNC_CONTAINER_KEY {
                state.sync_container = Some(string_value(&key, value).map_err(D::Error::custom)?.into());
            } else if key == LEGACY_SYNC_CONTAINER_KEY {
                legacy_sync = Some(string_value(&key, value).map_err(D::Error::custom)?);
            } else if let Some(role) = key.strip_prefix(CLOBBER_PREFIX) {
                let mtime = value
                    .as_f64()
                    .ok_or_else(|| D::Error::custom(format!("'{key}' must be a number")))?;
                state.clobber.insert(Role::from(role), mtime);
            } else if let Some(role) = key
                .strip_prefix(LAST_PREFIX)
                .and_then(|k| k.strip_suffix(LAST_SUFFIX))
                .filter(|r| !r.is_empty())
            {
                let id = string_value(&key, value).map_err(D::Error::custom)?;
                state.last_ids.insert(Role::from(role), ImageId::new(id));
            } else {
                state.extra.insert(key, value);
            }
        }

        if state.sync_container.is_none() {
            state.sync_container = legacy_sync.map(ContainerId::new);
        }
        Ok(state)
    }
}

fn string_value(key: &str, value: Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(format!("'{key}' must be a string, got {other}")),
    }
}

/// Single writer of the durable [`BuildState`] document.
///
/// Every mutation goes through [`update`](Self::update): the closure runs on a
/// copy of the document, the copy is written to a temp file in the same
/// directory, fsynced, and renamed over the old document. The in-memory copy
/// only changes once the rename succeeded, so a failed write leaves both the
/// file and the cached state at their previous value.
pub struct StateStore {
    path: PathBuf,
    state: Mutex<BuildState>,
}

impl StateStore {
    /// Open the document at `path`. A missing file yields an empty state.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            debug!("no state at {}, starting empty", path.display());
            BuildState::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A copy of the current document.
    pub fn snapshot(&self) -> BuildState {
        self.guard().clone()
    }

    /// Apply `f` to the document and persist the result atomically.
    pub fn update<T>(&self, f: impl FnOnce(&mut BuildState) -> T) -> Result<T, StoreError> {
        let mut guard = self.guard();
        let mut next = guard.clone();
        let out = f(&mut next);
        write_atomic(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }

    fn guard(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_atomic(path: &Path, state: &BuildState) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut content = serde_json::to_string_pretty(state)?;
    content.push('\n');

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(&dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_file_is_empty_state() {
        let (_dir, store) = test_store();
        assert_eq!(store.snapshot(), BuildState::default());
        assert!(!store.path().exists());
    }

    #[test]
    fn update_persists_document() {
        let (_dir, store) = test_store();
        store
            .update(|s| {
                s.images.insert(Role::from("ldap"), ImageId::from("img1"));
                s.last_ids.insert(Role::from("ldap"), ImageId::from("img1"));
                s.clobber.insert(Role::from("hgweb"), 1_700_000_000.5);
                s.sync_container = Some(ContainerId::from("c1"));
            })
            .unwrap();

        let reopened = StateStore::open(store.path()).unwrap();
        assert_eq!(reopened.snapshot(), store.snapshot());
    }

    #[test]
    fn document_layout_is_flat() {
        let (_dir, store) = test_store();
        store
            .update(|s| {
                s.last_ids.insert(Role::from("hgmaster"), ImageId::from("abc"));
                s.clobber.insert(Role::from("vct"), 12.0);
            })
            .unwrap();
        let raw: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["last-hgmaster-id"], "abc");
        assert_eq!(raw["clobber-vct"], 12.0);
        assert!(raw["images"].is_object());
        assert!(raw["content-sync-container-id"].is_null());
    }

    #[test]
    fn nulls_and_legacy_keys_are_migrated() {
        let json = r#"{
            "images": {"ldap": "i1"},
            "clobber-hgweb": null,
            "last-ldap-id": null,
            "last-hgweb-id": "i2",
            "vct-cid": "legacy-container",
            "containers": {}
        }"#;
        let state: BuildState = serde_json::from_str(json).unwrap();
        assert!(state.clobber.is_empty());
        assert_eq!(state.last_ids.len(), 1);
        assert_eq!(state.last_ids[&Role::from("hgweb")], "i2");
        assert_eq!(state.sync_container, Some(ContainerId::from("legacy-container")));
        assert!(state.extra.contains_key("containers"));
    }

    #[test]
    fn unknown_keys_survive_rewrite() {
        let (_dir, store) = test_store();
        fs::write(store.path(), r#"{"custom": [1, 2]}"#).unwrap();
        let store = StateStore::open(store.path()).unwrap();
        store.update(|s| s.sync_container = None).unwrap();
        let raw: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["custom"], serde_json::json!([1, 2]));
    }

    #[test]
    fn corrupt_document_is_reported() {
        let (_dir, store) = test_store();
        fs::write(store.path(), "NOT JSON").unwrap();
        let err = StateStore::open(store.path()).err().unwrap();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn rejects_wrongly_typed_fields() {
        assert!(serde_json::from_str::<BuildState>(r#"{"clobber-x": "soon"}"#).is_err());
        assert!(serde_json::from_str::<BuildState>(r#"{"last-x-id": 5}"#).is_err());
    }

    #[test]
    fn failed_write_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();
        let store = StateStore::open(blocker.join("state.json")).unwrap();

        let result = store.update(|s| s.sync_container = Some(ContainerId::from("c")));
        assert!(result.is_err());
        assert_eq!(store.snapshot().sync_container, None);
    }

    #[test]
    fn update_returns_closure_value() {
        let (_dir, store) = test_store();
        let n = store
            .update(|s| {
                s.images.insert(Role::from("a"), ImageId::from("1"));
                s.images.len()
            })
            .unwrap();
        assert_eq!(n, 1);
    }
}
