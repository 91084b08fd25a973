use crate::state::StateStore;
use crate::StoreError;
use filetime::FileTime;
use kiln_schema::Role;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// External invalidation markers: files named `clobber.<role>` whose
/// modification time is compared against the last observed value in the
/// state document.
#[derive(Debug, Clone)]
pub struct ClobberMarkers {
    dir: PathBuf,
}

impl ClobberMarkers {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn marker_path(&self, role: &Role) -> PathBuf {
        self.dir.join(format!("clobber.{role}"))
    }

    /// Modification time of a marker as fractional unix seconds, `None` when
    /// the marker does not exist.
    pub fn observed_mtime(&self, role: &Role) -> Result<Option<f64>, StoreError> {
        mtime_of(&self.marker_path(role))
    }

    /// Whether the marker for `role` changed since it was last observed.
    ///
    /// A missing marker never requires a clobber. When a clobber is required
    /// the new modification time is recorded, so the same touch is reported
    /// only once.
    pub fn clobber_needed(&self, store: &StateStore, role: &Role) -> Result<bool, StoreError> {
        let Some(current) = self.observed_mtime(role)? else {
            return Ok(false);
        };
        let previous = store.snapshot().clobber.get(role).copied();
        if previous.is_some_and(|prev| current <= prev) {
            return Ok(false);
        }

        info!("clobber marker for {role} touched, invalidating cached state");
        store.update(|s| {
            s.clobber.insert(role.clone(), current);
        })?;
        Ok(true)
    }
}

fn mtime_of(path: &Path) -> Result<Option<f64>, StoreError> {
    match fs::metadata(path) {
        Ok(meta) => {
            let mtime = FileTime::from_last_modification_time(&meta);
            Ok(Some(
                mtime.unix_seconds() as f64 + f64::from(mtime.nanoseconds()) / 1e9,
            ))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::set_file_mtime;

    fn setup() -> (tempfile::TempDir, StateStore, ClobberMarkers) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        let markers = ClobberMarkers::new(dir.path());
        (dir, store, markers)
    }

    fn touch(path: &Path, secs: i64) {
        fs::write(path, b"").unwrap();
        set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn missing_marker_never_clobbers() {
        let (_dir, store, markers) = setup();
        assert!(!markers.clobber_needed(&store, &Role::from("vct")).unwrap());
        assert!(store.snapshot().clobber.is_empty());
    }

    #[test]
    fn first_observation_clobbers_once() {
        let (_dir, store, markers) = setup();
        let role = Role::from("hgweb");
        touch(&markers.marker_path(&role), 1_000);

        assert!(markers.clobber_needed(&store, &role).unwrap());
        assert_eq!(store.snapshot().clobber[&role], 1_000.0);
        assert!(!markers.clobber_needed(&store, &role).unwrap());
    }

    #[test]
    fn newer_mtime_clobbers_again() {
        let (_dir, store, markers) = setup();
        let role = Role::from("hgweb");
        let path = markers.marker_path(&role);
        touch(&path, 1_000);
        assert!(markers.clobber_needed(&store, &role).unwrap());

        set_file_mtime(&path, FileTime::from_unix_time(1_001, 0)).unwrap();
        assert!(markers.clobber_needed(&store, &role).unwrap());
    }

    #[test]
    fn older_mtime_does_not_clobber() {
        let (_dir, store, markers) = setup();
        let role = Role::from("hgweb");
        let path = markers.marker_path(&role);
        touch(&path, 2_000);
        assert!(markers.clobber_needed(&store, &role).unwrap());

        set_file_mtime(&path, FileTime::from_unix_time(1_500, 0)).unwrap();
        assert!(!markers.clobber_needed(&store, &role).unwrap());
    }

    #[test]
    fn marker_naming() {
        let markers = ClobberMarkers::new("/src/testing");
        assert_eq!(
            markers.marker_path(&Role::from("vct")),
            PathBuf::from("/src/testing/clobber.vct")
        );
    }
}
