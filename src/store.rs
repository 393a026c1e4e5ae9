//! 快照存储
//! 每个快照一个只写一次的文件，另有原子替换的 `snapshot-latest.json` 指针

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, SubsecRound, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::scan::snapshot::Snapshot;

pub const LATEST_FILE: &str = "snapshot-latest.json";
const FILE_PREFIX: &str = "snapshot-";
const FILE_SUFFIX: &str = ".json";
const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("cannot serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("snapshot {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("snapshot saved to {saved} but the latest pointer was not updated: {source}")]
    LatestNotUpdated { saved: PathBuf, source: io::Error },

    #[error("snapshot {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

/// A timestamped copy on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub path: PathBuf,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }

    pub fn path_for(&self, taken_at: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("{}{}{}", FILE_PREFIX, taken_at.format(STAMP_FORMAT), FILE_SUFFIX))
    }

    /// Write the timestamped copy, then swing the latest pointer to it.
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let body = serde_json::to_vec_pretty(snapshot)?;

        let path = self.path_for(snapshot.timestamp);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(StoreError::AlreadyExists(path)),
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        if let Err(e) = file.write_all(&body).and_then(|_| file.sync_all()) {
            // never leave a truncated write-once copy behind
            let _ = fs::remove_file(&path);
            return Err(StoreError::Io { path, source: e });
        }
        debug!(path = %path.display(), bytes = body.len(), "snapshot written");

        if let Err(source) = self.replace_latest(&body) {
            return Err(StoreError::LatestNotUpdated { saved: path, source });
        }
        info!(path = %path.display(), "snapshot saved");
        Ok(path)
    }

    fn replace_latest(&self, body: &[u8]) -> io::Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.latest_path()).map_err(|e| e.error)?;
        Ok(())
    }

    /// The most recently saved snapshot; `None` before the first save.
    pub fn load_latest(&self) -> Result<Option<Snapshot>, StoreError> {
        let path = self.latest_path();
        match fs::read(&path) {
            Ok(bytes) => decode(&path, &bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    pub fn load(&self, path: &Path) -> Result<Snapshot, StoreError> {
        let bytes = fs::read(path).map_err(io_err(path))?;
        decode(path, &bytes)
    }

    /// Timestamped copies, oldest first.
    pub fn list(&self) -> Result<Vec<StoredSnapshot>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io { path: self.dir.clone(), source: e }),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.dir))?;
            let name = entry.file_name();
            if let Some(taken_at) = name.to_str().and_then(parse_stamp) {
                found.push(StoredSnapshot { path: entry.path(), taken_at });
            }
        }
        found.sort_by(|a, b| a.taken_at.cmp(&b.taken_at).then_with(|| a.path.cmp(&b.path)));
        Ok(found)
    }

    /// Newest timestamped copy taken strictly before `taken_at`.
    /// File names keep microseconds, so compare at that precision.
    pub fn previous_before(&self, taken_at: DateTime<Utc>) -> Result<Option<StoredSnapshot>, StoreError> {
        let taken_at = taken_at.trunc_subsecs(6);
        Ok(self.list()?.into_iter().filter(|s| s.taken_at < taken_at).last())
    }

    /// Delete timestamped copies older than `retention_days`. The latest pointer is never touched.
    pub fn prune(&self, retention_days: u32, now: DateTime<Utc>) -> Result<Vec<PathBuf>, StoreError> {
        let cutoff = now - ChronoDuration::days(i64::from(retention_days));
        let mut removed = Vec::new();
        for old in self.list()?.into_iter().filter(|s| s.taken_at < cutoff) {
            fs::remove_file(&old.path).map_err(io_err(&old.path))?;
            removed.push(old.path);
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), retention_days, "old snapshots pruned");
        }
        Ok(removed)
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Snapshot, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn parse_stamp(file_name: &str) -> Option<DateTime<Utc>> {
    let stamp = file_name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::snapshot::fixtures::*;
    use crate::utils::Criticality;

    #[test]
    fn save_then_load_latest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));
        assert!(store.load_latest().unwrap().is_none());

        let mut s = snapshot(&["web-1", "db-1"], vec![service("postgres", "db-1", Criticality::Critical)]);
        s.scan_duration_seconds = 12.345678901234567;
        s.scan_errors.push("db-1: containers: timed out after 60s".into());
        let path = store.save(&s).unwrap();

        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("snapshot-"));
        assert_eq!(store.load_latest().unwrap(), Some(s.clone()));
        assert_eq!(store.load(&path).unwrap(), s);
    }

    #[test]
    fn timestamped_copies_are_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let s = snapshot(&["web-1"], vec![]);
        store.save(&s).unwrap();
        assert!(matches!(store.save(&s), Err(StoreError::AlreadyExists(_))));

        let mut later = s.clone();
        later.timestamp = at(60);
        later.servers.clear();
        later.recount();
        store.save(&later).unwrap();

        // the older copy is untouched
        let first = store.load(&store.path_for(at(0))).unwrap();
        assert_eq!(first, s);
        assert_eq!(store.load_latest().unwrap().unwrap().total_servers, 0);
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.previous_before(at(60)).unwrap().unwrap().taken_at, at(0));
    }

    #[test]
    fn failing_latest_pointer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        // a directory squatting on the pointer name makes the rename fail
        fs::create_dir(store.latest_path()).unwrap();
        fs::write(store.latest_path().join("keep"), "x").unwrap();

        let s = snapshot(&["web-1"], vec![]);
        match store.save(&s) {
            Err(StoreError::LatestNotUpdated { saved, .. }) => {
                assert_eq!(store.load(&saved).unwrap(), s);
            }
            other => panic!("expected LatestNotUpdated, got {:?}", other),
        }
    }

    #[test]
    fn previous_before_skips_the_copy_itself() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let mut s = snapshot(&["web-1"], vec![]);
        s.timestamp = at(0) + ChronoDuration::nanoseconds(123_456_789);
        store.save(&s).unwrap();
        assert!(store.previous_before(s.timestamp).unwrap().is_none());
    }

    #[test]
    fn corrupt_latest_is_an_error_not_a_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        fs::write(store.latest_path(), "{\"timestamp\": ").unwrap();
        assert!(matches!(store.load_latest(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn prune_removes_only_expired_copies() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let day = 86_400;
        for offset in [0, 5 * day, 20 * day] {
            let mut s = snapshot(&["web-1"], vec![]);
            s.timestamp = at(offset);
            store.save(&s).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let removed = store.prune(10, at(20 * day)).unwrap();
        assert_eq!(removed, vec![store.path_for(at(0)), store.path_for(at(5 * day))]);
        let left: Vec<_> = store.list().unwrap().into_iter().map(|s| s.taken_at).collect();
        assert_eq!(left, vec![at(20 * day)]);
        assert!(store.latest_path().exists());
    }
}
