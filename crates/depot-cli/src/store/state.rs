//! Installed state: which forks are installed where, and which engines exist.
//!
//! The whole state lives in one JSON file rewritten atomically on every mutation
//! (temp file in the same directory, then rename). A mutation that fails to
//! persist leaves the in-memory copy untouched.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use depot_core::ErrorKind;
use depot_core::store::RetentionPolicy;
use depot_schema::{EngineVersion, Sha256Digest};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed state file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to replace state file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Fork '{0}' is not installed")]
    NotInstalled(String),
}

impl StateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotInstalled(_) => ErrorKind::NotFound,
            Self::Json(_) => ErrorKind::CorruptData,
            Self::Io(_) | Self::Persist(_) => ErrorKind::Io,
        }
    }
}

/// The committed installation of one fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub fork_id: String,
    /// Names the install directory. Never reassigned.
    pub disk_id: u32,
    pub current_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<Sha256Digest>,
    pub current_engine_version: EngineVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_version_id: Option<i64>,
}

/// An engine archive present under `engines/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledEngineVersion {
    pub version: EngineVersion,
    pub signature: String,
}

/// User-tunable retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub max_versions_to_keep: usize,
    pub max_fork_versions_to_keep: usize,
}

impl Default for Preferences {
    fn default() -> Self {
        let policy = RetentionPolicy::default();
        Self {
            max_versions_to_keep: policy.max_total,
            max_fork_versions_to_keep: policy.max_per_fork,
        }
    }
}

impl Preferences {
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_total: self.max_versions_to_keep,
            max_per_fork: self.max_fork_versions_to_keep,
        }
    }
}

/// On-disk document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledState {
    /// Random id minted when the state was created.
    pub fingerprint: String,
    pub next_disk_id: u32,
    #[serde(default)]
    pub installations: BTreeMap<String, InstalledVersion>,
    #[serde(default)]
    pub engines: BTreeMap<EngineVersion, InstalledEngineVersion>,
    #[serde(default)]
    pub preferences: Preferences,
}

impl InstalledState {
    fn fresh() -> Self {
        Self {
            fingerprint: hex::encode(rand::random::<[u8; 16]>()),
            next_disk_id: 1,
            installations: BTreeMap::new(),
            engines: BTreeMap::new(),
            preferences: Preferences::default(),
        }
    }
}

/// Shared, persisted installed state.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<InstalledState>,
}

impl StateStore {
    /// Load the state file, creating it on first use.
    pub fn load_or_create(path: &Path) -> Result<Self, StateError> {
        let state = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = InstalledState::fresh();
                write_atomic(path, &state)?;
                tracing::info!(path = %path.display(), fingerprint = %state.fingerprint, "created state file");
                state
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    /// State file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the whole state.
    pub fn snapshot(&self) -> InstalledState {
        self.read(Clone::clone)
    }

    /// Record for one fork, if installed.
    pub fn installation(&self, fork_id: &str) -> Option<InstalledVersion> {
        self.read(|s| s.installations.get(fork_id).cloned())
    }

    /// Every installation record, ordered by fork id.
    pub fn installations(&self) -> Vec<InstalledVersion> {
        self.read(|s| s.installations.values().cloned().collect())
    }

    /// Installed engine recorded under `version`.
    pub fn engine(&self, version: &str) -> Option<InstalledEngineVersion> {
        self.read(|s| s.engines.get(version).cloned())
    }

    /// Every installed engine.
    pub fn engines(&self) -> Vec<InstalledEngineVersion> {
        self.read(|s| s.engines.values().cloned().collect())
    }

    /// Current retention preferences.
    pub fn preferences(&self) -> Preferences {
        self.read(|s| s.preferences)
    }

    /// Engines no installation refers to.
    pub fn unreferenced_engines(&self) -> Vec<EngineVersion> {
        self.read(|s| {
            let used: HashSet<&EngineVersion> = s
                .installations
                .values()
                .map(|i| &i.current_engine_version)
                .collect();
            s.engines
                .keys()
                .filter(|v| !used.contains(v))
                .cloned()
                .collect()
        })
    }

    /// Content versions some installation still points at.
    pub fn referenced_content_versions(&self) -> HashSet<i64> {
        self.read(|s| {
            s.installations
                .values()
                .filter_map(|i| i.content_version_id)
                .collect()
        })
    }

    /// Mint a new disk id. The counter is persisted before the id is returned,
    /// so an id is never handed out twice.
    pub fn reserve_disk_id(&self) -> Result<u32, StateError> {
        self.mutate(|s| {
            let id = s.next_disk_id;
            s.next_disk_id += 1;
            id
        })
    }

    /// Create or replace the record for `record.fork_id`.
    pub fn commit_installation(&self, record: InstalledVersion) -> Result<(), StateError> {
        self.mutate(|s| {
            s.next_disk_id = s.next_disk_id.max(record.disk_id + 1);
            s.installations.insert(record.fork_id.clone(), record);
        })
    }

    /// Drop the record for `fork_id`. Fails if there is none.
    pub fn remove_installation(&self, fork_id: &str) -> Result<InstalledVersion, StateError> {
        self.try_mutate(|s| {
            s.installations
                .remove(fork_id)
                .ok_or_else(|| StateError::NotInstalled(fork_id.to_string()))
        })
    }

    /// Record an installed engine with its hex signature.
    pub fn add_engine(&self, version: &EngineVersion, signature: &str) -> Result<(), StateError> {
        self.mutate(|s| {
            s.engines.insert(
                version.clone(),
                InstalledEngineVersion {
                    version: version.clone(),
                    signature: signature.to_string(),
                },
            );
        })
    }

    /// Returns whether a row was removed.
    pub fn remove_engine(&self, version: &str) -> Result<bool, StateError> {
        self.mutate(|s| s.engines.remove(version).is_some())
    }

    /// Persist new retention preferences.
    pub fn set_preferences(&self, preferences: Preferences) -> Result<(), StateError> {
        self.mutate(|s| s.preferences = preferences)
    }

    /// Forget every installation and engine. Fingerprint and disk id counter stay.
    pub fn clear(&self) -> Result<(), StateError> {
        self.mutate(|s| {
            s.installations.clear();
            s.engines.clear();
        })
    }

    fn read<T>(&self, f: impl FnOnce(&InstalledState) -> T) -> T {
        f(&self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut InstalledState) -> T) -> Result<T, StateError> {
        self.try_mutate(|s| Ok(f(s)))
    }

    fn try_mutate<T>(
        &self,
        f: impl FnOnce(&mut InstalledState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        let out = f(&mut next)?;
        write_atomic(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }
}

fn write_atomic(path: &Path, state: &InstalledState) -> Result<(), StateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, state)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn v(s: &str) -> EngineVersion {
        EngineVersion::new(s).unwrap()
    }

    fn record(fork: &str, disk_id: u32, engine: &str) -> InstalledVersion {
        InstalledVersion {
            fork_id: fork.to_string(),
            disk_id,
            current_version: "1".to_string(),
            current_hash: None,
            current_engine_version: v(engine),
            content_version_id: Some(i64::from(disk_id)),
        }
    }

    #[test]
    fn test_created_then_reloaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::load_or_create(&path).unwrap();
        let fingerprint = store.snapshot().fingerprint;
        assert_eq!(fingerprint.len(), 32);
        store.commit_installation(record("fork", 1, "0.1")).unwrap();
        store.add_engine(&v("0.1"), "abcd").unwrap();
        drop(store);

        let store = StateStore::load_or_create(&path).unwrap();
        assert_eq!(store.snapshot().fingerprint, fingerprint);
        assert_eq!(store.installation("fork").unwrap().current_engine_version, v("0.1"));
        assert_eq!(store.engine("0.1").unwrap().signature, "abcd");
    }

    #[test]
    fn test_disk_ids_never_reused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load_or_create(&path).unwrap();

        let a = store.reserve_disk_id().unwrap();
        store.commit_installation(record("a", a, "e")).unwrap();
        store.remove_installation("a").unwrap();
        drop(store);

        let store = StateStore::load_or_create(&path).unwrap();
        let b = store.reserve_disk_id().unwrap();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_unreferenced_engines() {
        let dir = tempdir().unwrap();
        let store = StateStore::load_or_create(&dir.path().join("state.json")).unwrap();
        store.add_engine(&v("old"), "s").unwrap();
        store.add_engine(&v("new"), "s").unwrap();
        store.commit_installation(record("fork", 1, "new")).unwrap();

        assert_eq!(store.unreferenced_engines(), vec![v("old")]);
        assert_eq!(store.referenced_content_versions(), HashSet::from([1]));
    }

    #[test]
    fn test_remove_missing_fork() {
        let dir = tempdir().unwrap();
        let store = StateStore::load_or_create(&dir.path().join("state.json")).unwrap();
        let err = store.remove_installation("ghost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_file_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load_or_create(&path).unwrap();
        store.commit_installation(record("fork", 4, "0.2")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let fork = &raw["installations"]["fork"];
        assert_eq!(fork["fork_id"], "fork");
        assert_eq!(fork["disk_id"], 4);
        assert_eq!(fork["current_engine_version"], "0.2");
        assert_eq!(raw["next_disk_id"], 5);
        assert_eq!(raw["preferences"]["max_fork_versions_to_keep"], 3);
    }

    #[test]
    fn test_traversal_engine_in_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load_or_create(&path).unwrap();
        store.add_engine(&v("0.1"), "s").unwrap();
        drop(store);

        let text = std::fs::read_to_string(&path).unwrap().replace("0.1", "../../x");
        std::fs::write(&path, text).unwrap();
        let err = StateStore::load_or_create(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptData);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = StateStore::load_or_create(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptData);
    }
}
