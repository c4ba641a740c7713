//! Local file-based state storage backend.
//!
//! Layout under the base directory, one subdirectory per workspace:
//!
//! ```text
//! .converge/<workspace>/state.json          current snapshot
//! .converge/<workspace>/state.lock          lock file
//! .converge/<workspace>/versions/<serial>.json
//! ```
//!
//! Every file is written to a temporary path and renamed into place, so a
//! crash never leaves a half-written snapshot. The version file is written
//! before `state.json`; the rename of `state.json` is the commit point.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConvergeError, Result, StateError};

use super::lock::LockInfo;
use super::store::{StateStore, check_lock, check_write, next_version};
use super::types::{SnapshotVersion, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Version directory name.
const VERSIONS_DIR: &str = "versions";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Workspace name.
    workspace: String,
    /// Directory holding this workspace's files.
    workspace_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Path to the version directory.
    versions_dir: PathBuf,
    /// Serializes writers within this process.
    write_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>, workspace: &str) -> Self {
        let workspace_dir = base_dir.into().join(workspace);

        Self {
            workspace: workspace.to_string(),
            state_path: workspace_dir.join(STATE_FILE),
            lock_path: workspace_dir.join(LOCK_FILE),
            versions_dir: workspace_dir.join(VERSIONS_DIR),
            workspace_dir,
            write_guard: Mutex::new(()),
        }
    }

    /// Returns the directory holding this workspace's files.
    #[must_use]
    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    fn version_path(&self, serial: u64) -> PathBuf {
        self.versions_dir.join(format!("{serial:010}.json"))
    }

    /// Ensures a directory exists.
    async fn ensure_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(dir)
                .await
                .map_err(|e| backend_error("Failed to create state directory", &e))?;
        }
        Ok(())
    }

    /// Reads and parses a JSON file if it exists.
    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!(
                    "Failed to read {}: {e}",
                    path.display()
                ))
                .into());
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            StateError::corrupted(format!("Failed to parse {}: {e}", path.display())).into()
        })
    }

    /// Writes a JSON file through a temporary file and an atomic rename.
    async fn write_json_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let temp_path = path.with_extension(format!("tmp-{}", &Uuid::new_v4().to_string()[..8]));

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| backend_error("Failed to create temp state file", &e))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| backend_error("Failed to write state file", &e))?;

        file.sync_all()
            .await
            .map_err(|e| backend_error("Failed to sync state file", &e))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| backend_error("Failed to rename state file", &e))?;

        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        Self::read_json(&self.lock_path).await
    }

    /// Reads the committed snapshot.
    ///
    /// A version file one serial past `state.json` is a write that crashed
    /// before its commit point; with a matching lineage it is rolled forward.
    async fn read_current(&self) -> Result<Option<StateSnapshot>> {
        let current: Option<StateSnapshot> = Self::read_json(&self.state_path).await?;
        let next_serial = current.as_ref().map_or(1, |c| c.serial + 1);
        let leftover: Option<StateSnapshot> =
            Self::read_json(&self.version_path(next_serial)).await?;

        match leftover {
            Some(leftover) if current.as_ref().is_none_or(|c| c.lineage == leftover.lineage) => {
                warn!(
                    "Rolling forward uncommitted state serial {} in {}",
                    leftover.serial,
                    self.versions_dir.display()
                );
                Ok(Some(leftover))
            }
            _ => Ok(current),
        }
    }

    /// Tries to create the lock file exclusively.
    ///
    /// Returns `Ok(false)` if the file already exists.
    async fn try_create_lock_file(&self, lock: &LockInfo) -> Result<bool> {
        let content = serde_json::to_string_pretty(lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(backend_error("Failed to create lock file", &e)),
        };

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| backend_error("Failed to write lock file", &e))?;
        file.sync_all()
            .await
            .map_err(|e| backend_error("Failed to sync lock file", &e))?;
        Ok(true)
    }

    /// Moves an expired lock file out of the way.
    ///
    /// Returns `Ok(false)` if the file moved aside turned out to be a
    /// different, newer lock; that lock is put back.
    async fn reclaim_expired(&self, expired: &LockInfo) -> Result<bool> {
        let stale_path = self
            .lock_path
            .with_extension(format!("stale-{}", &Uuid::new_v4().to_string()[..8]));

        match fs::rename(&self.lock_path, &stale_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(backend_error("Failed to reclaim lock file", &e)),
        }

        let moved: Option<LockInfo> = Self::read_json(&stale_path).await?;
        if moved.as_ref().is_some_and(|m| m.lock_id != expired.lock_id) {
            // Another run reclaimed first; restore its lock unless yet another exists.
            if fs::hard_link(&stale_path, &self.lock_path).await.is_err() {
                debug!("Lock file reappeared while restoring a concurrent reclaim");
            }
            Self::remove_stale(&stale_path).await;
            return Ok(false);
        }

        Self::remove_stale(&stale_path).await;
        Ok(true)
    }

    async fn remove_stale(path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            debug!("Failed to remove stale lock file {}: {e}", path.display());
        }
    }

    async fn all_version_serials(&self) -> Result<Vec<u64>> {
        let mut entries = match fs::read_dir(&self.versions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(backend_error("Failed to list versions", &e)),
        };

        let mut serials = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| backend_error("Failed to list versions", &e))?
        {
            let name = entry.file_name();
            if let Some(serial) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                serials.push(serial);
            }
        }
        serials.sort_unstable();
        Ok(serials)
    }

    /// Persists `next` as a new version and as the current snapshot.
    async fn commit(&self, next: &StateSnapshot) -> Result<()> {
        Self::ensure_dir(&self.versions_dir).await?;

        let version_path = self.version_path(next.serial);
        if let Some(existing) = Self::read_json::<StateSnapshot>(&version_path).await? {
            if existing.lineage == next.lineage {
                return Err(StateError::SerialConflict {
                    expected: next.serial - 1,
                    found: next.serial,
                }
                .into());
            }
            warn!(
                "Overwriting uncommitted state serial {} of lineage {}",
                existing.serial, existing.lineage
            );
        }

        Self::write_json_atomic(&version_path, next).await?;
        Self::write_json_atomic(&self.state_path, next).await?;

        info!(
            "Saved state serial {} to: {}",
            next.serial,
            self.state_path.display()
        );
        Ok(())
    }
}

fn backend_error(context: &str, e: &std::io::Error) -> ConvergeError {
    StateError::backend(format!("{context}: {e}")).into()
}

#[async_trait]
impl StateStore for LocalStateStore {
    fn snapshot_id(&self) -> &str {
        &self.workspace
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    async fn acquire_lock(&self, holder: &str, ttl: Option<Duration>) -> Result<LockInfo> {
        Self::ensure_dir(&self.workspace_dir).await?;
        let lock = LockInfo::new(&self.workspace, holder, ttl);

        for _ in 0..3 {
            if self.try_create_lock_file(&lock).await? {
                info!(
                    "Acquired state lock: {} (expires in {})",
                    lock.lock_id,
                    lock.remaining_secs()
                        .map_or_else(|| String::from("never"), |s| format!("{s}s"))
                );
                return Ok(lock);
            }

            let Some(existing) = self.read_lock_file().await? else {
                continue;
            };

            if !existing.is_expired() {
                return Err(StateError::LockHeld {
                    lock_id: existing.lock_id,
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }

            warn!(
                "Reclaiming expired lock {} held by {} since {}",
                existing.lock_id,
                existing.holder,
                existing.acquired_at.to_rfc3339()
            );
            self.reclaim_expired(&existing).await?;
        }

        match self.read_lock_file().await? {
            Some(existing) => Err(StateError::LockHeld {
                lock_id: existing.lock_id,
                holder: existing.holder,
                since: existing.acquired_at.to_rfc3339(),
            }
            .into()),
            None => Err(StateError::backend("Lock file kept changing while acquiring").into()),
        }
    }

    async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock.lock_id => {
                match fs::remove_file(&self.lock_path).await {
                    Ok(()) => info!("Released state lock: {}", lock.lock_id),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(backend_error("Failed to delete lock file", &e)),
                }
            }
            Some(existing) => {
                debug!(
                    "Lock ID mismatch: expected {}, found {}",
                    lock.lock_id, existing.lock_id
                );
            }
            None => debug!("Lock {} already released", lock.lock_id),
        }
        Ok(())
    }

    async fn force_unlock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => {
                warn!("Force-unlocking lock {lock_id} held by {}", existing.holder);
                fs::remove_file(&self.lock_path)
                    .await
                    .map_err(|e| backend_error("Failed to delete lock file", &e))
            }
            _ => Err(StateError::lock_invalid(lock_id, "no such lock is held").into()),
        }
    }

    async fn current_lock(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn read_snapshot(&self) -> Result<StateSnapshot> {
        match self.read_current().await? {
            Some(snapshot) => {
                debug!(
                    "Loaded state serial {} from: {}",
                    snapshot.serial,
                    self.state_path.display()
                );
                Ok(snapshot)
            }
            None => {
                debug!("State file does not exist: {}", self.state_path.display());
                Ok(StateSnapshot::new(&self.workspace))
            }
        }
    }

    async fn write_snapshot(
        &self,
        snapshot: &StateSnapshot,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        let _guard = self.write_guard.lock().await;

        check_lock(self.read_lock_file().await?.as_ref(), lock)?;
        check_write(self.read_current().await?.as_ref(), snapshot)?;

        let next = next_version(snapshot, &self.workspace, snapshot.serial + 1);
        self.commit(&next).await?;
        Ok(next)
    }

    async fn force_write_snapshot(
        &self,
        snapshot: &StateSnapshot,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        let _guard = self.write_guard.lock().await;

        check_lock(self.read_lock_file().await?.as_ref(), lock)?;

        let current_serial = self.read_current().await?.map_or(0, |c| c.serial);
        let latest_version = self.all_version_serials().await?.last().copied().unwrap_or(0);
        let serial = current_serial.max(latest_version) + 1;

        warn!(
            "Force-writing state serial {serial} with lineage {}",
            snapshot.lineage
        );
        let next = next_version(snapshot, &self.workspace, serial);
        self.commit(&next).await?;
        Ok(next)
    }

    async fn list_versions(&self) -> Result<Vec<SnapshotVersion>> {
        let mut versions = Vec::new();
        for serial in self.all_version_serials().await? {
            if let Some(snapshot) = Self::read_json::<StateSnapshot>(&self.version_path(serial)).await? {
                versions.push(snapshot.version_summary());
            }
        }
        Ok(versions)
    }

    async fn read_version(&self, serial: u64) -> Result<StateSnapshot> {
        Self::read_json(&self.version_path(serial))
            .await?
            .ok_or_else(|| StateError::VersionNotFound { serial }.into())
    }

    async fn prune_versions(&self, keep: usize, lock: &LockInfo) -> Result<usize> {
        let _guard = self.write_guard.lock().await;
        check_lock(self.read_lock_file().await?.as_ref(), lock)?;

        let serials = self.all_version_serials().await?;
        let excess = serials.len().saturating_sub(keep.max(1));

        for serial in &serials[..excess] {
            fs::remove_file(self.version_path(*serial))
                .await
                .map_err(|e| backend_error("Failed to delete version", &e))?;
        }
        if excess > 0 {
            warn!("Pruned {excess} state versions from {}", self.versions_dir.display());
        }
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceAddress;
    use crate::state::types::ResourceRecord;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path(), "default");
        (store, temp_dir)
    }

    fn record(name: &str) -> ResourceRecord {
        ResourceRecord::new(
            ResourceAddress::new("t", name),
            "local",
            format!("id-{name}"),
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn test_read_nonexistent_gives_empty_snapshot() {
        let (store, _temp) = create_test_store();

        let snapshot = store.read_snapshot().await.expect("read should not fail");
        assert_eq!(snapshot.serial, 0);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.workspace, "default");
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("me", None).await.expect("lock");

        let mut snapshot = store.read_snapshot().await.expect("read");
        snapshot.set(record("a"));
        let written = store.write_snapshot(&snapshot, &lock).await.expect("write");
        assert_eq!(written.serial, 1);

        let loaded = store.read_snapshot().await.expect("read");
        assert_eq!(loaded, written);
        assert!(store.version_path(1).exists());

        let versions = store.list_versions().await.expect("versions");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].resource_count, 1);
    }

    #[tokio::test]
    async fn test_lineage_mismatch() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("me", None).await.expect("lock");

        let first = store.read_snapshot().await.expect("read");
        store.write_snapshot(&first, &lock).await.expect("write");

        let mut foreign = StateSnapshot::new("default");
        foreign.serial = 1;
        let err = store.write_snapshot(&foreign, &lock).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::LineageMismatch { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", Some(Duration::from_secs(60)))
            .await
            .expect("Failed to acquire lock");
        assert_eq!(store.current_lock().await.expect("lock info"), Some(lock.clone()));

        store.release_lock(&lock).await.expect("Failed to release lock");
        assert!(store.current_lock().await.expect("lock info").is_none());

        // Releasing twice is a no-op.
        store.release_lock(&lock).await.expect("second release");
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1", None)
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2", None).await;
        assert!(matches!(
            result,
            Err(ConvergeError::State(StateError::LockHeld { holder, .. })) if holder == "holder-1"
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let (store, _temp) = create_test_store();

        let stale = store
            .acquire_lock("crashed", Some(Duration::from_millis(1)))
            .await
            .expect("first lock");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh = store.acquire_lock("next", None).await.expect("reclaim");
        assert_ne!(stale.lock_id, fresh.lock_id);

        let snapshot = store.read_snapshot().await.expect("read");
        assert!(store.write_snapshot(&snapshot, &stale).await.is_err());
        assert!(store.write_snapshot(&snapshot, &fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_uncommitted_version_is_rolled_forward() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("me", None).await.expect("lock");

        let base = store.read_snapshot().await.expect("read");
        let first = store.write_snapshot(&base, &lock).await.expect("write");

        // A writer that crashed after the version file but before state.json.
        let mut crashed = next_version(&first, "default", 2);
        crashed.set(record("orphan"));
        LocalStateStore::write_json_atomic(&store.version_path(2), &crashed)
            .await
            .expect("leftover");

        let recovered = store.read_snapshot().await.expect("read");
        assert_eq!(recovered.serial, 2);
        assert!(recovered.contains(&ResourceAddress::new("t", "orphan")));

        // A writer still based on serial 1 lost the race.
        assert!(matches!(
            store.write_snapshot(&first, &lock).await,
            Err(ConvergeError::State(StateError::SerialConflict { expected: 1, found: 2 }))
        ));

        for _ in 0..3 {
            let current = store.read_snapshot().await.expect("read");
            let written = store.write_snapshot(&current, &lock).await.expect("write");
            assert_eq!(written.serial, current.serial + 1);
        }
        assert_eq!(store.read_snapshot().await.expect("read").serial, 5);
    }

    #[tokio::test]
    async fn test_uncommitted_foreign_version_is_overwritten() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("me", None).await.expect("lock");

        let base = store.read_snapshot().await.expect("read");
        let first = store.write_snapshot(&base, &lock).await.expect("write");

        let mut foreign = StateSnapshot::new("default");
        foreign.serial = 2;
        LocalStateStore::write_json_atomic(&store.version_path(2), &foreign)
            .await
            .expect("leftover");

        let current = store.read_snapshot().await.expect("read");
        assert_eq!(current.serial, 1);
        let written = store.write_snapshot(&current, &lock).await.expect("write");
        assert_eq!(written.serial, 2);
        assert_eq!(written.lineage, first.lineage);
        assert_eq!(store.read_version(2).await.expect("version").lineage, first.lineage);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("me", None).await.expect("lock");

        let mut snapshot = store.read_snapshot().await.expect("read");
        for _ in 0..4 {
            snapshot = store.write_snapshot(&snapshot, &lock).await.expect("write");
        }

        assert_eq!(store.prune_versions(2, &lock).await.expect("prune"), 2);
        let serials: Vec<u64> = store
            .list_versions()
            .await
            .expect("versions")
            .iter()
            .map(|v| v.serial)
            .collect();
        assert_eq!(serials, vec![3, 4]);
        assert!(matches!(
            store.read_version(1).await,
            Err(ConvergeError::State(StateError::VersionNotFound { serial: 1 }))
        ));
    }
}
