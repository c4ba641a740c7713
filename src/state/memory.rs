//! In-memory state storage backend.
//!
//! Used by tests and by embedders that keep state themselves. Behaves like
//! the persistent backends: locks, lineage/serial checks and version history.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::LockInfo;
use super::store::{StateStore, check_lock, check_write, next_version};
use super::types::{SnapshotVersion, StateSnapshot};

#[derive(Debug, Default)]
struct Inner {
    current: Option<StateSnapshot>,
    versions: BTreeMap<u64, StateSnapshot>,
    lock: Option<LockInfo>,
}

/// In-memory state store.
#[derive(Debug)]
pub struct MemoryStateStore {
    workspace: String,
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    /// Creates an empty store for `workspace`.
    #[must_use]
    pub fn new(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Creates a store whose current snapshot is `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(snapshot.serial, snapshot.clone());
        Self {
            workspace: snapshot.workspace.clone(),
            inner: Mutex::new(Inner {
                current: Some(snapshot),
                versions,
                lock: None,
            }),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn snapshot_id(&self) -> &str {
        &self.workspace
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn acquire_lock(&self, holder: &str, ttl: Option<Duration>) -> Result<LockInfo> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = &inner.lock {
            if !existing.is_expired() {
                return Err(StateError::LockHeld {
                    lock_id: existing.lock_id.clone(),
                    holder: existing.holder.clone(),
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
        }

        let lock = LockInfo::new(&self.workspace, holder, ttl);
        inner.lock = Some(lock.clone());
        info!("Acquired state lock: {}", lock.lock_id);
        Ok(lock)
    }

    async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.lock.as_ref().is_some_and(|l| l.lock_id == lock.lock_id) {
            inner.lock = None;
            info!("Released state lock: {}", lock.lock_id);
        } else {
            debug!("Lock {} not held, nothing to release", lock.lock_id);
        }
        Ok(())
    }

    async fn force_unlock(&self, lock_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match &inner.lock {
            Some(existing) if existing.lock_id == lock_id => {
                warn!("Force-unlocking lock {lock_id} held by {}", existing.holder);
                inner.lock = None;
                Ok(())
            }
            _ => Err(StateError::lock_invalid(lock_id, "no such lock is held").into()),
        }
    }

    async fn current_lock(&self) -> Result<Option<LockInfo>> {
        Ok(self.inner.lock().await.lock.clone())
    }

    async fn read_snapshot(&self) -> Result<StateSnapshot> {
        let inner = self.inner.lock().await;
        Ok(inner
            .current
            .clone()
            .unwrap_or_else(|| StateSnapshot::new(&self.workspace)))
    }

    async fn write_snapshot(
        &self,
        snapshot: &StateSnapshot,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        let mut inner = self.inner.lock().await;
        check_lock(inner.lock.as_ref(), lock)?;
        check_write(inner.current.as_ref(), snapshot)?;

        let next = next_version(snapshot, &self.workspace, snapshot.serial + 1);
        inner.versions.insert(next.serial, next.clone());
        inner.current = Some(next.clone());
        debug!("Wrote state serial {}", next.serial);
        Ok(next)
    }

    async fn force_write_snapshot(
        &self,
        snapshot: &StateSnapshot,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        let mut inner = self.inner.lock().await;
        check_lock(inner.lock.as_ref(), lock)?;

        let serial = inner.current.as_ref().map_or(0, |c| c.serial) + 1;
        warn!(
            "Force-writing state serial {serial} with lineage {}",
            snapshot.lineage
        );
        let next = next_version(snapshot, &self.workspace, serial);
        inner.versions.insert(serial, next.clone());
        inner.current = Some(next.clone());
        Ok(next)
    }

    async fn list_versions(&self) -> Result<Vec<SnapshotVersion>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .versions
            .values()
            .map(StateSnapshot::version_summary)
            .collect())
    }

    async fn read_version(&self, serial: u64) -> Result<StateSnapshot> {
        let inner = self.inner.lock().await;
        inner
            .versions
            .get(&serial)
            .cloned()
            .ok_or_else(|| StateError::VersionNotFound { serial }.into())
    }

    async fn prune_versions(&self, keep: usize, lock: &LockInfo) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        check_lock(inner.lock.as_ref(), lock)?;

        let excess = inner.versions.len().saturating_sub(keep.max(1));
        let doomed: Vec<u64> = inner.versions.keys().take(excess).copied().collect();
        for serial in &doomed {
            inner.versions.remove(serial);
        }
        if !doomed.is_empty() {
            warn!("Pruned {} state versions", doomed.len());
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergeError;
    use crate::graph::ResourceAddress;
    use crate::state::types::ResourceRecord;
    use std::sync::Arc;

    fn record(name: &str) -> ResourceRecord {
        ResourceRecord::new(
            ResourceAddress::new("t", name),
            "local",
            format!("id-{name}"),
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn test_write_increments_serial_and_keeps_history() {
        let store = MemoryStateStore::new("default");
        let lock = store.acquire_lock("me", None).await.unwrap();

        let mut snapshot = store.read_snapshot().await.unwrap();
        snapshot.set(record("a"));
        let written = store.write_snapshot(&snapshot, &lock).await.unwrap();
        assert_eq!(written.serial, 1);
        assert_eq!(written.lineage, snapshot.lineage);

        let mut again = written.clone();
        again.set(record("b"));
        let written = store.write_snapshot(&again, &lock).await.unwrap();
        assert_eq!(written.serial, 2);

        let versions = store.list_versions().await.unwrap();
        assert_eq!(versions.iter().map(|v| v.serial).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.read_version(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_write_rejected() {
        let store = MemoryStateStore::new("default");
        let lock = store.acquire_lock("me", None).await.unwrap();
        let base = store.read_snapshot().await.unwrap();

        store.write_snapshot(&base, &lock).await.unwrap();
        let err = store.write_snapshot(&base, &lock).await.unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::State(StateError::SerialConflict { expected: 0, found: 1 })
        ));
    }

    #[tokio::test]
    async fn test_write_requires_lock() {
        let store = MemoryStateStore::new("default");
        let stray = LockInfo::new("default", "nobody", None);
        let snapshot = store.read_snapshot().await.unwrap();
        let err = store.write_snapshot(&snapshot, &stray).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::LockInvalid { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_exactly_one_wins() {
        let store = Arc::new(MemoryStateStore::new("default"));
        let a = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.acquire_lock("a", None).await }
        });
        let b = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.acquire_lock("b", None).await }
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(ConvergeError::State(StateError::LockHeld { .. }))
        )));
    }

    #[test]
    fn test_release_then_reacquire() {
        tokio_test::block_on(async {
            let store = MemoryStateStore::new("default");
            let lock = tokio_test::assert_ok!(store.acquire_lock("a", None).await);
            tokio_test::assert_err!(store.acquire_lock("b", None).await);
            tokio_test::assert_ok!(store.release_lock(&lock).await);
            tokio_test::assert_ok!(store.acquire_lock("b", None).await);
        });
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let store = MemoryStateStore::new("default");
        let first = store
            .acquire_lock("a", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = store.acquire_lock("b", None).await.unwrap();
        assert_ne!(first.lock_id, second.lock_id);

        // Releasing the stale lock must not drop the new one.
        store.release_lock(&first).await.unwrap();
        assert_eq!(store.current_lock().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_move_remove_import() {
        let store = MemoryStateStore::new("default");
        let lock = store.acquire_lock("me", None).await.unwrap();
        let mut snapshot = store.read_snapshot().await.unwrap();
        snapshot.set(record("a"));
        store.write_snapshot(&snapshot, &lock).await.unwrap();

        let a = ResourceAddress::new("t", "a");
        let b = ResourceAddress::new("t", "b");

        let moved = store.move_record(&a, &b, &lock).await.unwrap();
        assert_eq!(moved.get(&b).map(|r| r.external_id.as_str()), Some("id-a"));
        assert!(!moved.contains(&a));

        assert!(store.move_record(&a, &b, &lock).await.is_err());

        let imported = store
            .import_record(&a, "local", "ext-9", BTreeMap::new(), &lock)
            .await
            .unwrap();
        assert_eq!(imported.len(), 2);
        assert!(matches!(
            store.import_record(&a, "local", "ext-9", BTreeMap::new(), &lock).await,
            Err(ConvergeError::State(StateError::AddressOccupied { .. }))
        ));

        let removed = store.remove_record(&b, &lock).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed.serial, 4);
    }

    #[tokio::test]
    async fn test_force_unlock_and_prune() {
        let store = MemoryStateStore::new("default");
        let lock = store.acquire_lock("me", None).await.unwrap();
        let mut snapshot = store.read_snapshot().await.unwrap();
        for _ in 0..3 {
            snapshot = store.write_snapshot(&snapshot, &lock).await.unwrap();
        }

        assert_eq!(store.prune_versions(1, &lock).await.unwrap(), 2);
        assert_eq!(store.list_versions().await.unwrap().len(), 1);

        assert!(store.force_unlock("wrong").await.is_err());
        store.force_unlock(&lock.lock_id).await.unwrap();
        assert!(store.current_lock().await.unwrap().is_none());
    }
}
