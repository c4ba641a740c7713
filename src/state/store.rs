//! State store trait definition.
//!
//! This module defines the common interface for state storage backends and
//! the write checks every backend applies before persisting a snapshot.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, StateError};
use crate::expr::Attributes;
use crate::graph::ResourceAddress;

use super::lock::LockInfo;
use super::types::{ResourceRecord, SnapshotVersion, StateSnapshot};

/// Trait for state storage backends.
///
/// A store holds one snapshot (identified by [`StateStore::snapshot_id`]),
/// its retained versions, and at most one live lock.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the snapshot identifier this store manages.
    fn snapshot_id(&self) -> &str;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Acquires the lock; fails with `LockHeld` if a live lock exists.
    ///
    /// An expired lock is reclaimed and the takeover is logged.
    async fn acquire_lock(&self, holder: &str, ttl: Option<Duration>) -> Result<LockInfo>;

    /// Releases a lock. Idempotent: releasing an absent, expired or foreign
    /// lock is a no-op.
    async fn release_lock(&self, lock: &LockInfo) -> Result<()>;

    /// Removes the current lock regardless of holder, if its id matches.
    async fn force_unlock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn current_lock(&self) -> Result<Option<LockInfo>>;

    /// Reads the current snapshot. Never requires a lock.
    ///
    /// Returns a fresh empty snapshot (serial 0, new lineage) if nothing has
    /// been persisted yet.
    async fn read_snapshot(&self) -> Result<StateSnapshot>;

    /// Persists `snapshot` as the next version.
    ///
    /// The caller's lock must be live and held; the lineage must match the
    /// stored one and `snapshot.serial` must equal the stored serial. Returns
    /// the persisted snapshot, whose serial is one higher.
    async fn write_snapshot(&self, snapshot: &StateSnapshot, lock: &LockInfo)
    -> Result<StateSnapshot>;

    /// Persists `snapshot` ignoring lineage and serial checks.
    ///
    /// Administrative override; still requires a held lock.
    async fn force_write_snapshot(
        &self,
        snapshot: &StateSnapshot,
        lock: &LockInfo,
    ) -> Result<StateSnapshot>;

    /// Lists retained versions, oldest first.
    async fn list_versions(&self) -> Result<Vec<SnapshotVersion>>;

    /// Reads one retained version.
    async fn read_version(&self, serial: u64) -> Result<StateSnapshot>;

    /// Deletes all but the newest `keep` versions. Administrative override.
    async fn prune_versions(&self, keep: usize, lock: &LockInfo) -> Result<usize>;

    /// Moves a record to a new address without any provider call.
    async fn move_record(
        &self,
        from: &ResourceAddress,
        to: &ResourceAddress,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        let mut snapshot = self.read_snapshot().await?;

        if snapshot.contains(to) {
            return Err(StateError::AddressOccupied {
                address: to.to_string(),
            }
            .into());
        }
        let mut record = snapshot.remove(from).ok_or_else(|| StateError::AddressNotFound {
            address: from.to_string(),
        })?;

        record.address = to.clone();
        record.updated_at = Utc::now();
        snapshot.set(record);

        for other in snapshot.resources.values_mut() {
            if other.dependencies.remove(from) {
                other.dependencies.insert(to.clone());
            }
        }

        let written = self.write_snapshot(&snapshot, lock).await?;
        info!("Moved {from} to {to}");
        Ok(written)
    }

    /// Forgets a record without destroying the external object.
    async fn remove_record(
        &self,
        address: &ResourceAddress,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        let mut snapshot = self.read_snapshot().await?;

        let record = snapshot
            .remove(address)
            .ok_or_else(|| StateError::AddressNotFound {
                address: address.to_string(),
            })?;

        let written = self.write_snapshot(&snapshot, lock).await?;
        info!(
            "Removed {address} from state (external object {} left untouched)",
            record.external_id
        );
        Ok(written)
    }

    /// Records an existing external object at `address`.
    async fn import_record(
        &self,
        address: &ResourceAddress,
        provider: &str,
        external_id: &str,
        attributes: Attributes,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        let mut snapshot = self.read_snapshot().await?;

        if snapshot.contains(address) {
            return Err(StateError::AddressOccupied {
                address: address.to_string(),
            }
            .into());
        }

        snapshot.set(ResourceRecord::new(
            address.clone(),
            provider,
            external_id,
            attributes,
        ));

        let written = self.write_snapshot(&snapshot, lock).await?;
        info!("Imported {external_id} as {address}");
        Ok(written)
    }
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    fn snapshot_id(&self) -> &str {
        (**self).snapshot_id()
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }

    async fn acquire_lock(&self, holder: &str, ttl: Option<Duration>) -> Result<LockInfo> {
        (**self).acquire_lock(holder, ttl).await
    }

    async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
        (**self).release_lock(lock).await
    }

    async fn force_unlock(&self, lock_id: &str) -> Result<()> {
        (**self).force_unlock(lock_id).await
    }

    async fn current_lock(&self) -> Result<Option<LockInfo>> {
        (**self).current_lock().await
    }

    async fn read_snapshot(&self) -> Result<StateSnapshot> {
        (**self).read_snapshot().await
    }

    async fn write_snapshot(
        &self,
        snapshot: &StateSnapshot,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        (**self).write_snapshot(snapshot, lock).await
    }

    async fn force_write_snapshot(
        &self,
        snapshot: &StateSnapshot,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        (**self).force_write_snapshot(snapshot, lock).await
    }

    async fn list_versions(&self) -> Result<Vec<SnapshotVersion>> {
        (**self).list_versions().await
    }

    async fn read_version(&self, serial: u64) -> Result<StateSnapshot> {
        (**self).read_version(serial).await
    }

    async fn prune_versions(&self, keep: usize, lock: &LockInfo) -> Result<usize> {
        (**self).prune_versions(keep, lock).await
    }

    async fn move_record(
        &self,
        from: &ResourceAddress,
        to: &ResourceAddress,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        (**self).move_record(from, to, lock).await
    }

    async fn remove_record(
        &self,
        address: &ResourceAddress,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        (**self).remove_record(address, lock).await
    }

    async fn import_record(
        &self,
        address: &ResourceAddress,
        provider: &str,
        external_id: &str,
        attributes: Attributes,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        (**self)
            .import_record(address, provider, external_id, attributes, lock)
            .await
    }
}

/// Checks that `presented` is the live lock currently held on the store.
///
/// # Errors
///
/// Returns `LockInvalid` if no lock is held, a different lock is held, or
/// the presented lock has expired.
pub(crate) fn check_lock(held: Option<&LockInfo>, presented: &LockInfo) -> Result<()> {
    let Some(held) = held else {
        return Err(StateError::lock_invalid(&presented.lock_id, "no lock is held").into());
    };
    if held.lock_id != presented.lock_id {
        return Err(StateError::lock_invalid(
            &presented.lock_id,
            format!("lock is held by {} ({})", held.holder, held.lock_id),
        )
        .into());
    }
    if held.is_expired() {
        return Err(StateError::lock_invalid(&presented.lock_id, "lock has expired").into());
    }
    Ok(())
}

/// Checks a snapshot write against what is currently persisted.
///
/// # Errors
///
/// Returns `LineageMismatch` if the lineages differ and `SerialConflict` if
/// the write is not based on the stored serial.
pub(crate) fn check_write(stored: Option<&StateSnapshot>, incoming: &StateSnapshot) -> Result<()> {
    match stored {
        Some(stored) => {
            if stored.lineage != incoming.lineage {
                return Err(StateError::LineageMismatch {
                    expected: incoming.lineage.clone(),
                    found: stored.lineage.clone(),
                }
                .into());
            }
            if stored.serial != incoming.serial {
                return Err(StateError::SerialConflict {
                    expected: incoming.serial,
                    found: stored.serial,
                }
                .into());
            }
        }
        None => {
            if incoming.serial != 0 {
                return Err(StateError::SerialConflict {
                    expected: incoming.serial,
                    found: 0,
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Builds the snapshot that a successful write persists.
pub(crate) fn next_version(incoming: &StateSnapshot, workspace: &str, serial: u64) -> StateSnapshot {
    let mut next = incoming.clone();
    next.workspace = workspace.to_string();
    next.serial = serial;
    next.updated_at = Utc::now();
    next
}
