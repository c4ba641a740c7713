//! State locking for concurrent access protection.
//!
//! A lock is an exclusive token over one snapshot. At most one live lock
//! exists per snapshot; an expired lock may be reclaimed by a new run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Default lock expiry duration in seconds.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300; // 5 minutes

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Snapshot (workspace) the lock covers.
    pub snapshot_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires; `None` means never.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(snapshot_id: &str, holder: &str, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            snapshot_id: snapshot_id.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| now + ttl),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| Utc::now() > expires_at)
    }

    /// Returns the remaining time until expiry in seconds, if the lock expires.
    #[must_use]
    pub fn remaining_secs(&self) -> Option<i64> {
        self.expires_at
            .map(|expires_at| (expires_at - Utc::now()).num_seconds().max(0))
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().to_string(),
    );

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("default", "test-holder", Some(Duration::from_secs(60)));
        assert_eq!(lock.holder, "test-holder");
        assert_eq!(lock.snapshot_id, "default");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs().is_some_and(|s| s > 0));
    }

    #[test]
    fn test_lock_without_ttl_never_expires() {
        let lock = LockInfo::new("default", "h", None);
        assert!(!lock.is_expired());
        assert_eq!(lock.remaining_secs(), None);
    }

    #[test]
    fn test_lock_expiry() {
        let mut lock = LockInfo::new("default", "h", Some(Duration::from_secs(60)));
        lock.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), Some(0));
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }
}
