//! S3-based state storage backend.
//!
//! Remote state in AWS S3 (or a compatible service) for teams sharing one
//! workspace. Objects per workspace:
//!
//! ```text
//! <prefix><workspace>/state.json
//! <prefix><workspace>/state.lock
//! <prefix><workspace>/versions/<serial>.json
//! ```
//!
//! Lock and version objects are created with `If-None-Match: *`, so two
//! writers racing for the same serial or the same lock cannot both succeed.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::LockInfo;
use super::store::{StateStore, check_lock, check_write, next_version};
use super::types::{SnapshotVersion, StateSnapshot};

/// State object key suffix.
const STATE_KEY: &str = "state.json";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// Version key prefix.
const VERSIONS_KEY: &str = "versions/";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix including the workspace.
    prefix: String,
    /// Workspace name.
    workspace: String,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        workspace: &str,
    ) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix, workspace))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>, workspace: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: workspace_prefix(prefix, workspace),
            workspace: workspace.to_string(),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    fn version_key(&self, serial: u64) -> String {
        self.key(&format!("{VERSIONS_KEY}{serial:010}.json"))
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_tagged(key).await?.map(|tagged| tagged.content))
    }

    /// Gets an object and its ETag from S3.
    async fn get_tagged(&self, key: &str) -> Result<Option<Tagged>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some(Tagged { content, etag }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Reads the lock object and its ETag.
    async fn get_lock(&self, key: &str) -> Result<Option<(LockInfo, String)>> {
        let Some(tagged) = self.get_tagged(key).await? else {
            return Ok(None);
        };
        let lock: LockInfo = serde_json::from_str(&tagged.content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse {key}: {e}")))?;
        let etag = tagged
            .etag
            .ok_or_else(|| StateError::s3(format!("S3 returned no ETag for {key}")))?;
        Ok(Some((lock, etag)))
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(content) = self.get_object(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::corrupted(format!("Failed to parse {key}: {e}")).into())
    }

    /// Puts an object to S3, overwriting any existing one.
    async fn put_object(&self, key: &str, content: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Puts an object only if no object exists at `key`.
    ///
    /// Returns `Ok(false)` when the object already exists.
    async fn put_object_if_absent(&self, key: &str, content: String) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) if is_precondition_failure(&sdk_err) => Ok(false),
            Err(sdk_err) => Err(StateError::s3(format!("S3 put error: {sdk_err}")).into()),
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Deletes an object only if its ETag is still `etag`.
    ///
    /// Returns `Ok(false)` when the object was replaced or removed meanwhile.
    async fn delete_object_if_match(&self, key: &str, etag: &str) -> Result<bool> {
        let result = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .if_match(etag)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) if is_precondition_failure(&sdk_err) => Ok(false),
            Err(sdk_err) => Err(StateError::s3(format!("S3 delete error: {sdk_err}")).into()),
        }
    }

    async fn version_serials(&self) -> Result<Vec<u64>> {
        let prefix = self.key(VERSIONS_KEY);
        let mut serials = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StateError::s3(format!("S3 list error: {e}")))?;

            serials.extend(response.contents().iter().filter_map(|object| {
                object
                    .key()
                    .and_then(|k| k.strip_prefix(prefix.as_str()))
                    .and_then(|k| k.strip_suffix(".json"))
                    .and_then(|k| k.parse::<u64>().ok())
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        serials.sort_unstable();
        Ok(serials)
    }

    /// Reads the committed snapshot, rolling forward a version object that
    /// a crashed writer left one serial past `state.json`.
    async fn read_current(&self) -> Result<Option<StateSnapshot>> {
        let current: Option<StateSnapshot> = self.get_json(&self.key(STATE_KEY)).await?;
        let next_serial = current.as_ref().map_or(1, |c| c.serial + 1);
        let leftover: Option<StateSnapshot> = self.get_json(&self.version_key(next_serial)).await?;

        match leftover {
            Some(leftover) if current.as_ref().is_none_or(|c| c.lineage == leftover.lineage) => {
                warn!(
                    "Rolling forward uncommitted state serial {} in s3://{}/{}",
                    leftover.serial, self.bucket, self.prefix
                );
                Ok(Some(leftover))
            }
            _ => Ok(current),
        }
    }

    /// Persists `next` as a new version and as the current snapshot.
    async fn commit(&self, next: &StateSnapshot) -> Result<()> {
        let content = to_json(next)?;
        let version_key = self.version_key(next.serial);

        if !self.put_object_if_absent(&version_key, content.clone()).await? {
            let existing: Option<StateSnapshot> = self.get_json(&version_key).await?;
            match existing {
                Some(existing) if existing.lineage != next.lineage => {
                    warn!(
                        "Overwriting uncommitted state serial {} of lineage {}",
                        existing.serial, existing.lineage
                    );
                    self.put_object(&version_key, content.clone()).await?;
                }
                _ => {
                    return Err(StateError::SerialConflict {
                        expected: next.serial - 1,
                        found: next.serial,
                    }
                    .into());
                }
            }
        }

        let key = self.key(STATE_KEY);
        self.put_object(&key, content).await?;
        info!("Saved state serial {} to s3://{}/{key}", next.serial, self.bucket);
        Ok(())
    }
}

/// Object content with the ETag it was read at.
struct Tagged {
    content: String,
    etag: Option<String>,
}

fn workspace_prefix(prefix: Option<&str>, workspace: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{p}/{workspace}/"),
        _ => format!("{workspace}/"),
    }
}

fn is_precondition_failure<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    matches!(
        err.code(),
        Some("PreconditionFailed" | "ConditionalRequestConflict")
    )
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")).into())
}

#[async_trait]
impl StateStore for S3StateStore {
    fn snapshot_id(&self) -> &str {
        &self.workspace
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    async fn acquire_lock(&self, holder: &str, ttl: Option<Duration>) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);
        let lock = LockInfo::new(&self.workspace, holder, ttl);

        for _ in 0..3 {
            if self.put_object_if_absent(&key, to_json(&lock)?).await? {
                info!("Acquired state lock: {} on s3://{}/{key}", lock.lock_id, self.bucket);
                return Ok(lock);
            }

            let Some((existing, etag)) = self.get_lock(&key).await? else {
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

            // Only the expired lock that was read may be removed; a lock taken
            // by another reclaimer in between has a different ETag.
            if self.delete_object_if_match(&key, &etag).await? {
                warn!(
                    "Reclaimed expired lock {} held by {} since {}",
                    existing.lock_id,
                    existing.holder,
                    existing.acquired_at.to_rfc3339()
                );
            } else {
                debug!("Expired lock {} was reclaimed by another run", existing.lock_id);
            }
        }

        Err(StateError::s3("Lock object kept changing while acquiring").into())
    }

    async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
        let key = self.key(LOCK_KEY);

        match self.get_lock(&key).await? {
            Some((existing, etag)) if existing.lock_id == lock.lock_id => {
                if self.delete_object_if_match(&key, &etag).await? {
                    info!("Released state lock: {}", lock.lock_id);
                } else {
                    debug!("Lock {} changed before release", lock.lock_id);
                }
            }
            Some((existing, _)) => debug!(
                "Lock ID mismatch: expected {}, found {}",
                lock.lock_id, existing.lock_id
            ),
            None => debug!("Lock {} already released", lock.lock_id),
        }
        Ok(())
    }

    async fn force_unlock(&self, lock_id: &str) -> Result<()> {
        let key = self.key(LOCK_KEY);

        match self.get_lock(&key).await? {
            Some((existing, etag)) if existing.lock_id == lock_id => {
                warn!("Force-unlocking lock {lock_id} held by {}", existing.holder);
                if self.delete_object_if_match(&key, &etag).await? {
                    Ok(())
                } else {
                    Err(StateError::lock_invalid(lock_id, "lock changed while unlocking").into())
                }
            }
            _ => Err(StateError::lock_invalid(lock_id, "no such lock is held").into()),
        }
    }

    async fn current_lock(&self) -> Result<Option<LockInfo>> {
        self.get_json(&self.key(LOCK_KEY)).await
    }

    async fn read_snapshot(&self) -> Result<StateSnapshot> {
        debug!("Loading state from s3://{}/{}{STATE_KEY}", self.bucket, self.prefix);

        match self.read_current().await? {
            Some(snapshot) => Ok(snapshot),
            None => {
                debug!("No state found in S3");
                Ok(StateSnapshot::new(&self.workspace))
            }
        }
    }

    async fn write_snapshot(
        &self,
        snapshot: &StateSnapshot,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        check_lock(self.current_lock().await?.as_ref(), lock)?;

        let stored = self.read_current().await?;
        check_write(stored.as_ref(), snapshot)?;

        let next = next_version(snapshot, &self.workspace, snapshot.serial + 1);
        self.commit(&next).await?;
        Ok(next)
    }

    async fn force_write_snapshot(
        &self,
        snapshot: &StateSnapshot,
        lock: &LockInfo,
    ) -> Result<StateSnapshot> {
        check_lock(self.current_lock().await?.as_ref(), lock)?;

        let stored_serial = self.read_current().await?.map_or(0, |s| s.serial);
        let latest_version = self.version_serials().await?.last().copied().unwrap_or(0);
        let serial = stored_serial.max(latest_version) + 1;

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
        for serial in self.version_serials().await? {
            if let Some(snapshot) = self
                .get_json::<StateSnapshot>(&self.version_key(serial))
                .await?
            {
                versions.push(snapshot.version_summary());
            }
        }
        Ok(versions)
    }

    async fn read_version(&self, serial: u64) -> Result<StateSnapshot> {
        self.get_json(&self.version_key(serial))
            .await?
            .ok_or_else(|| StateError::VersionNotFound { serial }.into())
    }

    async fn prune_versions(&self, keep: usize, lock: &LockInfo) -> Result<usize> {
        check_lock(self.current_lock().await?.as_ref(), lock)?;

        let serials = self.version_serials().await?;
        let excess = serials.len().saturating_sub(keep.max(1));
        for serial in &serials[..excess] {
            self.delete_object(&self.version_key(*serial)).await?;
        }
        if excess > 0 {
            warn!("Pruned {excess} state versions from s3://{}/{}", self.bucket, self.prefix);
        }
        Ok(excess)
    }
}
