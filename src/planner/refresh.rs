//! Drift refresh.
//!
//! Re-reads every recorded object through its provider so that planning
//! starts from what actually exists rather than from what was last written.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, PlanError, ProviderError, ProviderResult, Result};
use crate::graph::ResourceAddress;
use crate::provider::{Provider, ProviderOutput, ProviderRegistry};
use crate::state::StateSnapshot;

use super::diff::value_changes;

/// How a recorded object differs from the live one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DriftKind {
    /// The object exists but some attributes changed.
    Changed {
        /// Differing attribute paths.
        paths: Vec<String>,
    },
    /// The object no longer exists.
    Vanished,
}

/// One drifted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftEntry {
    /// Address of the record.
    pub address: ResourceAddress,
    /// External id that was read.
    pub external_id: String,
    /// What drifted.
    #[serde(flatten)]
    pub kind: DriftKind,
}

/// Result of a refresh.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// Snapshot with live values.
    pub snapshot: StateSnapshot,
    /// Records that differed from the live objects.
    pub drift: Vec<DriftEntry>,
}

impl fmt::Display for DriftEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DriftKind::Changed { paths } => {
                write!(f, "{} changed: {}", self.address, paths.join(", "))
            }
            DriftKind::Vanished => write!(f, "{} ({}) no longer exists", self.address, self.external_id),
        }
    }
}

struct ReadJob {
    address: ResourceAddress,
    external_id: String,
    deposed: bool,
    provider: Arc<dyn Provider>,
}

struct ReadResult {
    address: ResourceAddress,
    external_id: String,
    deposed: bool,
    result: ProviderResult<ProviderOutput>,
}

/// Reads every record of `snapshot` and returns a refreshed copy.
///
/// A record whose object is gone is dropped so that it plans as a create.
/// Deposed objects that are gone are forgotten. At most `parallelism` reads
/// are in flight, and each read is bounded by `operation_timeout`.
///
/// # Errors
///
/// Returns `MissingProvider` if a record's provider is not registered, or the
/// provider error of any read that failed for a reason other than not-found,
/// including a timeout.
pub async fn refresh_snapshot(
    snapshot: &StateSnapshot,
    providers: &ProviderRegistry,
    parallelism: usize,
    operation_timeout: Duration,
) -> Result<RefreshOutcome> {
    let mut jobs = Vec::new();
    for record in snapshot.resources.values() {
        let provider = providers
            .get(&record.provider)
            .ok_or_else(|| PlanError::MissingProvider {
                provider: record.provider.clone(),
                address: record.address.to_string(),
            })?;
        jobs.push(ReadJob {
            address: record.address.clone(),
            external_id: record.external_id.clone(),
            deposed: false,
            provider: Arc::clone(&provider),
        });
        for deposed in &record.deposed {
            jobs.push(ReadJob {
                address: record.address.clone(),
                external_id: deposed.external_id.clone(),
                deposed: true,
                provider: Arc::clone(&provider),
            });
        }
    }

    info!("Refreshing {} recorded objects", jobs.len());

    let mut refreshed = snapshot.clone();
    let mut drift = Vec::new();
    let mut vanished = BTreeSet::new();
    let mut pending = jobs.into_iter();
    let mut tasks = JoinSet::new();

    loop {
        while tasks.len() < parallelism.max(1) {
            let Some(job) = pending.next() else {
                break;
            };
            tasks.spawn(async move {
                let read = job.provider.read(&job.address.resource_type, &job.external_id);
                let result = match tokio::time::timeout(operation_timeout, read).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout("read", operation_timeout)),
                };
                ReadResult {
                    address: job.address,
                    external_id: job.external_id,
                    deposed: job.deposed,
                    result,
                }
            });
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let read = joined.map_err(|e| ConvergeError::internal(format!("refresh task failed: {e}")))?;

        match read.result {
            Ok(output) if read.deposed => {
                debug!("Deposed object {} of {} still exists", read.external_id, read.address);
                if let Some(record) = refreshed.get_mut(&read.address)
                    && let Some(deposed) = record
                        .deposed
                        .iter_mut()
                        .find(|d| d.external_id == read.external_id)
                {
                    deposed.attributes = output.attributes;
                }
            }
            Ok(output) => {
                let Some(record) = refreshed.get_mut(&read.address) else {
                    continue;
                };
                let mut changes = Vec::new();
                let keys: BTreeSet<&String> =
                    record.attributes.keys().chain(output.attributes.keys()).collect();
                for key in keys {
                    value_changes(key, record.attributes.get(key), output.attributes.get(key), &mut changes);
                }
                if !changes.is_empty() {
                    let paths: Vec<String> = changes.into_iter().map(|c| c.path).collect();
                    info!("Drift on {}: {}", read.address, paths.join(", "));
                    drift.push(DriftEntry {
                        address: read.address.clone(),
                        external_id: read.external_id.clone(),
                        kind: DriftKind::Changed { paths },
                    });
                    record.attributes = output.attributes;
                }
            }
            Err(e) if e.is_not_found() && read.deposed => {
                debug!("Deposed object {} of {} is already gone", read.external_id, read.address);
                if let Some(record) = refreshed.get_mut(&read.address) {
                    record.forget_deposed(&read.external_id);
                }
            }
            Err(e) if e.is_not_found() => {
                info!("{} ({}) no longer exists", read.address, read.external_id);
                vanished.insert(read.address.clone());
                drift.push(DriftEntry {
                    address: read.address,
                    external_id: read.external_id,
                    kind: DriftKind::Vanished,
                });
            }
            Err(e) => {
                tasks.abort_all();
                return Err(e.into());
            }
        }
    }

    for address in vanished {
        if let Some(record) = refreshed.remove(&address)
            && !record.deposed.is_empty()
        {
            warn!(
                "{address} vanished with {} deposed object(s) still recorded; they are no longer tracked",
                record.deposed.len()
            );
        }
    }

    drift.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(RefreshOutcome {
        snapshot: refreshed,
        drift,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Attributes;
    use crate::provider::{InMemoryProvider, ProviderOperation};
    use crate::state::{DeposedObject, ResourceRecord};
    use chrono::Utc;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn attrs(value: serde_json::Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    async fn setup() -> (Arc<InMemoryProvider>, ProviderRegistry, StateSnapshot) {
        let provider = Arc::new(InMemoryProvider::new("mem"));
        let registry = ProviderRegistry::new().with(provider.clone());
        let mut snapshot = StateSnapshot::new("default");
        for name in ["a", "b", "c"] {
            let attributes = attrs(json!({"size": 1}));
            let id = provider.insert_external("mem_thing", attributes.clone());
            snapshot.set(ResourceRecord::new(
                ResourceAddress::new("mem_thing", name),
                "mem",
                id,
                attributes,
            ));
        }
        (provider, registry, snapshot)
    }

    fn id_of(snapshot: &StateSnapshot, name: &str) -> String {
        snapshot
            .get(&ResourceAddress::new("mem_thing", name))
            .unwrap()
            .external_id
            .clone()
    }

    #[tokio::test]
    async fn test_refresh_without_drift() {
        let (provider, registry, snapshot) = setup().await;
        let outcome = refresh_snapshot(&snapshot, &registry, 2, TIMEOUT).await.unwrap();
        assert!(outcome.drift.is_empty());
        assert_eq!(outcome.snapshot, snapshot);
        assert_eq!(provider.call_count(ProviderOperation::Read), 3);
        assert!(provider.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_refresh_reports_changes_and_vanished() {
        let (provider, registry, snapshot) = setup().await;
        provider.set_external(&id_of(&snapshot, "a"), "size", json!(7));
        provider.delete_external(&id_of(&snapshot, "b"));

        let outcome = refresh_snapshot(&snapshot, &registry, 4, TIMEOUT).await.unwrap();
        assert_eq!(outcome.drift.len(), 2);
        assert_eq!(
            outcome.drift[0].kind,
            DriftKind::Changed {
                paths: vec![String::from("size")]
            }
        );
        assert_eq!(outcome.drift[1].kind, DriftKind::Vanished);

        let a = outcome.snapshot.get(&ResourceAddress::new("mem_thing", "a")).unwrap();
        assert_eq!(a.attributes["size"], json!(7));
        assert!(!outcome.snapshot.contains(&ResourceAddress::new("mem_thing", "b")));
        assert_eq!(outcome.snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_forgets_missing_deposed_objects() {
        let (_provider, registry, mut snapshot) = setup().await;
        let address = ResourceAddress::new("mem_thing", "a");
        snapshot.get_mut(&address).unwrap().deposed.push(DeposedObject {
            external_id: String::from("gone"),
            attributes: Attributes::new(),
            deposed_at: Utc::now(),
        });

        let outcome = refresh_snapshot(&snapshot, &registry, 4, TIMEOUT).await.unwrap();
        assert!(outcome.drift.is_empty());
        assert!(outcome.snapshot.get(&address).unwrap().deposed.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_read_failure_is_fatal() {
        let (provider, registry, snapshot) = setup().await;
        provider.fail(ProviderOperation::Read, "mem_thing", "api down");
        assert!(refresh_snapshot(&snapshot, &registry, 4, TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_slow_read_times_out() {
        let provider =
            Arc::new(InMemoryProvider::new("mem").with_latency(Duration::from_millis(500)));
        let registry = ProviderRegistry::new().with(provider.clone());
        let attributes = attrs(json!({"size": 1}));
        let id = provider.insert_external("mem_thing", attributes.clone());
        let mut snapshot = StateSnapshot::new("default");
        snapshot.set(ResourceRecord::new(
            ResourceAddress::new("mem_thing", "slow"),
            "mem",
            id,
            attributes,
        ));

        let started = std::time::Instant::now();
        let err = refresh_snapshot(&snapshot, &registry, 4, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(matches!(
            err,
            ConvergeError::Provider(ProviderError::Timeout { ref operation, .. }) if operation == "read"
        ));
    }

    #[tokio::test]
    async fn test_refresh_missing_provider() {
        let (_provider, _registry, snapshot) = setup().await;
        let err = refresh_snapshot(&snapshot, &ProviderRegistry::new(), 4, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::Plan(PlanError::MissingProvider { .. })));
    }
}
