//! State types for tracking realised resources.
//!
//! A snapshot maps resource addresses to the records of what the engine
//! created, plus the `lineage`/`serial` pair used for optimistic concurrency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::Lifecycle;
use crate::expr::Attributes;
use crate::graph::ResourceAddress;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// The complete recorded state of one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Workspace (snapshot identifier) this snapshot belongs to.
    pub workspace: String,
    /// Identifier assigned when the snapshot was first created.
    pub lineage: String,
    /// Incremented on every persisted write.
    pub serial: u64,
    /// When the snapshot was last written.
    pub updated_at: DateTime<Utc>,
    /// Records keyed by address.
    #[serde(default)]
    pub resources: BTreeMap<ResourceAddress, ResourceRecord>,
    /// Published output values.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Record of one realised resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Instance address.
    pub address: ResourceAddress,
    /// Provider that manages the external object.
    pub provider: String,
    /// Provider-assigned identifier.
    pub external_id: String,
    /// Last known attribute values.
    pub attributes: Attributes,
    /// Instances this one depended on when last applied.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Lifecycle policy when last applied.
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// Old objects of a create-before-destroy replace not yet destroyed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<DeposedObject>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// An object replaced by a newer one but still awaiting destruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeposedObject {
    /// Provider-assigned identifier of the old object.
    pub external_id: String,
    /// Attributes of the old object.
    pub attributes: Attributes,
    /// When the object was deposed.
    pub deposed_at: DateTime<Utc>,
}

/// Summary of one retained snapshot version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotVersion {
    /// Serial of the version.
    pub serial: u64,
    /// Lineage of the version.
    pub lineage: String,
    /// When the version was written.
    pub written_at: DateTime<Utc>,
    /// Number of records in the version.
    pub resource_count: usize,
}

impl StateSnapshot {
    /// Creates a new empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new(workspace: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            workspace: workspace.to_string(),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Gets a record by address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&ResourceRecord> {
        self.resources.get(address)
    }

    /// Gets a mutable record by address.
    pub fn get_mut(&mut self, address: &ResourceAddress) -> Option<&mut ResourceRecord> {
        self.resources.get_mut(address)
    }

    /// Adds or replaces a record.
    pub fn set(&mut self, record: ResourceRecord) {
        self.resources.insert(record.address.clone(), record);
    }

    /// Removes a record by address.
    pub fn remove(&mut self, address: &ResourceAddress) -> Option<ResourceRecord> {
        self.resources.remove(address)
    }

    /// Returns true if a record exists at `address`.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.resources.contains_key(address)
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if this snapshot was never persisted.
    ///
    /// Every write produces serial 1 or higher, so serial 0 only exists
    /// before the first write and its lineage is not yet fixed.
    #[must_use]
    pub const fn is_initial(&self) -> bool {
        self.serial == 0
    }

    /// Returns true if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns the number of deposed objects across all records.
    #[must_use]
    pub fn deposed_count(&self) -> usize {
        self.resources.values().map(|r| r.deposed.len()).sum()
    }

    /// Returns the records that recorded a dependency on `address`.
    pub fn dependents_of<'a>(
        &'a self,
        address: &'a ResourceAddress,
    ) -> impl Iterator<Item = &'a ResourceRecord> + 'a {
        self.resources
            .values()
            .filter(move |r| r.dependencies.contains(address))
    }

    /// Forgets one destroyed object of `address`, current or deposed.
    ///
    /// When the current object goes while deposed objects remain, the most
    /// recently deposed one becomes current so that nothing stops being
    /// tracked. The record is removed once no object is left. Returns false
    /// if no such object was recorded.
    pub fn forget_object(&mut self, address: &ResourceAddress, external_id: &str) -> bool {
        let Some(record) = self.resources.get_mut(address) else {
            return false;
        };
        if record.external_id != external_id {
            return record.forget_deposed(external_id);
        }
        match record.deposed.pop() {
            Some(next) => {
                record.external_id = next.external_id;
                record.attributes = next.attributes;
                record.updated_at = Utc::now();
            }
            None => {
                self.resources.remove(address);
            }
        }
        true
    }

    /// Returns the `lineage/serial` label used in messages.
    #[must_use]
    pub fn version_label(&self) -> String {
        format!("{}/{}", self.lineage, self.serial)
    }

    /// Returns the version summary of this snapshot.
    #[must_use]
    pub fn version_summary(&self) -> SnapshotVersion {
        SnapshotVersion {
            serial: self.serial,
            lineage: self.lineage.clone(),
            written_at: self.updated_at,
            resource_count: self.resources.len(),
        }
    }
}

impl ResourceRecord {
    /// Creates a new record.
    #[must_use]
    pub fn new(
        address: ResourceAddress,
        provider: impl Into<String>,
        external_id: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        let now = Utc::now();
        Self {
            address,
            provider: provider.into(),
            external_id: external_id.into(),
            attributes,
            dependencies: BTreeSet::new(),
            lifecycle: Lifecycle::default(),
            deposed: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: BTreeSet<ResourceAddress>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Sets the recorded lifecycle.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.address.resource_type
    }

    /// Moves the current object to the deposed list.
    pub fn depose(&mut self) {
        self.deposed.push(DeposedObject {
            external_id: self.external_id.clone(),
            attributes: std::mem::take(&mut self.attributes),
            deposed_at: Utc::now(),
        });
    }

    /// Drops a deposed object; returns true if it was present.
    pub fn forget_deposed(&mut self, external_id: &str) -> bool {
        let before = self.deposed.len();
        self.deposed.retain(|d| d.external_id != external_id);
        self.deposed.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str) -> ResourceRecord {
        let attributes: Attributes = [(String::from("k"), json!("v"))].into_iter().collect();
        ResourceRecord::new(ResourceAddress::new("t", name), "local", format!("id-{name}"), attributes)
    }

    #[test]
    fn test_new_snapshot() {
        let a = StateSnapshot::new("default");
        let b = StateSnapshot::new("default");
        assert_eq!(a.serial, 0);
        assert!(a.is_empty());
        assert_ne!(a.lineage, b.lineage);
    }

    #[test]
    fn test_set_get_remove() {
        let mut snapshot = StateSnapshot::new("default");
        snapshot.set(record("a"));
        assert!(snapshot.contains(&ResourceAddress::new("t", "a")));
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.remove(&ResourceAddress::new("t", "a")).is_some());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_depose_and_forget() {
        let mut r = record("a");
        r.depose();
        assert_eq!(r.deposed.len(), 1);
        assert_eq!(r.deposed[0].external_id, "id-a");
        assert!(r.attributes.is_empty());
        assert!(r.forget_deposed("id-a"));
        assert!(!r.forget_deposed("id-a"));
    }

    #[test]
    fn test_dependents_of() {
        let mut snapshot = StateSnapshot::new("default");
        snapshot.set(record("a"));
        let deps = [ResourceAddress::new("t", "a")].into_iter().collect();
        snapshot.set(record("b").with_dependencies(deps));
        let a = ResourceAddress::new("t", "a");
        let names: Vec<&str> = snapshot
            .dependents_of(&a)
            .map(|r| r.address.name.as_str())
            .collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn test_forget_object_promotes_deposed() {
        let address = ResourceAddress::new("t", "a");
        let mut snapshot = StateSnapshot::new("default");
        let mut r = record("a");
        r.depose();
        r.external_id = String::from("id-new");
        snapshot.set(r);

        assert!(snapshot.forget_object(&address, "id-new"));
        assert_eq!(snapshot.get(&address).unwrap().external_id, "id-a");
        assert!(snapshot.get(&address).unwrap().deposed.is_empty());
        assert!(!snapshot.forget_object(&address, "id-new"));
        assert!(snapshot.forget_object(&address, "id-a"));
        assert!(!snapshot.contains(&address));
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let mut snapshot = StateSnapshot::new("default");
        snapshot.set(record("a"));
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: StateSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
