//! Desired-state document types.
//!
//! This module defines the structs that map to a `converge.yaml` document.
//! Attribute values are kept as raw JSON values here; the expression layer
//! turns them into typed expression trees during graph building.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use validator::Validate;

use crate::planner::{DEFAULT_OPERATION_TIMEOUT, DEFAULT_PARALLELISM};
use crate::state::DEFAULT_LOCK_TTL_SECS;

/// The root desired-state document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Engine settings.
    #[serde(default)]
    pub settings: EngineSettings,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Per-provider options, keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Named input values readable as `var.NAME`.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Resource blocks.
    #[serde(default)]
    pub resources: Vec<ResourceBlock>,
    /// Output values published into the snapshot after apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct EngineSettings {
    /// Maximum number of provider operations in flight.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 1024))]
    pub parallelism: usize,
    /// Lock time-to-live in seconds; 0 means the lock never expires.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Timeout for a single provider operation in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    #[validate(range(min = 1))]
    pub operation_timeout_secs: u64,
    /// Whether to re-read every recorded resource before planning.
    #[serde(default = "default_refresh")]
    pub refresh: bool,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Snapshot identifier; each workspace has its own snapshot and lock.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// State directory (local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Options for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Root directory (local provider).
    #[serde(default)]
    pub root: Option<String>,
    /// Attribute paths that force replacement, keyed by resource type.
    #[serde(default)]
    pub immutable: BTreeMap<String, Vec<String>>,
}

/// One resource block of the desired-state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceBlock {
    /// Resource type (e.g. `local_file`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Symbolic name, unique per type.
    pub name: String,
    /// Provider name; defaults to the type prefix before the first `_`.
    #[serde(default)]
    pub provider: Option<String>,
    /// Ordinal multiplicity.
    #[serde(default)]
    pub count: Option<usize>,
    /// Keyed multiplicity.
    #[serde(default)]
    pub for_each: Option<ForEach>,
    /// Explicit hard dependencies (`TYPE.NAME` or `TYPE.NAME[KEY]`).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle policy.
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// Raw attribute values, possibly containing `${...}` expressions.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// Keys of a keyed resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ForEach {
    /// A list of keys; `each.value` equals the key.
    Keys(Vec<String>),
    /// A map of key to value; `each.value` is the mapped value.
    Map(BTreeMap<String, Value>),
}

/// Lifecycle policy of a resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lifecycle {
    /// Create the replacement before destroying the old object.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Refuse any plan that would destroy this resource.
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Attribute paths whose differences are ignored (`*` ignores all).
    #[serde(default)]
    pub ignore_changes: BTreeSet<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            lock_ttl_secs: default_lock_ttl_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            refresh: default_refresh(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Local,
            workspace: default_workspace(),
            path: None,
            bucket: None,
            prefix: None,
            region: None,
        }
    }
}

impl EngineSettings {
    /// Returns the lock TTL, or `None` when locks never expire.
    #[must_use]
    pub const fn lock_ttl(&self) -> Option<std::time::Duration> {
        if self.lock_ttl_secs == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(self.lock_ttl_secs))
        }
    }

    /// Returns the per-operation provider timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Lifecycle {
    /// Returns true if differences at `path` are ignored.
    #[must_use]
    pub fn ignores(&self, path: &str) -> bool {
        self.ignore_changes.iter().any(|ignored| {
            ignored == "*"
                || ignored == path
                || path
                    .strip_prefix(ignored.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

impl ResourceBlock {
    /// Returns the `TYPE.NAME` label of this block.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }

    /// Returns the provider managing this block.
    ///
    /// An explicit `provider` wins; otherwise the type prefix before the
    /// first `_` is used (`local_file` is managed by `local`).
    #[must_use]
    pub fn provider_name(&self) -> String {
        self.provider.clone().unwrap_or_else(|| {
            self.resource_type
                .split('_')
                .next()
                .unwrap_or(&self.resource_type)
                .to_string()
        })
    }
}

impl Document {
    /// Returns the total number of resource blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.resources.len()
    }
}

const fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

const fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

const fn default_operation_timeout_secs() -> u64 {
    DEFAULT_OPERATION_TIMEOUT.as_secs()
}

const fn default_refresh() -> bool {
    true
}

fn default_workspace() -> String {
    String::from("default")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_changes_prefix_match() {
        let lifecycle = Lifecycle {
            ignore_changes: ["tags".to_string()].into_iter().collect(),
            ..Lifecycle::default()
        };
        assert!(lifecycle.ignores("tags"));
        assert!(lifecycle.ignores("tags.env"));
        assert!(!lifecycle.ignores("tagsx"));
        assert!(!lifecycle.ignores("content"));
    }

    #[test]
    fn test_ignore_everything() {
        let lifecycle = Lifecycle {
            ignore_changes: ["*".to_string()].into_iter().collect(),
            ..Lifecycle::default()
        };
        assert!(lifecycle.ignores("anything.at.all"));
    }

    #[test]
    fn test_zero_ttl_means_no_expiry() {
        let settings = EngineSettings {
            lock_ttl_secs: 0,
            ..EngineSettings::default()
        };
        assert!(settings.lock_ttl().is_none());
        assert_eq!(
            EngineSettings::default().lock_ttl(),
            Some(std::time::Duration::from_secs(300))
        );
    }

    #[test]
    fn test_for_each_accepts_list_or_map() {
        let list: ForEach = serde_yaml::from_str("[a, b]").unwrap();
        assert_eq!(list, ForEach::Keys(vec!["a".into(), "b".into()]));

        let map: ForEach = serde_yaml::from_str("{a: 1}").unwrap();
        assert!(matches!(map, ForEach::Map(m) if m.len() == 1));
    }
}
