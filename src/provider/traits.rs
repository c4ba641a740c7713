//! Provider trait and capability tables.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProviderResult;
use crate::expr::Attributes;

/// What a provider returns after creating, reading or updating an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutput {
    /// Provider-assigned identifier.
    pub external_id: String,
    /// Attribute values as the provider reports them.
    pub attributes: Attributes,
}

impl ProviderOutput {
    /// Creates a new output.
    #[must_use]
    pub fn new(external_id: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            external_id: external_id.into(),
            attributes,
        }
    }
}

/// Whether a changed attribute can be updated in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    /// The provider updates the attribute on the existing object.
    #[default]
    InPlace,
    /// Changing the attribute requires a new object.
    RequiresReplace,
}

/// Per-type mapping from attribute paths to their mutability.
///
/// Paths are dotted (`spec.zone`). A path entry covers itself and every
/// nested path below it; the longest matching entry wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable {
    /// Mutability of paths with no matching entry.
    #[serde(default)]
    pub default: Mutability,
    /// Explicit entries.
    #[serde(default)]
    pub paths: BTreeMap<String, Mutability>,
}

impl CapabilityTable {
    /// A table where every attribute is updatable in place.
    #[must_use]
    pub fn in_place() -> Self {
        Self::default()
    }

    /// A table where the given paths force replacement.
    #[must_use]
    pub fn requires_replace<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default: Mutability::InPlace,
            paths: paths
                .into_iter()
                .map(|p| (p.into(), Mutability::RequiresReplace))
                .collect(),
        }
    }

    /// Adds or overrides one entry.
    #[must_use]
    pub fn with(mut self, path: impl Into<String>, mutability: Mutability) -> Self {
        self.paths.insert(path.into(), mutability);
        self
    }

    /// Classifies a changed attribute path.
    ///
    /// A change at `path` that contains a replace-only nested path also
    /// requires replacement.
    #[must_use]
    pub fn mutability(&self, path: &str) -> Mutability {
        let covering = self
            .paths
            .iter()
            .filter(|(entry, _)| covers(entry, path))
            .max_by_key(|(entry, _)| entry.len())
            .map_or(self.default, |(_, m)| *m);

        if covering == Mutability::RequiresReplace {
            return covering;
        }

        let nested_replace = self.paths.iter().any(|(entry, m)| {
            *m == Mutability::RequiresReplace && entry.len() > path.len() && covers(path, entry)
        });

        if nested_replace {
            Mutability::RequiresReplace
        } else {
            covering
        }
    }

    /// Returns true if a change at `path` requires replacement.
    #[must_use]
    pub fn requires_replacement(&self, path: &str) -> bool {
        self.mutability(path) == Mutability::RequiresReplace
    }
}

/// Returns true if `prefix` is `path` or an ancestor of it.
fn covers(prefix: &str, path: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Trait for providers that realise resources as external objects.
///
/// Every method acts on a single object. A provider error is local to the
/// one call that produced it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name as used in resource blocks.
    fn name(&self) -> &str;

    /// Mutability table for a resource type.
    fn capabilities(&self, resource_type: &str) -> CapabilityTable;

    /// Creates a new object.
    async fn create(
        &self,
        resource_type: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderOutput>;

    /// Reads the live attributes of an object.
    ///
    /// Returns `ProviderError::NotFound` if the object no longer exists.
    async fn read(&self, resource_type: &str, external_id: &str) -> ProviderResult<ProviderOutput>;

    /// Updates an object in place.
    async fn update(
        &self,
        resource_type: &str,
        external_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderOutput>;

    /// Destroys an object.
    async fn destroy(&self, resource_type: &str, external_id: &str) -> ProviderResult<()>;
}
