//! Multiplicity expansion.
//!
//! A `count` block expands into instances keyed by position, a `for_each`
//! block into instances keyed by the map/list keys. The two are kept apart
//! on purpose: removing an element from the middle of a `count` list shifts
//! the identity of every later instance, while removing a key only touches
//! that key's instance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::{ForEach, Lifecycle, ResourceBlock};
use crate::error::ConfigError;
use crate::expr::Expr;

use super::address::ResourceAddress;

/// How many instances a block declares and how they are keyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Multiplicity {
    /// One instance, no key.
    Single,
    /// `count` instances keyed `0..count`.
    Ordinal {
        /// Number of instances.
        count: usize,
    },
    /// One instance per key.
    Keyed {
        /// The instance keys.
        keys: BTreeSet<String>,
    },
}

/// One expanded, bound resource instance of the desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstance {
    /// Instance address.
    pub address: ResourceAddress,
    /// Name of the provider managing this instance.
    pub provider: String,
    /// Bound attribute expressions.
    pub attributes: BTreeMap<String, Expr>,
    /// Instances named in `depends_on`.
    #[serde(default)]
    pub explicit_dependencies: BTreeSet<ResourceAddress>,
    /// Lifecycle policy.
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// Multiplicity of the block this instance came from.
    pub multiplicity: Multiplicity,
}

/// One instance to be produced by a block, before binding.
#[derive(Debug, Clone)]
pub(crate) struct InstanceSeed {
    pub address: ResourceAddress,
    pub count_index: Option<usize>,
    pub each: Option<(String, Value)>,
}

impl Multiplicity {
    /// Returns the multiplicity declared by a block.
    #[must_use]
    pub fn of(block: &ResourceBlock) -> Self {
        match (&block.count, &block.for_each) {
            (Some(count), _) => Self::Ordinal { count: *count },
            (None, Some(ForEach::Keys(keys))) => Self::Keyed {
                keys: keys.iter().cloned().collect(),
            },
            (None, Some(ForEach::Map(map))) => Self::Keyed {
                keys: map.keys().cloned().collect(),
            },
            (None, None) => Self::Single,
        }
    }

    /// Returns true for `count` and `for_each` blocks.
    #[must_use]
    pub const fn is_multi(&self) -> bool {
        !matches!(self, Self::Single)
    }
}

impl ResourceInstance {
    /// Returns every instance this one depends on, implicit and explicit.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceAddress> {
        let mut out = self.explicit_dependencies.clone();
        for expr in self.attributes.values() {
            out.extend(expr.references());
        }
        out
    }
}

/// Expands a block into unbound instance seeds.
///
/// # Errors
///
/// Returns `ValidationError` if both `count` and `for_each` are set, and
/// `DuplicateAddress` if a `for_each` list repeats a key.
pub(crate) fn expand_block(block: &ResourceBlock) -> Result<Vec<InstanceSeed>, ConfigError> {
    let base = ResourceAddress::new(&block.resource_type, &block.name);

    match (&block.count, &block.for_each) {
        (Some(_), Some(_)) => Err(ConfigError::validation(
            "count and for_each are mutually exclusive",
            block.label(),
        )),
        (Some(count), None) => Ok((0..*count)
            .map(|i| InstanceSeed {
                address: base.clone().with_index(i),
                count_index: Some(i),
                each: None,
            })
            .collect()),
        (None, Some(ForEach::Keys(keys))) => {
            let mut seen = BTreeSet::new();
            keys.iter()
                .map(|key| {
                    let address = base.clone().with_key(key);
                    if !seen.insert(key) {
                        return Err(ConfigError::DuplicateAddress {
                            address: address.to_string(),
                        });
                    }
                    Ok(InstanceSeed {
                        address,
                        count_index: None,
                        each: Some((key.clone(), Value::String(key.clone()))),
                    })
                })
                .collect()
        }
        (None, Some(ForEach::Map(map))) => Ok(map
            .iter()
            .map(|(key, value)| InstanceSeed {
                address: base.clone().with_key(key),
                count_index: None,
                each: Some((key.clone(), value.clone())),
            })
            .collect()),
        (None, None) => Ok(vec![InstanceSeed {
            address: base,
            count_index: None,
            each: None,
        }]),
    }
}
