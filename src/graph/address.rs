//! Resource addresses.
//!
//! An address identifies one resource instance: its type, its symbolic name
//! and, for multi-instance resources, the instance key. Ordinal instances are
//! keyed by position (`web.api[0]`), keyed instances by their key
//! (`web.api["eu"]`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Key of one instance of a multi-instance resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceKey {
    /// Position within an ordinal (`count`) resource.
    Index(usize),
    /// Key within a keyed (`for_each`) resource.
    Key(String),
}

/// Stable identifier of a resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    /// Resource type (e.g. `local_file`).
    pub resource_type: String,
    /// Symbolic name from the configuration.
    pub name: String,
    /// Instance key, absent for single-instance resources.
    pub key: Option<InstanceKey>,
}

impl ResourceAddress {
    /// Creates an address for a single-instance resource.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            key: None,
        }
    }

    /// Returns this address with an ordinal index.
    #[must_use]
    pub fn with_index(mut self, index: usize) -> Self {
        self.key = Some(InstanceKey::Index(index));
        self
    }

    /// Returns this address with a string key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(InstanceKey::Key(key.into()));
        self
    }

    /// Returns the address of the resource block this instance belongs to.
    #[must_use]
    pub fn block(&self) -> Self {
        Self::new(self.resource_type.clone(), self.name.clone())
    }

    /// Returns true if both addresses belong to the same resource block.
    #[must_use]
    pub fn same_block(&self, other: &Self) -> bool {
        self.resource_type == other.resource_type && self.name == other.name
    }

    /// Returns the `type.name` part without the instance key.
    #[must_use]
    pub fn block_label(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "[{index}]"),
            Self::Key(key) => write!(f, "[\"{key}\"]"),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(key) = &self.key {
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

impl FromStr for ResourceAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| ConfigError::validation(message, s);

        let (head, key) = match s.find('[') {
            Some(open) => {
                let Some(inner) = s[open..].strip_prefix('[').and_then(|r| r.strip_suffix(']'))
                else {
                    return Err(invalid("unterminated instance key"));
                };
                let key = if let Some(quoted) =
                    inner.strip_prefix('"').and_then(|k| k.strip_suffix('"'))
                {
                    InstanceKey::Key(quoted.to_string())
                } else {
                    inner
                        .parse::<usize>()
                        .map(InstanceKey::Index)
                        .map_err(|_| invalid("instance key must be an integer or a quoted string"))?
                };
                (&s[..open], Some(key))
            }
            None => (s, None),
        };

        let mut parts = head.splitn(2, '.');
        let resource_type = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();

        if !is_identifier(resource_type) || !is_identifier(name) {
            return Err(invalid("address must look like TYPE.NAME[KEY]"));
        }

        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            key,
        })
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(address: ResourceAddress) -> Self {
        address.to_string()
    }
}

/// Returns true if `s` is a valid type or resource name.
#[must_use]
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_forms() {
        let single = ResourceAddress::new("local_file", "readme");
        assert_eq!(single.to_string(), "local_file.readme");
        assert_eq!(single.clone().with_index(2).to_string(), "local_file.readme[2]");
        assert_eq!(single.with_key("eu").to_string(), "local_file.readme[\"eu\"]");
    }

    #[test]
    fn test_parse_round_trips_display() {
        for text in ["a_b.c", "a_b.c[10]", "a_b.c[\"us-east\"]"] {
            let address: ResourceAddress = text.parse().expect("parse");
            assert_eq!(address.to_string(), text);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("nodot".parse::<ResourceAddress>().is_err());
        assert!("a.b[".parse::<ResourceAddress>().is_err());
        assert!("a.b[x]".parse::<ResourceAddress>().is_err());
        assert!("1a.b".parse::<ResourceAddress>().is_err());
    }

    #[test]
    fn test_block_ignores_key() {
        let a = ResourceAddress::new("t", "n").with_index(0);
        let b = ResourceAddress::new("t", "n").with_key("k");
        assert!(a.same_block(&b));
        assert_eq!(a.block(), ResourceAddress::new("t", "n"));
    }

    #[test]
    fn test_serde_as_string() {
        let address = ResourceAddress::new("t", "n").with_key("k");
        let json = serde_json::to_string(&address).expect("serialize");
        assert_eq!(json, "\"t.n[\\\"k\\\"]\"");
        let back: ResourceAddress = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, address);
    }
}
