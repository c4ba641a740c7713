//! Evaluation of bound expressions.
//!
//! Values of other instances come from a [`ResolutionContext`] that the
//! planner and executor fill in as instances are planned or realised. A
//! value that depends on something not yet known evaluates to
//! [`Resolved::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::ResourceAddress;

use super::Attributes;
use super::bind::{Expr, lookup_path, render};

/// Attribute name that resolves to an instance's external identifier.
pub const ID_ATTRIBUTE: &str = "id";

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum Resolved {
    /// The value is known now.
    Known(Value),
    /// The value will only be known after apply.
    Unknown,
}

/// What is known about one instance.
#[derive(Debug, Clone, Default)]
struct ContextEntry {
    external_id: Option<String>,
    attributes: Attributes,
    unknown: BTreeSet<String>,
    all_unknown: bool,
}

/// Known values of instances, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    entries: BTreeMap<ResourceAddress, ContextEntry>,
}

impl Resolved {
    /// Returns the known value, if any.
    #[must_use]
    pub const fn known(&self) -> Option<&Value> {
        match self {
            Self::Known(value) => Some(value),
            Self::Unknown => None,
        }
    }

    /// Returns true if the value is not yet known.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl std::fmt::Display for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

impl ResolutionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an instance whose values are fully known.
    pub fn insert_known(
        &mut self,
        address: ResourceAddress,
        external_id: impl Into<String>,
        attributes: Attributes,
    ) {
        self.entries.insert(
            address,
            ContextEntry {
                external_id: Some(external_id.into()),
                attributes,
                unknown: BTreeSet::new(),
                all_unknown: false,
            },
        );
    }

    /// Records an instance whose values are known except for `unknown` keys.
    ///
    /// `external_id` is `None` when the instance will get a new identifier.
    pub fn insert_partial(
        &mut self,
        address: ResourceAddress,
        external_id: Option<String>,
        attributes: Attributes,
        unknown: BTreeSet<String>,
    ) {
        self.entries.insert(
            address,
            ContextEntry {
                external_id,
                attributes,
                unknown,
                all_unknown: false,
            },
        );
    }

    /// Records an instance about which nothing is known until apply.
    pub fn insert_unknown(&mut self, address: ResourceAddress) {
        self.entries.insert(
            address,
            ContextEntry {
                all_unknown: true,
                ..ContextEntry::default()
            },
        );
    }

    /// Forgets an instance.
    pub fn remove(&mut self, address: &ResourceAddress) {
        self.entries.remove(address);
    }

    /// Returns true if the context has an entry for `address`.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.entries.contains_key(address)
    }

    /// Evaluates an expression.
    #[must_use]
    pub fn evaluate(&self, expr: &Expr) -> Resolved {
        match expr {
            Expr::Literal(value) => Resolved::Known(value.clone()),
            Expr::Ref { target, path } => self.lookup(target, path),
            Expr::Splat { targets, path } => {
                let mut values = Vec::with_capacity(targets.len());
                for target in targets {
                    match self.lookup(target, path) {
                        Resolved::Known(value) => values.push(value),
                        Resolved::Unknown => return Resolved::Unknown,
                    }
                }
                Resolved::Known(Value::Array(values))
            }
            Expr::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match self.evaluate(part) {
                        Resolved::Known(value) => out.push_str(&render(&value)),
                        Resolved::Unknown => return Resolved::Unknown,
                    }
                }
                Resolved::Known(Value::String(out))
            }
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match self.evaluate(item) {
                        Resolved::Known(value) => values.push(value),
                        Resolved::Unknown => return Resolved::Unknown,
                    }
                }
                Resolved::Known(Value::Array(values))
            }
            Expr::Object(map) => {
                let mut values = serde_json::Map::new();
                for (key, item) in map {
                    match self.evaluate(item) {
                        Resolved::Known(value) => {
                            values.insert(key.clone(), value);
                        }
                        Resolved::Unknown => return Resolved::Unknown,
                    }
                }
                Resolved::Known(Value::Object(values))
            }
        }
    }

    /// Evaluates a map of attribute expressions.
    ///
    /// Returns the known values and the set of keys whose value is unknown.
    #[must_use]
    pub fn evaluate_attributes(
        &self,
        attributes: &BTreeMap<String, Expr>,
    ) -> (Attributes, BTreeSet<String>) {
        let mut known = Attributes::new();
        let mut unknown = BTreeSet::new();
        for (key, expr) in attributes {
            match self.evaluate(expr) {
                Resolved::Known(value) => {
                    known.insert(key.clone(), value);
                }
                Resolved::Unknown => {
                    unknown.insert(key.clone());
                }
            }
        }
        (known, unknown)
    }

    fn lookup(&self, target: &ResourceAddress, path: &[String]) -> Resolved {
        let Some(entry) = self.entries.get(target) else {
            return Resolved::Unknown;
        };
        if entry.all_unknown {
            return Resolved::Unknown;
        }

        let Some((first, rest)) = path.split_first() else {
            if !entry.unknown.is_empty() {
                return Resolved::Unknown;
            }
            let Some(id) = &entry.external_id else {
                return Resolved::Unknown;
            };
            let mut object: serde_json::Map<String, Value> = entry
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            object.insert(ID_ATTRIBUTE.to_string(), Value::String(id.clone()));
            return Resolved::Known(Value::Object(object));
        };

        if first == ID_ATTRIBUTE && !entry.attributes.contains_key(ID_ATTRIBUTE) {
            return entry.external_id.as_ref().map_or(Resolved::Unknown, |id| {
                if rest.is_empty() {
                    Resolved::Known(Value::String(id.clone()))
                } else {
                    Resolved::Known(Value::Null)
                }
            });
        }
        if entry.unknown.contains(first) {
            return Resolved::Unknown;
        }

        let value = entry
            .attributes
            .get(first)
            .and_then(|value| lookup_path(value, rest))
            .cloned()
            .unwrap_or(Value::Null);
        Resolved::Known(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    fn reference(target: &ResourceAddress, path: &[&str]) -> Expr {
        Expr::Ref {
            target: target.clone(),
            path: path.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_known_and_id() {
        let a = ResourceAddress::new("t", "a");
        let mut ctx = ResolutionContext::new();
        ctx.insert_known(a.clone(), "ext-1", attrs(json!({"path": "/tmp/x", "meta": {"k": 2}})));

        assert_eq!(ctx.evaluate(&reference(&a, &["id"])), Resolved::Known(json!("ext-1")));
        assert_eq!(ctx.evaluate(&reference(&a, &["meta", "k"])), Resolved::Known(json!(2)));
        assert_eq!(ctx.evaluate(&reference(&a, &["missing"])), Resolved::Known(Value::Null));

        let whole = ctx.evaluate(&reference(&a, &[]));
        assert_eq!(whole.known().and_then(|v| v.get("id")), Some(&json!("ext-1")));
    }

    #[test]
    fn test_absent_and_unknown() {
        let a = ResourceAddress::new("t", "a");
        let mut ctx = ResolutionContext::new();
        assert!(ctx.evaluate(&reference(&a, &["id"])).is_unknown());

        ctx.insert_unknown(a.clone());
        assert!(ctx.evaluate(&reference(&a, &["path"])).is_unknown());

        ctx.insert_partial(
            a.clone(),
            Some(String::from("ext")),
            attrs(json!({"path": "p"})),
            ["size".to_string()].into_iter().collect(),
        );
        assert_eq!(ctx.evaluate(&reference(&a, &["path"])), Resolved::Known(json!("p")));
        assert!(ctx.evaluate(&reference(&a, &["size"])).is_unknown());
        assert!(ctx.evaluate(&reference(&a, &[])).is_unknown());
    }

    #[test]
    fn test_template_and_splat() {
        let a0 = ResourceAddress::new("t", "a").with_index(0);
        let a1 = ResourceAddress::new("t", "a").with_index(1);
        let mut ctx = ResolutionContext::new();
        ctx.insert_known(a0.clone(), "x", Attributes::new());

        let splat = Expr::Splat {
            targets: vec![a0.clone(), a1.clone()],
            path: vec![String::from("id")],
        };
        assert!(ctx.evaluate(&splat).is_unknown());

        ctx.insert_known(a1.clone(), "y", Attributes::new());
        assert_eq!(ctx.evaluate(&splat), Resolved::Known(json!(["x", "y"])));

        let template = Expr::Template(vec![
            Expr::Literal(json!("ids: ")),
            reference(&a0, &["id"]),
            Expr::Literal(json!(",")),
            reference(&a1, &["id"]),
        ]);
        assert_eq!(ctx.evaluate(&template), Resolved::Known(json!("ids: x,y")));
    }

    #[test]
    fn test_evaluate_attributes_splits_unknown() {
        let a = ResourceAddress::new("t", "a");
        let ctx = ResolutionContext::new();
        let exprs: BTreeMap<String, Expr> = [
            (String::from("fixed"), Expr::Literal(json!(1))),
            (String::from("later"), reference(&a, &["id"])),
        ]
        .into_iter()
        .collect();

        let (known, unknown) = ctx.evaluate_attributes(&exprs);
        assert_eq!(known.get("fixed"), Some(&json!(1)));
        assert!(unknown.contains("later"));
    }

    #[test]
    fn test_unknown_display() {
        assert_eq!(Resolved::Unknown.to_string(), "(known after apply)");
        assert_eq!(Resolved::Known(json!("a")).to_string(), "\"a\"");
    }
}
