//! Bound expression trees.
//!
//! Binding happens once per resource instance during graph expansion:
//! `count.index`, `each.*` and `var.*` become literals, and every resource
//! reference is resolved to concrete instance addresses. The resulting
//! [`Expr`] only depends on other instances, which is exactly what the
//! dependency graph needs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ConfigError;
use crate::graph::{InstanceKey, ResourceAddress};

use super::parse::{RawExpr, RawIndex, RawRef};

/// An expression bound to one resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// A constant value.
    Literal(Value),
    /// An attribute (or the whole object) of one instance.
    Ref {
        /// Referenced instance.
        target: ResourceAddress,
        /// Attribute path; empty means the whole object.
        path: Vec<String>,
    },
    /// The same attribute across several instances, yielding a list.
    Splat {
        /// Referenced instances in address order.
        targets: Vec<ResourceAddress>,
        /// Attribute path applied to each instance.
        path: Vec<String>,
    },
    /// Concatenation of rendered parts.
    Template(Vec<Expr>),
    /// A list.
    List(Vec<Expr>),
    /// A map.
    Object(BTreeMap<String, Expr>),
}

/// The instances a resource block expanded into.
#[derive(Debug, Clone)]
pub struct BlockInstances {
    /// True for `count`/`for_each` blocks.
    pub multi: bool,
    /// Instance addresses in key order.
    pub addresses: Vec<ResourceAddress>,
}

/// Everything binding needs to know about the instance being bound.
#[derive(Debug, Clone, Copy)]
pub struct BindScope<'a> {
    /// Label of the thing being bound, for error messages.
    pub from: &'a str,
    /// `count.index`, if the block uses `count`.
    pub count_index: Option<usize>,
    /// `each.key` and `each.value`, if the block uses `for_each`.
    pub each: Option<(&'a str, &'a Value)>,
    /// Document variables.
    pub variables: &'a BTreeMap<String, Value>,
    /// Instances of every block, keyed by block address.
    pub blocks: &'a BTreeMap<ResourceAddress, BlockInstances>,
}

impl Expr {
    /// Returns every instance address this expression reads.
    #[must_use]
    pub fn references(&self) -> BTreeSet<ResourceAddress> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut BTreeSet<ResourceAddress>) {
        match self {
            Self::Literal(_) => {}
            Self::Ref { target, .. } => {
                out.insert(target.clone());
            }
            Self::Splat { targets, .. } => out.extend(targets.iter().cloned()),
            Self::Template(parts) | Self::List(parts) => {
                for part in parts {
                    part.collect_references(out);
                }
            }
            Self::Object(map) => {
                for part in map.values() {
                    part.collect_references(out);
                }
            }
        }
    }

    /// Returns the constant value if this expression has no references.
    #[must_use]
    pub const fn as_literal(&self) -> Option<&Value> {
        match self {
            Self::Literal(value) => Some(value),
            _ => None,
        }
    }
}

impl BindScope<'_> {
    /// Binds a raw expression for this scope.
    ///
    /// # Errors
    ///
    /// Returns `UnknownReference` for references to absent resources or
    /// instances, and `InvalidExpression` for `count`/`each`/`var` misuse.
    pub fn bind(&self, raw: &RawExpr) -> Result<Expr, ConfigError> {
        match raw {
            RawExpr::Literal(value) => Ok(Expr::Literal(value.clone())),
            RawExpr::CountIndex => self
                .count_index
                .map(|i| Expr::Literal(Value::from(i)))
                .ok_or_else(|| self.invalid("count.index used outside a count resource")),
            RawExpr::EachKey => self
                .each
                .map(|(key, _)| Expr::Literal(Value::String(key.to_string())))
                .ok_or_else(|| self.invalid("each.key used outside a for_each resource")),
            RawExpr::EachValue(path) => {
                let (_, value) = self
                    .each
                    .ok_or_else(|| self.invalid("each.value used outside a for_each resource"))?;
                lookup_path(value, path)
                    .cloned()
                    .map(Expr::Literal)
                    .ok_or_else(|| self.invalid(format!("each.value has no path {}", path.join("."))))
            }
            RawExpr::Var { name, index, path } => self.bind_var(name, index.as_ref(), path),
            RawExpr::Ref(reference) => self.bind_ref(reference),
            RawExpr::Template(parts) => {
                let parts = parts
                    .iter()
                    .map(|part| self.bind(part))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(fold_template(parts))
            }
            RawExpr::List(items) => {
                let items = items
                    .iter()
                    .map(|item| self.bind(item))
                    .collect::<Result<Vec<_>, _>>()?;
                if items.iter().all(|item| item.as_literal().is_some()) {
                    Ok(Expr::Literal(Value::Array(
                        items.into_iter().filter_map(into_literal).collect(),
                    )))
                } else {
                    Ok(Expr::List(items))
                }
            }
            RawExpr::Object(map) => {
                let map = map
                    .iter()
                    .map(|(key, item)| self.bind(item).map(|expr| (key.clone(), expr)))
                    .collect::<Result<BTreeMap<_, _>, _>>()?;
                if map.values().all(|item| item.as_literal().is_some()) {
                    Ok(Expr::Literal(Value::Object(
                        map.into_iter()
                            .filter_map(|(key, expr)| into_literal(expr).map(|v| (key, v)))
                            .collect(),
                    )))
                } else {
                    Ok(Expr::Object(map))
                }
            }
        }
    }

    fn bind_var(
        &self,
        name: &str,
        index: Option<&RawIndex>,
        path: &[String],
    ) -> Result<Expr, ConfigError> {
        let value = self
            .variables
            .get(name)
            .ok_or_else(|| ConfigError::UnknownReference {
                from: self.from.to_string(),
                target: format!("var.{name}"),
            })?;

        let selected = match index {
            None => Some(value),
            Some(RawIndex::Int(i)) => value.get(*i),
            Some(RawIndex::Key(key)) => value.get(key),
            Some(RawIndex::CountIndex) => {
                let i = self
                    .count_index
                    .ok_or_else(|| self.invalid("count.index used outside a count resource"))?;
                value.get(i)
            }
            Some(RawIndex::EachKey) => {
                let (key, _) = self
                    .each
                    .ok_or_else(|| self.invalid("each.key used outside a for_each resource"))?;
                value.get(key)
            }
            Some(RawIndex::Splat) => return Err(self.invalid("var.* cannot be splatted")),
        };

        selected
            .and_then(|v| lookup_path(v, path))
            .cloned()
            .map(Expr::Literal)
            .ok_or_else(|| self.invalid(format!("var.{name} has no such element")))
    }

    fn bind_ref(&self, reference: &RawRef) -> Result<Expr, ConfigError> {
        let block_address = ResourceAddress::new(&reference.resource_type, &reference.name);
        let unknown = || ConfigError::UnknownReference {
            from: self.from.to_string(),
            target: reference.text.clone(),
        };
        let block = self.blocks.get(&block_address).ok_or_else(unknown)?;
        let path = reference.path.clone();

        let key = match &reference.index {
            None if block.multi => {
                return Ok(Expr::Splat {
                    targets: block.addresses.clone(),
                    path,
                });
            }
            None => {
                return Ok(Expr::Ref {
                    target: block_address,
                    path,
                });
            }
            Some(RawIndex::Splat) => {
                return Ok(Expr::Splat {
                    targets: block.addresses.clone(),
                    path,
                });
            }
            Some(RawIndex::Int(i)) => InstanceKey::Index(*i),
            Some(RawIndex::Key(key)) => InstanceKey::Key(key.clone()),
            Some(RawIndex::CountIndex) => InstanceKey::Index(
                self.count_index
                    .ok_or_else(|| self.invalid("count.index used outside a count resource"))?,
            ),
            Some(RawIndex::EachKey) => InstanceKey::Key(
                self.each
                    .map(|(key, _)| key.to_string())
                    .ok_or_else(|| self.invalid("each.key used outside a for_each resource"))?,
            ),
        };

        let target = ResourceAddress {
            key: Some(key),
            ..block_address
        };
        if block.addresses.contains(&target) {
            Ok(Expr::Ref { target, path })
        } else {
            Err(unknown())
        }
    }

    fn invalid(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::expression(self.from, message)
    }
}

fn into_literal(expr: Expr) -> Option<Value> {
    match expr {
        Expr::Literal(value) => Some(value),
        _ => None,
    }
}

/// Merges adjacent literal parts; a template of only literals becomes a
/// single string literal.
fn fold_template(parts: Vec<Expr>) -> Expr {
    let mut folded: Vec<Expr> = Vec::with_capacity(parts.len());
    for part in parts {
        if let Expr::Literal(value) = part {
            let text = render(&value);
            if let Some(Expr::Literal(Value::String(prev))) = folded.last_mut() {
                prev.push_str(&text);
            } else {
                folded.push(Expr::Literal(Value::String(text)));
            }
        } else {
            folded.push(part);
        }
    }
    if folded.is_empty() {
        return Expr::Literal(Value::String(String::new()));
    }
    if folded.len() == 1 && folded[0].as_literal().is_some() {
        return folded.remove(0);
    }
    Expr::Template(folded)
}

/// Renders a value as template text.
#[must_use]
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Walks `path` into `value`; numeric segments index arrays.
#[must_use]
pub fn lookup_path<'v>(value: &'v Value, path: &[String]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse::parse_string;
    use serde_json::json;

    fn blocks() -> BTreeMap<ResourceAddress, BlockInstances> {
        let mut blocks = BTreeMap::new();
        blocks.insert(
            ResourceAddress::new("t", "single"),
            BlockInstances {
                multi: false,
                addresses: vec![ResourceAddress::new("t", "single")],
            },
        );
        blocks.insert(
            ResourceAddress::new("t", "many"),
            BlockInstances {
                multi: true,
                addresses: vec![
                    ResourceAddress::new("t", "many").with_index(0),
                    ResourceAddress::new("t", "many").with_index(1),
                ],
            },
        );
        blocks
    }

    fn bind(source: &str, count_index: Option<usize>) -> Result<Expr, ConfigError> {
        let blocks = blocks();
        let variables: BTreeMap<String, Value> =
            [(String::from("names"), json!(["alpha", "beta"]))].into_iter().collect();
        let scope = BindScope {
            from: "t.x",
            count_index,
            each: None,
            variables: &variables,
            blocks: &blocks,
        };
        scope.bind(&parse_string(source, "t.x").unwrap())
    }

    #[test]
    fn test_count_index_and_var_become_literals() {
        assert_eq!(
            bind("${var.names[count.index]}-${count.index}", Some(1)).unwrap(),
            Expr::Literal(json!("beta-1"))
        );
        assert_eq!(bind("${count.index}", Some(3)).unwrap(), Expr::Literal(json!(3)));
    }

    #[test]
    fn test_reference_to_multi_block_is_splat() {
        let expr = bind("${t.many.id}", None).unwrap();
        assert!(matches!(expr, Expr::Splat { ref targets, .. } if targets.len() == 2));
        assert_eq!(expr.references().len(), 2);
    }

    #[test]
    fn test_indexed_reference() {
        let expr = bind("${t.many[count.index].id}", Some(1)).unwrap();
        assert_eq!(
            expr,
            Expr::Ref {
                target: ResourceAddress::new("t", "many").with_index(1),
                path: vec![String::from("id")],
            }
        );
    }

    #[test]
    fn test_unknown_references() {
        assert!(matches!(
            bind("${t.missing.id}", None),
            Err(ConfigError::UnknownReference { .. })
        ));
        assert!(matches!(
            bind("${t.many[5].id}", None),
            Err(ConfigError::UnknownReference { .. })
        ));
        assert!(matches!(
            bind("${var.nope}", None),
            Err(ConfigError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_count_index_outside_count() {
        assert!(matches!(
            bind("${count.index}", None),
            Err(ConfigError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_template_with_reference_stays_template() {
        let expr = bind("dir/${t.single.path}/x", None).unwrap();
        let Expr::Template(parts) = expr else {
            panic!("expected a template");
        };
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn test_lookup_path() {
        let value = json!({"a": [{"b": 1}]});
        let path = vec![String::from("a"), String::from("0"), String::from("b")];
        assert_eq!(lookup_path(&value, &path), Some(&json!(1)));
        assert_eq!(lookup_path(&value, &[String::from("z")]), None);
    }
}
