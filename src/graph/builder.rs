//! Graph building.
//!
//! Turns a desired-state document into expanded, bound resource instances
//! and the dependency graph between them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::config::Document;
use crate::error::ConfigError;
use crate::expr::{BindScope, BlockInstances, Expr, parse_value};

use super::address::ResourceAddress;
use super::dag::DependencyGraph;
use super::expand::{Multiplicity, ResourceInstance, expand_block};

/// Output of graph building.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuiltGraph {
    /// Dependency graph over every instance.
    pub graph: DependencyGraph,
    /// Expanded instances keyed by address.
    pub instances: BTreeMap<ResourceAddress, ResourceInstance>,
    /// Bound output expressions.
    pub outputs: BTreeMap<String, Expr>,
}

/// Builds dependency graphs from documents.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Expands, binds and links every resource of the document.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on duplicate addresses, unknown
    /// references, malformed expressions, or any dependency cycle.
    pub fn build(&self, document: &Document) -> Result<BuiltGraph, ConfigError> {
        debug!("Building graph from {} resource blocks", document.block_count());

        let mut seeds = Vec::with_capacity(document.resources.len());
        let mut blocks: BTreeMap<ResourceAddress, BlockInstances> = BTreeMap::new();
        let mut seen = BTreeSet::new();

        for block in &document.resources {
            let block_seeds = expand_block(block)?;
            for seed in &block_seeds {
                if !seen.insert(seed.address.clone()) {
                    return Err(ConfigError::DuplicateAddress {
                        address: seed.address.to_string(),
                    });
                }
            }
            blocks.insert(
                ResourceAddress::new(&block.resource_type, &block.name),
                BlockInstances {
                    multi: block.count.is_some() || block.for_each.is_some(),
                    addresses: block_seeds.iter().map(|s| s.address.clone()).collect(),
                },
            );
            seeds.push((block, block_seeds));
        }

        let mut built = BuiltGraph::default();

        for (block, block_seeds) in seeds {
            let raw_attributes = block
                .attributes
                .iter()
                .map(|(key, value)| {
                    parse_value(value, &format!("{}.{key}", block.label()))
                        .map(|raw| (key.clone(), raw))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            let multiplicity = Multiplicity::of(block);
            let provider = block.provider_name();

            for seed in block_seeds {
                let from = seed.address.to_string();
                let scope = BindScope {
                    from: &from,
                    count_index: seed.count_index,
                    each: seed.each.as_ref().map(|(k, v)| (k.as_str(), v)),
                    variables: &document.variables,
                    blocks: &blocks,
                };

                let attributes = raw_attributes
                    .iter()
                    .map(|(key, raw)| scope.bind(raw).map(|expr| (key.clone(), expr)))
                    .collect::<Result<BTreeMap<_, _>, _>>()?;

                let explicit_dependencies =
                    Self::resolve_depends_on(&block.depends_on, &from, &blocks)?;

                let instance = ResourceInstance {
                    address: seed.address.clone(),
                    provider: provider.clone(),
                    attributes,
                    explicit_dependencies,
                    lifecycle: block.lifecycle.clone(),
                    multiplicity: multiplicity.clone(),
                };

                built.graph.add_node(seed.address.clone());
                for dependency in instance.dependencies() {
                    built.graph.add_edge(seed.address.clone(), dependency);
                }
                built.instances.insert(seed.address, instance);
            }
        }

        built.graph.check_acyclic()?;

        for (name, value) in &document.outputs {
            let location = format!("output.{name}");
            let raw = parse_value(value, &location)?;
            let scope = BindScope {
                from: &location,
                count_index: None,
                each: None,
                variables: &document.variables,
                blocks: &blocks,
            };
            built.outputs.insert(name.clone(), scope.bind(&raw)?);
        }

        info!(
            "Built graph with {} instances and {} outputs",
            built.instances.len(),
            built.outputs.len()
        );
        Ok(built)
    }

    /// Resolves `depends_on` entries to instance addresses.
    fn resolve_depends_on(
        entries: &[String],
        from: &str,
        blocks: &BTreeMap<ResourceAddress, BlockInstances>,
    ) -> Result<BTreeSet<ResourceAddress>, ConfigError> {
        let mut out = BTreeSet::new();
        for entry in entries {
            let unknown = || ConfigError::UnknownReference {
                from: from.to_string(),
                target: entry.clone(),
            };
            let address: ResourceAddress = entry.parse()?;
            let block = blocks.get(&address.block()).ok_or_else(unknown)?;
            if address.key.is_some() {
                if !block.addresses.contains(&address) {
                    return Err(unknown());
                }
                out.insert(address);
            } else {
                out.extend(block.addresses.iter().cloned());
            }
        }
        Ok(out)
    }
}

impl BuiltGraph {
    /// Returns the instance at `address`.
    #[must_use]
    pub fn instance(&self, address: &ResourceAddress) -> Option<&ResourceInstance> {
        self.instances.get(address)
    }

    /// Returns the number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if the graph has no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn build(yaml: &str) -> Result<BuiltGraph, ConfigError> {
        let document = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        GraphBuilder::new().build(&document)
    }

    #[test]
    fn test_implicit_and_explicit_edges() {
        let built = build(
            r#"
resources:
  - type: local_dir
    name: root
    attributes: {path: out}
  - type: local_file
    name: file
    count: 2
    attributes:
      path: "${local_dir.root.path}/f${count.index}"
  - type: local_file
    name: index
    depends_on: [local_file.file]
    attributes: {path: index}
"#,
        )
        .unwrap();

        assert_eq!(built.len(), 4);
        let root = ResourceAddress::new("local_dir", "root");
        let file0 = ResourceAddress::new("local_file", "file").with_index(0);
        let index = ResourceAddress::new("local_file", "index");

        assert!(built.graph.dependencies(&file0).any(|d| d == &root));
        assert_eq!(built.graph.dependencies(&index).count(), 2);
        assert_eq!(built.instance(&file0).map(|i| i.provider.as_str()), Some("local"));

        let order = built.graph.creation_order().unwrap();
        assert_eq!(order.first(), Some(&root));
        assert_eq!(order.last(), Some(&index));
    }

    #[test]
    fn test_cycle_rejected_with_both_addresses() {
        let err = build(
            r#"
resources:
  - type: t_a
    name: x
    attributes: {v: "${t_a.y.id}"}
  - type: t_a
    name: y
    attributes: {v: "${t_a.x.id}"}
"#,
        )
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("t_a.x"));
        assert!(message.contains("t_a.y"));
    }

    #[test]
    fn test_duplicate_block() {
        let err = build(
            r"
resources:
  - {type: t_a, name: x}
  - {type: t_a, name: x}
",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAddress { address } if address == "t_a.x"));
    }

    #[test]
    fn test_unknown_depends_on() {
        let err = build(
            r"
resources:
  - {type: t_a, name: x, depends_on: [t_a.nope]}
",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReference { .. }));
    }

    #[test]
    fn test_for_each_value_and_outputs() {
        let built = build(
            r#"
resources:
  - type: t_a
    name: site
    for_each:
      eu: {size: 1}
      us: {size: 2}
    attributes:
      size: "${each.value.size}"
      region: "${each.key}"
outputs:
  ids: "${t_a.site[*].id}"
"#,
        )
        .unwrap();

        let us = built
            .instance(&ResourceAddress::new("t_a", "site").with_key("us"))
            .unwrap();
        assert_eq!(us.attributes["size"], Expr::Literal(serde_json::json!(2)));
        assert_eq!(us.attributes["region"], Expr::Literal(serde_json::json!("us")));
        assert!(matches!(built.outputs["ids"], Expr::Splat { ref targets, .. } if targets.len() == 2));
    }
}
