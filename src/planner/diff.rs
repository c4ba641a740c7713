//! Diff engine: desired instances versus recorded state.
//!
//! This module computes, per resource address, the action that converges
//! the snapshot to the configuration, and splits the actions into ordered
//! executable steps.

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Lifecycle;
use crate::error::{PlanError, Result};
use crate::expr::{Attributes, ResolutionContext, Resolved, lookup_path};
use crate::graph::{BuiltGraph, DependencyGraph, ResourceAddress, ResourceInstance};
use crate::provider::ProviderRegistry;
use crate::state::{ResourceRecord, StateSnapshot};

use super::plan::{
    ActionKind, AttributeChange, Plan, PlanMode, PlanStep, PlannedAction, StepOperation,
    check_steps_acyclic,
};

/// Engine for computing plans.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    providers: &'a ProviderRegistry,
    config_hash: String,
}

/// One differing leaf between two attribute values.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    /// Dotted path of the leaf.
    pub path: String,
    /// Old value.
    pub before: Option<Value>,
    /// New value.
    pub after: Option<Value>,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine using `providers` for capability lookups.
    #[must_use]
    pub const fn new(providers: &'a ProviderRegistry) -> Self {
        Self {
            providers,
            config_hash: String::new(),
        }
    }

    /// Sets the config hash recorded in produced plans.
    #[must_use]
    pub fn with_config_hash(mut self, config_hash: impl Into<String>) -> Self {
        self.config_hash = config_hash.into();
        self
    }

    /// Computes a plan.
    ///
    /// `snapshot` should already be refreshed; its values are treated as
    /// ground truth.
    ///
    /// # Errors
    ///
    /// Returns `PreventDestroy` if the plan would destroy a protected
    /// resource, `MissingProvider` if an instance's provider is not
    /// registered, and `DependencyResolutionFailed` if the steps cannot be
    /// ordered.
    pub fn plan(&self, built: &BuiltGraph, snapshot: &StateSnapshot, mode: PlanMode) -> Result<Plan> {
        let mut actions = match mode {
            PlanMode::Apply => self.plan_apply(built, snapshot)?,
            PlanMode::Destroy => self.plan_destroy(built, snapshot)?,
        };

        for record in snapshot.resources.values() {
            for deposed in &record.deposed {
                actions.push(PlannedAction {
                    address: record.address.clone(),
                    kind: ActionKind::DestroyDeposed,
                    provider: record.provider.clone(),
                    changes: Vec::new(),
                    prior_external_id: Some(deposed.external_id.clone()),
                    create_before_destroy: false,
                    reason: format!("deposed object {} awaiting destruction", deposed.external_id),
                });
            }
        }

        let steps = build_steps(&actions, &built.graph, snapshot)?;

        let plan = Plan {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            mode,
            workspace: snapshot.workspace.clone(),
            lineage: snapshot.lineage.clone(),
            serial: snapshot.serial,
            config_hash: self.config_hash.clone(),
            actions,
            steps,
            graph: built.clone(),
        };

        info!("{}", plan.summary());
        Ok(plan)
    }

    fn plan_apply(&self, built: &BuiltGraph, snapshot: &StateSnapshot) -> Result<Vec<PlannedAction>> {
        let mut context = ResolutionContext::new();
        let mut actions = Vec::with_capacity(built.len());

        for address in built.graph.creation_order()? {
            let Some(instance) = built.instance(&address) else {
                continue;
            };
            actions.push(self.diff_instance(instance, snapshot.get(&address), &mut context)?);
        }

        propagate_create_before_destroy(&mut actions, &built.graph);

        for record in snapshot.resources.values() {
            if built.instances.contains_key(&record.address) {
                continue;
            }
            if record.lifecycle.prevent_destroy {
                return Err(PlanError::PreventDestroy {
                    address: record.address.to_string(),
                }
                .into());
            }
            self.require_provider(&record.provider, &record.address)?;
            debug!("{} is no longer configured", record.address);
            actions.push(destroy_action(record, "no longer in configuration"));
        }

        Ok(actions)
    }

    fn plan_destroy(&self, built: &BuiltGraph, snapshot: &StateSnapshot) -> Result<Vec<PlannedAction>> {
        let mut actions = Vec::with_capacity(snapshot.len());
        for record in snapshot.resources.values() {
            let lifecycle = built
                .instance(&record.address)
                .map_or(&record.lifecycle, |instance| &instance.lifecycle);
            if lifecycle.prevent_destroy {
                return Err(PlanError::PreventDestroy {
                    address: record.address.to_string(),
                }
                .into());
            }
            self.require_provider(&record.provider, &record.address)?;
            actions.push(destroy_action(record, "destroy requested"));
        }
        Ok(actions)
    }

    fn require_provider(&self, provider: &str, address: &ResourceAddress) -> Result<()> {
        if self.providers.contains(provider) {
            Ok(())
        } else {
            Err(PlanError::MissingProvider {
                provider: provider.to_string(),
                address: address.to_string(),
            }
            .into())
        }
    }

    /// Diffs one instance against its record and records what dependents
    /// will see of it in `context`.
    fn diff_instance(
        &self,
        instance: &ResourceInstance,
        record: Option<&ResourceRecord>,
        context: &mut ResolutionContext,
    ) -> Result<PlannedAction> {
        let address = &instance.address;
        let provider = self
            .providers
            .get(&instance.provider)
            .ok_or_else(|| PlanError::MissingProvider {
                provider: instance.provider.clone(),
                address: address.to_string(),
            })?;

        let (mut desired, unknown) = context.evaluate_attributes(&instance.attributes);

        let Some(record) = record else {
            let changes = instance
                .attributes
                .keys()
                .map(|key| AttributeChange {
                    path: key.clone(),
                    before: None,
                    after: desired
                        .get(key)
                        .cloned()
                        .map_or(Resolved::Unknown, Resolved::Known),
                    requires_replace: false,
                })
                .collect();
            context.insert_partial(address.clone(), None, desired, unknown);
            return Ok(PlannedAction {
                address: address.clone(),
                kind: ActionKind::Create,
                provider: instance.provider.clone(),
                changes,
                prior_external_id: None,
                create_before_destroy: instance.lifecycle.create_before_destroy,
                reason: String::from("not present in state"),
            });
        };

        let lifecycle = &instance.lifecycle;
        overlay_ignored(&mut desired, &record.attributes, lifecycle);
        let capabilities = provider.capabilities(&address.resource_type);

        let mut changes = Vec::new();
        for key in instance.attributes.keys() {
            if unknown.contains(key) {
                if !lifecycle.ignores(key) {
                    changes.push(AttributeChange {
                        path: key.clone(),
                        before: record.attributes.get(key).cloned(),
                        after: Resolved::Unknown,
                        requires_replace: capabilities.requires_replacement(key),
                    });
                }
                continue;
            }

            let mut leaves = Vec::new();
            value_changes(key, record.attributes.get(key), desired.get(key), &mut leaves);
            for leaf in leaves {
                if lifecycle.ignores(&leaf.path) {
                    continue;
                }
                changes.push(AttributeChange {
                    requires_replace: capabilities.requires_replacement(&leaf.path),
                    path: leaf.path,
                    before: leaf.before,
                    after: Resolved::Known(leaf.after.unwrap_or(Value::Null)),
                });
            }
        }

        let base = PlannedAction {
            address: address.clone(),
            kind: ActionKind::NoOp,
            provider: instance.provider.clone(),
            changes: Vec::new(),
            prior_external_id: Some(record.external_id.clone()),
            create_before_destroy: lifecycle.create_before_destroy,
            reason: String::from("up to date"),
        };

        if changes.is_empty() {
            context.insert_known(
                address.clone(),
                record.external_id.clone(),
                record.attributes.clone(),
            );
            return Ok(base);
        }

        if changes.iter().any(|c| c.requires_replace) {
            if lifecycle.prevent_destroy {
                return Err(PlanError::PreventDestroy {
                    address: address.to_string(),
                }
                .into());
            }
            let forcing: Vec<&str> = changes
                .iter()
                .filter(|c| c.requires_replace)
                .map(|c| c.path.as_str())
                .collect();
            let reason = format!("{} forces replacement", forcing.join(", "));
            context.insert_partial(address.clone(), None, desired, unknown);
            return Ok(PlannedAction {
                kind: ActionKind::Replace,
                changes,
                reason,
                ..base
            });
        }

        let still_unknown: BTreeSet<String> = unknown
            .into_iter()
            .filter(|key| !lifecycle.ignores(key))
            .collect();
        let mut merged = record.attributes.clone();
        merged.extend(desired);
        for key in &still_unknown {
            merged.remove(key);
        }
        context.insert_partial(
            address.clone(),
            Some(record.external_id.clone()),
            merged,
            still_unknown,
        );

        let reason = format!("{} attribute change(s)", changes.len());
        Ok(PlannedAction {
            kind: ActionKind::Update,
            changes,
            reason,
            ..base
        })
    }
}

fn destroy_action(record: &ResourceRecord, reason: &str) -> PlannedAction {
    PlannedAction {
        address: record.address.clone(),
        kind: ActionKind::Destroy,
        provider: record.provider.clone(),
        changes: Vec::new(),
        prior_external_id: Some(record.external_id.clone()),
        create_before_destroy: false,
        reason: reason.to_string(),
    }
}

/// Replacing a create-before-destroy resource first requires its replaced
/// dependencies to be create-before-destroy too; otherwise the old
/// dependency would have to be destroyed before the dependent's new object
/// exists.
fn propagate_create_before_destroy(actions: &mut [PlannedAction], graph: &DependencyGraph) {
    loop {
        let early: BTreeSet<ResourceAddress> = actions
            .iter()
            .filter(|a| a.kind == ActionKind::Replace && a.create_before_destroy)
            .map(|a| a.address.clone())
            .collect();

        let mut changed = false;
        for action in actions.iter_mut() {
            if action.kind == ActionKind::Replace
                && !action.create_before_destroy
                && graph.dependents(&action.address).any(|d| early.contains(d))
            {
                debug!("{} inherits create_before_destroy from a dependent", action.address);
                action.create_before_destroy = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// Splits actions into steps and orders them.
///
/// - Forward steps (create/update) follow the configuration graph.
/// - A default replace destroys before it creates; a create-before-destroy
///   replace creates first and destroys the deposed object afterwards.
/// - Every destroy of B waits for the destroys of instances depending on B.
/// - Destroys of orphans, deposed objects and create-before-destroy old
///   objects also wait for the dependents' forward steps.
fn build_steps(
    actions: &[PlannedAction],
    graph: &DependencyGraph,
    snapshot: &StateSnapshot,
) -> std::result::Result<Vec<PlanStep>, PlanError> {
    let mut steps: Vec<PlanStep> = Vec::new();
    let mut forward: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
    let mut destroys: BTreeMap<ResourceAddress, Vec<(usize, bool)>> = BTreeMap::new();

    let push = |steps: &mut Vec<PlanStep>, action: &PlannedAction, operation: StepOperation| {
        let id = steps.len();
        steps.push(PlanStep {
            id,
            address: action.address.clone(),
            provider: action.provider.clone(),
            operation,
            depends_on: BTreeSet::new(),
        });
        id
    };

    for action in actions {
        let prior = action.prior_external_id.clone().unwrap_or_default();
        match action.kind {
            ActionKind::NoOp => {}
            ActionKind::Create => {
                let id = push(&mut steps, action, StepOperation::Create);
                forward.insert(action.address.clone(), id);
            }
            ActionKind::Update => {
                let id = push(&mut steps, action, StepOperation::Update { external_id: prior });
                forward.insert(action.address.clone(), id);
            }
            ActionKind::Replace if action.create_before_destroy => {
                let create = push(&mut steps, action, StepOperation::Create);
                let destroy = push(
                    &mut steps,
                    action,
                    StepOperation::DestroyDeposed { external_id: prior },
                );
                steps[destroy].depends_on.insert(create);
                forward.insert(action.address.clone(), create);
                destroys.entry(action.address.clone()).or_default().push((destroy, true));
            }
            ActionKind::Replace => {
                let destroy = push(&mut steps, action, StepOperation::Destroy { external_id: prior });
                let create = push(&mut steps, action, StepOperation::Create);
                steps[create].depends_on.insert(destroy);
                forward.insert(action.address.clone(), create);
                destroys.entry(action.address.clone()).or_default().push((destroy, false));
            }
            ActionKind::Destroy => {
                let id = push(&mut steps, action, StepOperation::Destroy { external_id: prior });
                destroys.entry(action.address.clone()).or_default().push((id, true));
            }
            ActionKind::DestroyDeposed => {
                let id = push(
                    &mut steps,
                    action,
                    StepOperation::DestroyDeposed { external_id: prior },
                );
                destroys.entry(action.address.clone()).or_default().push((id, true));
            }
        }
    }

    for (address, step) in &forward {
        for dependency in graph.dependencies(address) {
            if let Some(dep_step) = forward.get(dependency) {
                steps[*step].depends_on.insert(*dep_step);
            }
        }
    }

    for (address, list) in &destroys {
        let dependents: BTreeSet<&ResourceAddress> = graph
            .dependents(address)
            .chain(snapshot.dependents_of(address).map(|r| &r.address))
            .filter(|dependent| *dependent != address)
            .collect();

        for (destroy, waits_for_forward) in list {
            for dependent in &dependents {
                for (dependent_destroy, _) in destroys.get(*dependent).into_iter().flatten() {
                    steps[*destroy].depends_on.insert(*dependent_destroy);
                }
                if *waits_for_forward && let Some(dependent_forward) = forward.get(*dependent) {
                    steps[*destroy].depends_on.insert(*dependent_forward);
                }
            }
        }
    }

    check_steps_acyclic(&steps)?;
    Ok(steps)
}

/// Copies ignored attribute paths from `prior` into `desired`.
pub(crate) fn overlay_ignored(desired: &mut Attributes, prior: &Attributes, lifecycle: &Lifecycle) {
    for ignored in &lifecycle.ignore_changes {
        if ignored == "*" {
            for (key, value) in desired.iter_mut() {
                if let Some(old) = prior.get(key) {
                    value.clone_from(old);
                }
            }
            continue;
        }

        let mut segments = ignored.split('.').map(String::from);
        let Some(first) = segments.next() else {
            continue;
        };
        let rest: Vec<String> = segments.collect();

        let Some(old) = prior.get(&first).and_then(|v| lookup_path(v, &rest)) else {
            continue;
        };
        let Some(target) = desired.get_mut(&first) else {
            continue;
        };
        if let Some(slot) = lookup_path_mut(target, &rest) {
            slot.clone_from(old);
        }
    }
}

fn lookup_path_mut<'v>(value: &'v mut Value, path: &[String]) -> Option<&'v mut Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

/// Collects the differing leaves between two values.
///
/// Objects are compared key by key; anything else is compared whole.
pub fn value_changes(path: &str, before: Option<&Value>, after: Option<&Value>, out: &mut Vec<ValueChange>) {
    match (before, after) {
        (Some(Value::Object(old)), Some(Value::Object(new))) => {
            let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            for key in keys {
                value_changes(&format!("{path}.{key}"), old.get(key), new.get(key), out);
            }
        }
        _ if before == after => {}
        _ => out.push(ValueChange {
            path: path.to_string(),
            before: before.cloned(),
            after: after.cloned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::GraphBuilder;
    use crate::provider::InMemoryProvider;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new().with(Arc::new(
            InMemoryProvider::new("mem").with_replace_paths("mem_thing", ["zone"]),
        ))
    }

    fn build(yaml: &str) -> BuiltGraph {
        let document = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        GraphBuilder::new().build(&document).unwrap()
    }

    fn addr(name: &str) -> ResourceAddress {
        ResourceAddress::new("mem_thing", name)
    }

    fn record(name: &str, id: &str, attributes: Value) -> ResourceRecord {
        let attributes = serde_json::from_value(attributes).unwrap();
        ResourceRecord::new(addr(name), "mem", id, attributes)
    }

    fn snapshot(records: Vec<ResourceRecord>) -> StateSnapshot {
        let mut snapshot = StateSnapshot::new("default");
        for r in records {
            snapshot.set(r);
        }
        snapshot
    }

    fn plan(yaml: &str, snapshot: &StateSnapshot) -> Result<Plan> {
        let registry = registry();
        DiffEngine::new(&registry).plan(&build(yaml), snapshot, PlanMode::Apply)
    }

    fn kind(plan: &Plan, name: &str) -> ActionKind {
        plan.action(&addr(name)).map(|a| a.kind).unwrap()
    }

    const PAIR: &str = r#"
resources:
  - type: mem_thing
    name: a
    attributes: {zone: eu, size: 1}
  - type: mem_thing
    name: b
    attributes: {parent: "${mem_thing.a.id}", size: 1}
"#;

    #[test]
    fn test_everything_created_in_dependency_order() {
        let plan = plan(PAIR, &snapshot(vec![])).unwrap();
        assert_eq!(kind(&plan, "a"), ActionKind::Create);
        assert_eq!(kind(&plan, "b"), ActionKind::Create);

        let b_action = plan.action(&addr("b")).unwrap();
        let parent = b_action.changes.iter().find(|c| c.path == "parent").unwrap();
        assert_eq!(parent.after, Resolved::Unknown);

        assert_eq!(plan.steps.len(), 2);
        let a_step = plan.steps.iter().find(|s| s.address == addr("a")).unwrap();
        let b_step = plan.steps.iter().find(|s| s.address == addr("b")).unwrap();
        assert!(b_step.depends_on.contains(&a_step.id));
    }

    #[test]
    fn test_matching_state_is_no_op() {
        let state = snapshot(vec![
            record("a", "id-a", json!({"zone": "eu", "size": 1, "computed": "x"})),
            record("b", "id-b", json!({"parent": "id-a", "size": 1})),
        ]);
        let plan = plan(PAIR, &state).unwrap();
        assert_eq!(plan.summary().no_op, 2);
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_mutable_change_is_update() {
        let state = snapshot(vec![
            record("a", "id-a", json!({"zone": "eu", "size": 5})),
            record("b", "id-b", json!({"parent": "id-a", "size": 1})),
        ]);
        let plan = plan(PAIR, &state).unwrap();
        assert_eq!(kind(&plan, "a"), ActionKind::Update);
        assert_eq!(kind(&plan, "b"), ActionKind::NoOp);
        assert_eq!(
            plan.steps[0].operation,
            StepOperation::Update {
                external_id: String::from("id-a")
            }
        );
    }

    #[test]
    fn test_immutable_change_replaces_and_cascades_unknown_id() {
        let state = snapshot(vec![
            record("a", "id-a", json!({"zone": "us", "size": 1})),
            record("b", "id-b", json!({"parent": "id-a", "size": 1})),
        ]);
        let plan = plan(PAIR, &state).unwrap();
        assert_eq!(kind(&plan, "a"), ActionKind::Replace);
        assert_eq!(kind(&plan, "b"), ActionKind::Update);

        let destroy = plan
            .steps
            .iter()
            .find(|s| matches!(s.operation, StepOperation::Destroy { .. }))
            .unwrap();
        let create = plan
            .steps
            .iter()
            .find(|s| s.address == addr("a") && s.operation == StepOperation::Create)
            .unwrap();
        assert!(create.depends_on.contains(&destroy.id));
    }

    #[test]
    fn test_create_before_destroy_orders_destroy_last() {
        let yaml = r"
resources:
  - type: mem_thing
    name: a
    lifecycle: {create_before_destroy: true}
    attributes: {zone: eu}
";
        let state = snapshot(vec![record("a", "id-a", json!({"zone": "us"}))]);
        let plan = plan(yaml, &state).unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].operation, StepOperation::Create);
        assert_eq!(
            plan.steps[1].operation,
            StepOperation::DestroyDeposed {
                external_id: String::from("id-a")
            }
        );
        assert!(plan.steps[1].depends_on.contains(&0));
    }

    #[test]
    fn test_create_before_destroy_propagates_to_replaced_dependency() {
        let yaml = r#"
resources:
  - type: mem_thing
    name: a
    attributes: {zone: eu}
  - type: mem_thing
    name: b
    lifecycle: {create_before_destroy: true}
    attributes: {zone: "${mem_thing.a.zone}"}
"#;
        let state = snapshot(vec![
            record("a", "id-a", json!({"zone": "us"})),
            record("b", "id-b", json!({"zone": "us"})),
        ]);
        let plan = plan(yaml, &state).unwrap();
        assert!(plan.action(&addr("a")).unwrap().create_before_destroy);
        assert_eq!(kind(&plan, "b"), ActionKind::Replace);
    }

    #[test]
    fn test_ignore_changes() {
        let yaml = r"
resources:
  - type: mem_thing
    name: a
    lifecycle: {ignore_changes: [tags, zone]}
    attributes: {zone: eu, tags: {team: core}}
";
        let state = snapshot(vec![record(
            "a",
            "id-a",
            json!({"zone": "us", "tags": {"team": "ops"}}),
        )]);
        let plan = plan(yaml, &state).unwrap();
        assert_eq!(kind(&plan, "a"), ActionKind::NoOp);
    }

    #[test]
    fn test_orphan_destroyed_after_dependent_update() {
        let yaml = r"
resources:
  - type: mem_thing
    name: b
    attributes: {size: 2}
";
        let deps = [addr("a")].into_iter().collect();
        let state = snapshot(vec![
            record("a", "id-a", json!({"zone": "eu"})),
            record("b", "id-b", json!({"size": 1})).with_dependencies(deps),
        ]);
        let plan = plan(yaml, &state).unwrap();
        assert_eq!(kind(&plan, "a"), ActionKind::Destroy);
        assert_eq!(kind(&plan, "b"), ActionKind::Update);

        let update = plan.steps.iter().find(|s| s.address == addr("b")).unwrap();
        let destroy = plan.steps.iter().find(|s| s.address == addr("a")).unwrap();
        assert!(destroy.depends_on.contains(&update.id));
    }

    #[test]
    fn test_prevent_destroy_gates_orphan_but_not_detection() {
        let mut protected = record("a", "id-a", json!({"zone": "eu"}));
        protected.lifecycle.prevent_destroy = true;
        let state = snapshot(vec![protected]);

        let err = plan("resources: []", &state).unwrap_err();
        assert!(matches!(
            err,
            crate::error::ConvergeError::Plan(PlanError::PreventDestroy { ref address }) if address == "mem_thing.a"
        ));

        let unchanged = r"
resources:
  - type: mem_thing
    name: a
    lifecycle: {prevent_destroy: true}
    attributes: {zone: eu}
";
        assert_eq!(kind(&plan(unchanged, &state).unwrap(), "a"), ActionKind::NoOp);

        let replaced = unchanged.replace("zone: eu", "zone: us");
        assert!(plan(&replaced, &state).is_err());
    }

    #[test]
    fn test_destroy_mode_orders_dependents_first() {
        let registry = registry();
        let built = build(PAIR);
        let deps = [addr("a")].into_iter().collect();
        let state = snapshot(vec![
            record("a", "id-a", json!({"zone": "eu", "size": 1})),
            record("b", "id-b", json!({"parent": "id-a", "size": 1})).with_dependencies(deps),
        ]);

        let plan = DiffEngine::new(&registry)
            .plan(&built, &state, PlanMode::Destroy)
            .unwrap();
        assert_eq!(plan.summary().destroy, 2);
        let a = plan.steps.iter().find(|s| s.address == addr("a")).unwrap();
        let b = plan.steps.iter().find(|s| s.address == addr("b")).unwrap();
        assert!(a.depends_on.contains(&b.id));
        assert!(b.depends_on.is_empty());
    }

    #[test]
    fn test_deposed_objects_get_cleanup_steps() {
        let mut r = record("a", "id-new", json!({"zone": "eu", "size": 1}));
        r.deposed.push(crate::state::DeposedObject {
            external_id: String::from("id-old"),
            attributes: Attributes::new(),
            deposed_at: Utc::now(),
        });
        let yaml = r"
resources:
  - type: mem_thing
    name: a
    attributes: {zone: eu, size: 1}
";
        let plan = plan(yaml, &snapshot(vec![r])).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(
            plan.steps[0].operation,
            StepOperation::DestroyDeposed {
                external_id: String::from("id-old")
            }
        );
    }

    #[test]
    fn test_missing_provider() {
        let yaml = r"
resources:
  - {type: other_thing, name: x}
";
        assert!(matches!(
            plan(yaml, &snapshot(vec![])),
            Err(crate::error::ConvergeError::Plan(PlanError::MissingProvider { .. }))
        ));
    }

    #[test]
    fn test_value_changes_recurses_into_objects() {
        let mut out = Vec::new();
        value_changes(
            "tags",
            Some(&json!({"a": 1, "b": 2})),
            Some(&json!({"a": 1, "c": 3})),
            &mut out,
        );
        let paths: Vec<&str> = out.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["tags.b", "tags.c"]);
    }

    #[test]
    fn test_overlay_ignored_nested() {
        let lifecycle = Lifecycle {
            ignore_changes: [String::from("tags.team")].into_iter().collect(),
            ..Lifecycle::default()
        };
        let mut desired: Attributes =
            serde_json::from_value(json!({"tags": {"team": "new", "env": "prod"}})).unwrap();
        let prior: Attributes = serde_json::from_value(json!({"tags": {"team": "old"}})).unwrap();
        overlay_ignored(&mut desired, &prior, &lifecycle);
        assert_eq!(desired["tags"], json!({"team": "old", "env": "prod"}));
    }
}
