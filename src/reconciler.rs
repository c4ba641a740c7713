//! Reconciler for converging recorded state to the desired document.
//!
//! This module strings the components together: it builds the graph,
//! takes the state lock, refreshes recorded objects, plans, applies, and
//! releases the lock on every path. It also hosts drift checks and the
//! state-only administrative operations.

use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, Document};
use crate::error::{PlanError, Result};
use crate::graph::{BuiltGraph, GraphBuilder, ResourceAddress};
use crate::planner::{
    ActionKind, ApplyExecutor, ApplyReport, CancellationSignal, DiffEngine, DriftEntry, Plan,
    PlanMode, PlanSummary, refresh_snapshot,
};
use crate::provider::ProviderRegistry;
use crate::state::{LockInfo, StateSnapshot, StateStore, generate_holder_id};

/// Reconciler for one document, store and provider set.
pub struct Reconciler<'a> {
    /// Desired-state document.
    document: &'a Document,
    /// State store.
    store: &'a dyn StateStore,
    /// Providers.
    providers: &'a ProviderRegistry,
    /// Lock holder identity.
    holder: String,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Cancellation signal passed to the executor.
    cancellation: Option<CancellationSignal>,
}

/// A plan together with the drift found while computing it.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// The plan.
    pub plan: Plan,
    /// Drift found by the refresh, if one ran.
    pub drift: Vec<DriftEntry>,
}

/// Result of a reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// The plan that was computed.
    pub plan: Plan,
    /// Drift found by the refresh.
    pub drift: Vec<DriftEntry>,
    /// Apply report; `None` if the plan was not approved.
    pub report: Option<ApplyReport>,
}

/// A change that applying the configuration would make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingChange {
    /// Resource address.
    pub address: ResourceAddress,
    /// Planned action.
    pub action: ActionKind,
    /// Why.
    pub reason: String,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Records whose live object differs from the snapshot.
    pub drift: Vec<DriftEntry>,
    /// Changes needed to converge.
    pub pending: Vec<PendingChange>,
    /// Plan counts.
    pub summary: PlanSummary,
    /// Number of records in the snapshot.
    pub resource_count: usize,
}

impl ReconcileOutcome {
    /// Returns true if the run was approved and every step succeeded.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.report
            .as_ref()
            .is_some_and(ApplyReport::is_complete)
    }
}

impl DriftReport {
    /// Returns true if neither drift nor pending changes were found.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drift.is_empty() && self.pending.is_empty()
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(
        document: &'a Document,
        store: &'a dyn StateStore,
        providers: &'a ProviderRegistry,
    ) -> Self {
        Self {
            document,
            store,
            providers,
            holder: generate_holder_id(),
            hasher: ConfigHasher::new(),
            cancellation: None,
        }
    }

    /// Sets the lock holder identity.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Sets the cancellation signal used during apply.
    #[must_use]
    pub fn with_cancellation(mut self, signal: CancellationSignal) -> Self {
        self.cancellation = Some(signal);
        self
    }

    /// Validates the document and builds the instance graph.
    ///
    /// No provider is called.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on invalid documents, unknown
    /// references or dependency cycles.
    pub fn build(&self) -> Result<BuiltGraph> {
        ConfigValidator::new().validate(self.document)?;
        let built = GraphBuilder::new().build(self.document)?;
        debug!("Built graph with {} instances", built.len());
        Ok(built)
    }

    /// Computes a plan without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns configuration, refresh or planning errors.
    pub async fn plan(&self, mode: PlanMode, refresh: bool) -> Result<PlanOutcome> {
        let built = self.build()?;
        let snapshot = self.store.read_snapshot().await?;
        self.plan_against(&built, snapshot, mode, refresh)
            .await
            .map(|(plan, drift, _)| PlanOutcome { plan, drift })
    }

    /// Runs the whole pipeline and applies without asking.
    ///
    /// # Errors
    ///
    /// See [`reconcile_with`](Self::reconcile_with).
    pub async fn reconcile(&self, mode: PlanMode) -> Result<ReconcileOutcome> {
        self.reconcile_with(mode, |_| true).await
    }

    /// Runs build, lock, read, refresh, plan and apply, releasing the lock
    /// on every path. `approve` sees the plan before anything changes; the
    /// lock is held meanwhile.
    ///
    /// Provider failures during apply are reported in the outcome, not as
    /// `Err`.
    ///
    /// # Errors
    ///
    /// Returns configuration errors before any provider call, `LockHeld` if
    /// another run holds the lock, planning errors such as `PreventDestroy`,
    /// and state errors from persisting progress.
    pub async fn reconcile_with<F>(&self, mode: PlanMode, approve: F) -> Result<ReconcileOutcome>
    where
        F: FnOnce(&Plan) -> bool,
    {
        let built = self.build()?;
        info!(
            "Reconciling workspace {} ({} instances)",
            self.store.snapshot_id(),
            built.len()
        );

        let lock = self.acquire().await?;
        let result = self.reconcile_locked(&built, mode, approve, &lock).await;
        self.release(&lock).await;
        result
    }

    async fn reconcile_locked<F>(
        &self,
        built: &BuiltGraph,
        mode: PlanMode,
        approve: F,
        lock: &LockInfo,
    ) -> Result<ReconcileOutcome>
    where
        F: FnOnce(&Plan) -> bool,
    {
        let snapshot = self.store.read_snapshot().await?;
        let (plan, drift, refreshed) = self
            .plan_against(built, snapshot, mode, self.document.settings.refresh)
            .await?;

        if !approve(&plan) {
            info!("Plan {} was not approved", plan.id);
            return Ok(ReconcileOutcome {
                plan,
                drift,
                report: None,
            });
        }

        let report = self.executor().apply(&plan, refreshed, lock).await?;
        Ok(ReconcileOutcome {
            plan,
            drift,
            report: Some(report),
        })
    }

    /// Applies a previously computed plan.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld`, `StalePlan` if the snapshot moved on since the
    /// plan was computed, or state errors from persisting progress.
    pub async fn apply_plan(&self, plan: &Plan) -> Result<ApplyReport> {
        match self.build().and_then(|built| self.hasher.hash_serializable(&built)) {
            Ok(hash) if !ConfigHasher::hashes_match(&hash, &plan.config_hash) => warn!(
                "Configuration changed since plan {} was computed; applying the saved plan",
                plan.id
            ),
            Ok(_) => {}
            Err(e) => debug!("Cannot hash the current configuration: {e}"),
        }

        let lock = self.acquire().await?;
        let result = async {
            let snapshot = self.store.read_snapshot().await?;
            self.executor().apply(plan, snapshot, &lock).await
        }
        .await;
        self.release(&lock).await;
        result
    }

    /// Refreshes and plans without the lock, reporting drift and pending
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns configuration, refresh or planning errors.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let built = self.build()?;
        let snapshot = self.store.read_snapshot().await?;
        let resource_count = snapshot.len();
        let (plan, drift, _) = self
            .plan_against(&built, snapshot, PlanMode::Apply, true)
            .await?;

        let pending = plan
            .changes()
            .map(|action| PendingChange {
                address: action.address.clone(),
                action: action.kind,
                reason: action.reason.clone(),
            })
            .collect();

        Ok(DriftReport {
            drift,
            pending,
            summary: plan.summary(),
            resource_count,
        })
    }

    /// Moves a record to a new address without any provider call.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld`, `AddressNotFound` or `AddressOccupied`.
    pub async fn move_resource(
        &self,
        from: &ResourceAddress,
        to: &ResourceAddress,
    ) -> Result<StateSnapshot> {
        let lock = self.acquire().await?;
        let result = self.store.move_record(from, to, &lock).await;
        self.release(&lock).await;
        result
    }

    /// Forgets a record, leaving the external object untouched.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld` or `AddressNotFound`.
    pub async fn remove_resource(&self, address: &ResourceAddress) -> Result<StateSnapshot> {
        let lock = self.acquire().await?;
        let result = self.store.remove_record(address, &lock).await;
        self.release(&lock).await;
        result
    }

    /// Adopts an existing external object at `address`.
    ///
    /// The provider is the one the configuration assigns to `address`, or
    /// the type prefix when the address is not configured. The object's
    /// attributes are read live.
    ///
    /// # Errors
    ///
    /// Returns `MissingProvider`, the provider's read error, `LockHeld` or
    /// `AddressOccupied`.
    pub async fn import_resource(
        &self,
        address: &ResourceAddress,
        external_id: &str,
    ) -> Result<StateSnapshot> {
        let built = self.build()?;
        let provider_name = built.instance(address).map_or_else(
            || {
                address
                    .resource_type
                    .split('_')
                    .next()
                    .unwrap_or(&address.resource_type)
                    .to_string()
            },
            |instance| instance.provider.clone(),
        );
        let provider = self
            .providers
            .get(&provider_name)
            .ok_or_else(|| PlanError::MissingProvider {
                provider: provider_name.clone(),
                address: address.to_string(),
            })?;

        let live = provider.read(&address.resource_type, external_id).await?;

        let lock = self.acquire().await?;
        let result = self
            .store
            .import_record(address, &provider_name, &live.external_id, live.attributes, &lock)
            .await;
        self.release(&lock).await;
        result
    }

    /// Makes a stored version current again, as a new serial.
    ///
    /// Only state changes; objects are reconciled by the next run.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld`, or an error if the version does not exist.
    pub async fn rollback(&self, serial: u64) -> Result<StateSnapshot> {
        let lock = self.acquire().await?;
        let result = async {
            let version = self.store.read_version(serial).await?;
            let restored = self.store.force_write_snapshot(&version, &lock).await?;
            info!("Restored serial {serial} as serial {}", restored.serial);
            Ok(restored)
        }
        .await;
        self.release(&lock).await;
        result
    }

    /// Deletes all but the newest `keep` stored versions.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld` or a backend error.
    pub async fn prune_history(&self, keep: usize) -> Result<usize> {
        let lock = self.acquire().await?;
        let result = self.store.prune_versions(keep, &lock).await;
        self.release(&lock).await;
        result
    }

    async fn plan_against(
        &self,
        built: &BuiltGraph,
        snapshot: StateSnapshot,
        mode: PlanMode,
        refresh: bool,
    ) -> Result<(Plan, Vec<DriftEntry>, StateSnapshot)> {
        let (snapshot, drift) = if refresh && !snapshot.is_empty() {
            let settings = &self.document.settings;
            let outcome = refresh_snapshot(
                &snapshot,
                self.providers,
                settings.parallelism,
                settings.operation_timeout(),
            )
            .await?;
            (outcome.snapshot, outcome.drift)
        } else {
            (snapshot, Vec::new())
        };

        let config_hash = self.hasher.hash_serializable(built)?;
        let plan = DiffEngine::new(self.providers)
            .with_config_hash(config_hash)
            .plan(built, &snapshot, mode)?;
        Ok((plan, drift, snapshot))
    }

    fn executor(&self) -> ApplyExecutor<'_> {
        let settings = &self.document.settings;
        let executor = ApplyExecutor::new(self.store, self.providers)
            .with_parallelism(settings.parallelism)
            .with_operation_timeout(settings.operation_timeout());
        match &self.cancellation {
            Some(signal) => executor.with_cancellation(signal.clone()),
            None => executor,
        }
    }

    async fn acquire(&self) -> Result<LockInfo> {
        self.store
            .acquire_lock(&self.holder, self.document.settings.lock_ttl())
            .await
    }

    async fn release(&self, lock: &LockInfo) {
        if let Err(e) = self.store.release_lock(lock).await {
            warn!("Failed to release lock {}: {e}", lock.lock_id);
        }
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_converged() {
            return write!(
                f,
                "No drift detected - {} resources converged",
                self.resource_count
            );
        }
        if !self.drift.is_empty() {
            writeln!(f, "Drift detected:")?;
            for entry in &self.drift {
                writeln!(f, "  - {entry}")?;
            }
        }
        if !self.pending.is_empty() {
            writeln!(f, "Pending changes:")?;
            for change in &self.pending {
                writeln!(f, "  {} {} ({})", change.action.symbol(), change.address, change.reason)?;
            }
        }
        write!(f, "{}", self.summary)
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.plan.summary())?;
        match &self.report {
            None => write!(f, "Plan not applied."),
            Some(report) => {
                write!(f, "{}", report.counts())?;
                for (address, error) in report.errors() {
                    write!(f, "\n  - {address}: {error}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{ConfigError, ConvergeError, StateError};
    use crate::planner::StepOutcome;
    use crate::provider::{InMemoryProvider, ProviderOperation};
    use crate::state::MemoryStateStore;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        provider: Arc<InMemoryProvider>,
        registry: ProviderRegistry,
        store: MemoryStateStore,
    }

    fn fixture() -> Fixture {
        let provider =
            Arc::new(InMemoryProvider::new("mem").with_replace_paths("mem_thing", ["name"]));
        Fixture {
            registry: ProviderRegistry::new().with(provider.clone()),
            provider,
            store: MemoryStateStore::new("default"),
        }
    }

    fn doc(yaml: &str) -> Document {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    fn addr(name: &str) -> ResourceAddress {
        ResourceAddress::new("mem_thing", name)
    }

    async fn reconcile(f: &Fixture, yaml: &str) -> Result<ReconcileOutcome> {
        let document = doc(yaml);
        Reconciler::new(&document, &f.store, &f.registry)
            .reconcile(PlanMode::Apply)
            .await
    }

    async fn plan(f: &Fixture, yaml: &str) -> Plan {
        let document = doc(yaml);
        Reconciler::new(&document, &f.store, &f.registry)
            .plan(PlanMode::Apply, true)
            .await
            .unwrap()
            .plan
    }

    const STACK: &str = r#"
resources:
  - type: mem_thing
    name: net
    attributes: {cidr: 10.0.0.0/16}
  - type: mem_thing
    name: app
    count: 2
    attributes:
      net: "${mem_thing.net.id}"
      name: "app-${count.index}"
outputs:
  app_ids: "${mem_thing.app[*].id}"
"#;

    #[tokio::test]
    async fn test_apply_then_replan_is_all_no_op() {
        let f = fixture();
        let outcome = reconcile(&f, STACK).await.unwrap();
        assert!(outcome.is_converged());
        assert_eq!(f.provider.object_count(), 3);

        let snapshot = f.store.read_snapshot().await.unwrap();
        assert_eq!(snapshot.outputs["app_ids"].as_array().unwrap().len(), 2);

        let replan = plan(&f, STACK).await;
        assert!(!replan.has_changes());
        assert_eq!(replan.summary().no_op, 3);

        f.provider.clear_calls();
        let again = reconcile(&f, STACK).await.unwrap();
        assert!(again.is_converged());
        assert_eq!(f.provider.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_removing_first_ordinal_shifts_identities() {
        let f = fixture();
        let before = r#"
variables:
  names: [x, y, z]
resources:
  - type: mem_thing
    name: n
    count: 3
    attributes: {name: "${var.names[count.index]}"}
"#;
        reconcile(&f, before).await.unwrap();

        let after = before.replace("[x, y, z]", "[y, z]").replace("count: 3", "count: 2");
        let plan = plan(&f, &after).await;
        let n = |i| addr("n").with_index(i);
        assert_eq!(plan.action(&n(0)).unwrap().kind, ActionKind::Replace);
        assert_eq!(plan.action(&n(1)).unwrap().kind, ActionKind::Replace);
        assert_eq!(plan.action(&n(2)).unwrap().kind, ActionKind::Destroy);
    }

    #[tokio::test]
    async fn test_removing_key_affects_only_that_key() {
        let f = fixture();
        let before = r#"
resources:
  - type: mem_thing
    name: n
    for_each: [x, y, z]
    attributes: {name: "${each.key}"}
"#;
        reconcile(&f, before).await.unwrap();

        let plan = plan(&f, &before.replace("[x, y, z]", "[y, z]")).await;
        let n = |k: &str| addr("n").with_key(k);
        assert_eq!(plan.action(&n("x")).unwrap().kind, ActionKind::Destroy);
        assert_eq!(plan.action(&n("y")).unwrap().kind, ActionKind::NoOp);
        assert_eq!(plan.action(&n("z")).unwrap().kind, ActionKind::NoOp);
        assert_eq!(plan.summary().change_count(), 1);
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_provider_call() {
        let f = fixture();
        let cyclic = r#"
resources:
  - type: mem_thing
    name: x
    attributes: {peer: "${mem_thing.y.id}"}
  - type: mem_thing
    name: y
    attributes: {peer: "${mem_thing.x.id}"}
"#;
        let err = reconcile(&f, cyclic).await.unwrap_err();
        let ConvergeError::Config(ConfigError::CircularDependency { addresses }) = err else {
            panic!("expected a cycle error, got {err}");
        };
        assert!(addresses.iter().any(|a| a == "mem_thing.x"));
        assert!(addresses.iter().any(|a| a == "mem_thing.y"));
        assert!(f.provider.calls().is_empty());
        assert!(f.store.current_lock().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let f = fixture();
        let (first, second) = tokio::join!(
            f.store.acquire_lock("one", None),
            f.store.acquire_lock("two", None)
        );
        assert_eq!(usize::from(first.is_ok()) + usize::from(second.is_ok()), 1);
        let held = first.or(second).unwrap();

        let err = reconcile(&f, STACK).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::LockHeld { .. })));
        assert!(err.is_retryable());
        assert_eq!(f.provider.mutation_count(), 0);

        f.store.release_lock(&held).await.unwrap();
        assert!(reconcile(&f, STACK).await.unwrap().is_converged());
    }

    #[tokio::test]
    async fn test_failure_is_contained_and_rerun_converges() {
        let f = fixture();
        let yaml = r#"
resources:
  - type: mem_thing
    name: a
    attributes: {role: a}
  - type: mem_thing
    name: b
    attributes: {role: b}
  - type: mem_thing
    name: c
    attributes: {role: c, parent: "${mem_thing.b.id}"}
"#;
        f.provider
            .fail_when(ProviderOperation::Create, "mem_thing", "role", json!("b"), "boom");

        let outcome = reconcile(&f, yaml).await.unwrap();
        assert!(!outcome.is_converged());
        let report = outcome.report.unwrap();
        assert_eq!(report.outcome(&addr("a"), "create"), Some(&StepOutcome::Succeeded));
        assert!(matches!(
            report.outcome(&addr("b"), "create"),
            Some(StepOutcome::Failed { .. })
        ));
        assert!(matches!(
            report.outcome(&addr("c"), "create"),
            Some(StepOutcome::Skipped { .. })
        ));

        let stored = f.store.read_snapshot().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored.contains(&addr("a")));

        f.provider.clear_failures();
        let rerun = reconcile(&f, yaml).await.unwrap();
        assert!(rerun.is_converged());
        assert_eq!(rerun.plan.summary().create, 2);
        assert_eq!(rerun.plan.summary().no_op, 1);
    }

    #[tokio::test]
    async fn test_prevent_destroy_blocks_the_plan() {
        let f = fixture();
        let protected = r"
resources:
  - type: mem_thing
    name: db
    lifecycle: {prevent_destroy: true}
    attributes: {size: 1}
";
        reconcile(&f, protected).await.unwrap();
        let serial = f.store.read_snapshot().await.unwrap().serial;
        f.provider.clear_calls();

        let err = reconcile(&f, "resources: []").await.unwrap_err();
        assert!(matches!(err, ConvergeError::Plan(PlanError::PreventDestroy { .. })));
        assert_eq!(f.provider.mutation_count(), 0);
        assert_eq!(f.store.read_snapshot().await.unwrap().serial, serial);
        assert!(f.store.current_lock().await.unwrap().is_none());

        let document = doc(protected);
        let destroy = Reconciler::new(&document, &f.store, &f.registry)
            .reconcile(PlanMode::Destroy)
            .await;
        assert!(destroy.is_err());
    }

    #[tokio::test]
    async fn test_move_preserves_identity() {
        let f = fixture();
        let old = r"
resources:
  - type: mem_thing
    name: old
    attributes: {size: 1}
";
        reconcile(&f, old).await.unwrap();
        let id = f.store.read_snapshot().await.unwrap().get(&addr("old")).unwrap().external_id.clone();

        let renamed = old.replace("name: old", "name: new");
        let document = doc(&renamed);
        Reconciler::new(&document, &f.store, &f.registry)
            .move_resource(&addr("old"), &addr("new"))
            .await
            .unwrap();

        f.provider.clear_calls();
        let outcome = reconcile(&f, &renamed).await.unwrap();
        assert!(!outcome.plan.has_changes());
        assert_eq!(f.provider.mutation_count(), 0);
        let snapshot = f.store.read_snapshot().await.unwrap();
        assert_eq!(snapshot.get(&addr("new")).unwrap().external_id, id);
    }

    #[tokio::test]
    async fn test_drift_is_detected_and_repaired() {
        let f = fixture();
        let yaml = r"
resources:
  - type: mem_thing
    name: a
    attributes: {size: 1}
  - type: mem_thing
    name: b
    attributes: {size: 2}
";
        reconcile(&f, yaml).await.unwrap();
        let snapshot = f.store.read_snapshot().await.unwrap();
        f.provider
            .set_external(&snapshot.get(&addr("a")).unwrap().external_id, "size", json!(9));
        f.provider
            .delete_external(&snapshot.get(&addr("b")).unwrap().external_id);

        let document = doc(yaml);
        let reconciler = Reconciler::new(&document, &f.store, &f.registry);
        let report = reconciler.check_drift().await.unwrap();
        assert!(!report.is_converged());
        assert_eq!(report.drift.len(), 2);
        assert_eq!(report.summary.update, 1);
        assert_eq!(report.summary.create, 1);

        let outcome = reconciler.reconcile(PlanMode::Apply).await.unwrap();
        assert!(outcome.is_converged());
        assert!(reconciler.check_drift().await.unwrap().is_converged());
    }

    #[tokio::test]
    async fn test_import_adopts_existing_object() {
        let f = fixture();
        let yaml = r"
resources:
  - type: mem_thing
    name: a
    attributes: {size: 1}
";
        let attributes = serde_json::from_value(json!({"size": 1})).unwrap();
        let id = f.provider.insert_external("mem_thing", attributes);

        let document = doc(yaml);
        let reconciler = Reconciler::new(&document, &f.store, &f.registry);
        let snapshot = reconciler.import_resource(&addr("a"), &id).await.unwrap();
        assert_eq!(snapshot.get(&addr("a")).unwrap().external_id, id);

        let err = reconciler.import_resource(&addr("a"), &id).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::AddressOccupied { .. })));

        let outcome = reconciler.reconcile(PlanMode::Apply).await.unwrap();
        assert!(!outcome.plan.has_changes());
    }

    #[tokio::test]
    async fn test_rollback_and_prune_history() {
        let f = fixture();
        reconcile(&f, STACK).await.unwrap();
        let before = f.store.read_snapshot().await.unwrap();

        let document = doc(STACK);
        let reconciler = Reconciler::new(&document, &f.store, &f.registry);
        let app0 = addr("app").with_index(0);
        reconciler.remove_resource(&app0).await.unwrap();

        let restored = reconciler.rollback(before.serial).await.unwrap();
        assert!(restored.serial > before.serial + 1);
        assert!(restored.contains(&app0));
        assert_eq!(restored.resources, before.resources);

        assert!(reconciler.rollback(999).await.is_err());
        assert!(f.store.current_lock().await.unwrap().is_none());

        let removed = reconciler.prune_history(1).await.unwrap();
        assert!(removed > 0);
        assert_eq!(f.store.list_versions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_saved_plan_applies_and_goes_stale() {
        let f = fixture();
        let document = doc(STACK);
        let reconciler = Reconciler::new(&document, &f.store, &f.registry);
        let saved = reconciler.plan(PlanMode::Apply, false).await.unwrap().plan;

        let report = reconciler.apply_plan(&saved).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(f.provider.object_count(), 3);
        let persisted = f.store.read_snapshot().await.unwrap();
        assert_eq!(persisted.lineage, saved.lineage);

        let err = reconciler.apply_plan(&saved).await.unwrap_err();
        assert!(matches!(err, ConvergeError::Plan(PlanError::StalePlan { .. })));
        assert!(f.store.current_lock().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_backends_end_to_end() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = crate::state::LocalStateStore::with_base_dir(temp.path().join("state"), "dev");
        let provider = crate::provider::LocalProvider::new(temp.path().join("objects"))
            .with_immutable("local_file", ["path"]);
        let registry = ProviderRegistry::new().with(Arc::new(provider));
        let objects = temp.path().join("objects").join("local_file");
        let yaml = r"
resources:
  - type: local_file
    name: cfg
    attributes: {path: a.txt, content: hi}
";

        let document = doc(yaml);
        let first = Reconciler::new(&document, &store, &registry)
            .reconcile(PlanMode::Apply)
            .await
            .unwrap();
        assert!(first.is_converged());
        let old_id = store.read_snapshot().await.unwrap().get(&ResourceAddress::new("local_file", "cfg")).unwrap().external_id.clone();

        let moved = doc(&yaml.replace("a.txt", "b.txt"));
        let reconciler = Reconciler::new(&moved, &store, &registry);
        let second = reconciler.reconcile(PlanMode::Apply).await.unwrap();
        assert_eq!(second.plan.summary().replace, 1);
        assert!(second.is_converged());

        let snapshot = store.read_snapshot().await.unwrap();
        let record = snapshot.get(&ResourceAddress::new("local_file", "cfg")).unwrap();
        assert_ne!(record.external_id, old_id);
        assert_eq!(record.attributes["path"], json!("b.txt"));
        assert_eq!(std::fs::read_dir(&objects).unwrap().count(), 1);
        assert!(reconciler.check_drift().await.unwrap().is_converged());
    }

    #[tokio::test]
    async fn test_unapproved_plan_changes_nothing() {
        let f = fixture();
        let document = doc(STACK);
        let outcome = Reconciler::new(&document, &f.store, &f.registry)
            .reconcile_with(PlanMode::Apply, |plan| {
                assert_eq!(plan.summary().create, 3);
                false
            })
            .await
            .unwrap();

        assert!(outcome.report.is_none());
        assert_eq!(f.provider.object_count(), 0);
        assert!(f.store.current_lock().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destroy_mode_empties_state() {
        let f = fixture();
        reconcile(&f, STACK).await.unwrap();

        let document = doc(STACK);
        let outcome = Reconciler::new(&document, &f.store, &f.registry)
            .reconcile(PlanMode::Destroy)
            .await
            .unwrap();
        assert!(outcome.is_converged());
        assert_eq!(f.provider.object_count(), 0);
        assert!(f.store.read_snapshot().await.unwrap().is_empty());
    }
}
