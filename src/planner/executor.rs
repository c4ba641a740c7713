//! Apply executor.
//!
//! Runs the steps of a plan against the providers, as concurrently as the
//! step graph and the parallelism bound allow. Every completed provider call
//! is written to the state store before the next step is scheduled, so a run
//! that dies half-way leaves a snapshot that matches reality.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{ConvergeError, PlanError, ProviderError, ProviderResult, Result};
use crate::expr::{Attributes, ResolutionContext};
use crate::graph::{ResourceAddress, ResourceInstance};
use crate::provider::{Provider, ProviderOutput, ProviderRegistry};
use crate::state::{LockInfo, ResourceRecord, StateSnapshot, StateStore};

use super::diff::overlay_ignored;
use super::plan::{ActionKind, Plan, PlanMode, PlanStep, StepOperation};

/// Default number of provider calls in flight.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Default timeout of one provider call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Requests cancellation of a running apply.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    sender: Arc<watch::Sender<bool>>,
}

/// Observed by the executor; once cancelled, no new step is started.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    receiver: watch::Receiver<bool>,
}

/// Creates a connected cancellation handle and signal.
#[must_use]
pub fn cancellation() -> (CancellationHandle, CancellationSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        CancellationHandle {
            sender: Arc::new(sender),
        },
        CancellationSignal { receiver },
    )
}

impl CancellationHandle {
    /// Cancels the run.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl CancellationSignal {
    /// Returns true if cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested; never resolves if every
    /// handle is dropped first.
    pub async fn cancelled(&mut self) {
        if self.receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StepOutcome {
    /// The provider call succeeded and was recorded.
    Succeeded,
    /// The provider call failed.
    Failed {
        /// Error message.
        error: String,
    },
    /// The step never ran.
    Skipped {
        /// Why it was skipped.
        reason: String,
    },
    /// Nothing to do for the address.
    NoOp,
}

/// Report line for one step or unchanged address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Resource address.
    pub address: ResourceAddress,
    /// Operation name (`create`, `update`, `destroy`, `no-op`).
    pub operation: String,
    /// External id involved, when known.
    pub external_id: Option<String>,
    /// Outcome.
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCounts {
    /// Steps that succeeded.
    pub succeeded: usize,
    /// Steps that failed.
    pub failed: usize,
    /// Steps that were skipped.
    pub skipped: usize,
    /// Unchanged addresses.
    pub no_op: usize,
}

/// Result of applying a plan.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// One entry per step, then one per unchanged address.
    pub steps: Vec<StepReport>,
    /// Snapshot as last persisted.
    pub snapshot: StateSnapshot,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl ApplyReport {
    /// Returns the outcome counts.
    #[must_use]
    pub fn counts(&self) -> ApplyCounts {
        let mut counts = ApplyCounts::default();
        for step in &self.steps {
            match step.outcome {
                StepOutcome::Succeeded => counts.succeeded += 1,
                StepOutcome::Failed { .. } => counts.failed += 1,
                StepOutcome::Skipped { .. } => counts.skipped += 1,
                StepOutcome::NoOp => counts.no_op += 1,
            }
        }
        counts
    }

    /// Returns the failed steps with their error messages.
    #[must_use]
    pub fn errors(&self) -> Vec<(&ResourceAddress, &str)> {
        self.steps
            .iter()
            .filter_map(|step| match &step.outcome {
                StepOutcome::Failed { error } => Some((&step.address, error.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Returns the report line of `address` for `operation`.
    #[must_use]
    pub fn outcome(&self, address: &ResourceAddress, operation: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|s| &s.address == address && s.operation == operation)
            .map(|s| &s.outcome)
    }

    /// Returns true if every step succeeded and the run was not cancelled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.cancelled
            && self
                .steps
                .iter()
                .all(|s| matches!(s.outcome, StepOutcome::Succeeded | StepOutcome::NoOp))
    }
}

impl fmt::Display for ApplyCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Apply: {} succeeded, {} failed, {} skipped, {} unchanged.",
            self.succeeded, self.failed, self.skipped, self.no_op
        )
    }
}

/// Executor for plans.
pub struct ApplyExecutor<'a> {
    store: &'a dyn StateStore,
    providers: &'a ProviderRegistry,
    parallelism: usize,
    operation_timeout: Duration,
    cancellation: Option<CancellationSignal>,
}

impl fmt::Debug for ApplyExecutor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyExecutor")
            .field("backend", &self.store.backend_type())
            .field("providers", &self.providers)
            .field("parallelism", &self.parallelism)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

/// A provider call ready to run on its own task.
struct StepCall {
    step: usize,
    provider: Arc<dyn Provider>,
    resource_type: String,
    operation: StepOperation,
    attributes: Attributes,
    timeout: Duration,
}

impl StepCall {
    async fn run(self) -> (usize, ProviderResult<Option<ProviderOutput>>) {
        let name = self.operation.name();
        let provider = self.provider;
        let resource_type = self.resource_type;
        let attributes = self.attributes;
        let call = async {
            match &self.operation {
                StepOperation::Create => provider.create(&resource_type, &attributes).await.map(Some),
                StepOperation::Update { external_id } => provider
                    .update(&resource_type, external_id, &attributes)
                    .await
                    .map(Some),
                StepOperation::Destroy { external_id }
                | StepOperation::DestroyDeposed { external_id } => {
                    match provider.destroy(&resource_type, external_id).await {
                        Err(e) if e.is_not_found() => {
                            debug!("{external_id} was already gone");
                            Ok(None)
                        }
                        other => other.map(|()| None),
                    }
                }
            }
        };

        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(name, self.timeout)),
        };
        (self.step, result)
    }
}

/// Mutable bookkeeping of one run.
struct Run<'p> {
    plan: &'p Plan,
    snapshot: StateSnapshot,
    context: ResolutionContext,
    outcomes: Vec<Option<StepOutcome>>,
    external_ids: Vec<Option<String>>,
    pending_deps: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: VecDeque<usize>,
}

impl<'p> Run<'p> {
    fn new(plan: &'p Plan, snapshot: StateSnapshot) -> Self {
        let mut context = ResolutionContext::new();
        for record in snapshot.resources.values() {
            context.insert_known(
                record.address.clone(),
                record.external_id.clone(),
                record.attributes.clone(),
            );
        }

        let pending_deps: Vec<usize> = plan.steps.iter().map(|s| s.depends_on.len()).collect();
        let ready = pending_deps
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| id)
            .collect();

        Self {
            plan,
            snapshot,
            context,
            outcomes: vec![None; plan.steps.len()],
            external_ids: plan
                .steps
                .iter()
                .map(|s| match &s.operation {
                    StepOperation::Create => None,
                    StepOperation::Update { external_id }
                    | StepOperation::Destroy { external_id }
                    | StepOperation::DestroyDeposed { external_id } => Some(external_id.clone()),
                })
                .collect(),
            pending_deps,
            dependents: plan.step_dependents(),
            ready,
        }
    }

    fn step(&self, id: usize) -> &'p PlanStep {
        &self.plan.steps[id]
    }

    fn instance(&self, id: usize) -> Option<&'p ResourceInstance> {
        self.plan.graph.instance(&self.plan.steps[id].address)
    }

    fn succeed(&mut self, id: usize) {
        self.outcomes[id] = Some(StepOutcome::Succeeded);
        for dependent in self.dependents[id].clone() {
            self.pending_deps[dependent] -= 1;
            if self.pending_deps[dependent] == 0 && self.outcomes[dependent].is_none() {
                self.ready.push_back(dependent);
            }
        }
    }

    /// Marks a step failed and skips everything downstream of it.
    fn fail(&mut self, id: usize, error: String) {
        error!("{} failed: {error}", self.step(id));
        self.outcomes[id] = Some(StepOutcome::Failed { error });

        let mut queue: VecDeque<usize> = self.dependents[id].iter().copied().collect();
        let mut seen = BTreeSet::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) || self.outcomes[next].is_some() {
                continue;
            }
            let reason = format!("dependency {} failed", self.step(id));
            warn!("Skipping {}: {reason}", self.step(next));
            self.outcomes[next] = Some(StepOutcome::Skipped { reason });
            queue.extend(self.dependents[next].iter().copied());
        }
    }

    /// Applies a successful provider result to the snapshot and context.
    fn record(&mut self, id: usize, output: Option<ProviderOutput>) {
        let step = self.step(id);
        let address = &step.address;
        match (&step.operation, output) {
            (StepOperation::Create | StepOperation::Update { .. }, Some(output)) => {
                self.external_ids[id] = Some(output.external_id.clone());
                let (dependencies, lifecycle) = self
                    .instance(id)
                    .map(|i| (i.dependencies(), i.lifecycle.clone()))
                    .unwrap_or_default();

                let mut record = ResourceRecord::new(
                    address.clone(),
                    step.provider.clone(),
                    output.external_id.clone(),
                    output.attributes.clone(),
                )
                .with_dependencies(dependencies)
                .with_lifecycle(lifecycle);

                if let Some(mut previous) = self.snapshot.remove(address) {
                    if step.operation == StepOperation::Create {
                        previous.depose();
                    } else {
                        record.created_at = previous.created_at;
                    }
                    record.deposed = previous.deposed;
                }
                self.snapshot.set(record);
                self.context
                    .insert_known(address.clone(), output.external_id, output.attributes);
            }
            (
                StepOperation::Destroy { external_id }
                | StepOperation::DestroyDeposed { external_id },
                _,
            ) => {
                self.snapshot.forget_object(address, external_id);
                match self.snapshot.get(address) {
                    Some(record) => self.context.insert_known(
                        address.clone(),
                        record.external_id.clone(),
                        record.attributes.clone(),
                    ),
                    None => self.context.remove(address),
                }
            }
            (operation, None) => {
                warn!("{operation} on {address} returned no object");
            }
        }
    }

    /// Finishes bookkeeping once no more steps will run.
    fn finish(&mut self, cancelled: bool) {
        for id in 0..self.outcomes.len() {
            if self.outcomes[id].is_none() {
                let reason = if cancelled {
                    String::from("run cancelled")
                } else {
                    String::from("dependency did not complete")
                };
                self.outcomes[id] = Some(StepOutcome::Skipped { reason });
            }
        }
    }

    /// Syncs recorded lifecycle and dependencies of unchanged instances and
    /// evaluates outputs. Returns true if the snapshot changed.
    fn finalize_snapshot(&mut self) -> bool {
        let mut changed = false;

        for (address, instance) in &self.plan.graph.instances {
            if let Some(record) = self.snapshot.get_mut(address) {
                let dependencies = instance.dependencies();
                if record.dependencies != dependencies || record.lifecycle != instance.lifecycle {
                    record.dependencies = dependencies;
                    record.lifecycle = instance.lifecycle.clone();
                    changed = true;
                }
            }
        }

        let outputs = match self.plan.mode {
            PlanMode::Destroy => BTreeMap::new(),
            PlanMode::Apply => {
                let mut outputs = BTreeMap::new();
                for (name, expr) in &self.plan.graph.outputs {
                    match self.context.evaluate(expr).known() {
                        Some(value) => {
                            outputs.insert(name.clone(), value.clone());
                        }
                        None => {
                            debug!("Output {name} is not known; keeping the previous value");
                            if let Some(previous) = self.snapshot.outputs.get(name) {
                                outputs.insert(name.clone(), previous.clone());
                            }
                        }
                    }
                }
                outputs
            }
        };
        if outputs != self.snapshot.outputs {
            self.snapshot.outputs = outputs;
            changed = true;
        }
        changed
    }

    fn report(self, cancelled: bool) -> ApplyReport {
        let mut steps: Vec<StepReport> = self
            .plan
            .steps
            .iter()
            .zip(self.outcomes)
            .zip(self.external_ids)
            .map(|((step, outcome), external_id)| StepReport {
                address: step.address.clone(),
                operation: step.operation.name().to_string(),
                external_id,
                outcome: outcome.unwrap_or(StepOutcome::Skipped {
                    reason: String::from("not scheduled"),
                }),
            })
            .collect();

        steps.extend(
            self.plan
                .actions
                .iter()
                .filter(|a| a.kind == ActionKind::NoOp)
                .map(|a| StepReport {
                    address: a.address.clone(),
                    operation: String::from("no-op"),
                    external_id: a.prior_external_id.clone(),
                    outcome: StepOutcome::NoOp,
                }),
        );

        ApplyReport {
            steps,
            snapshot: self.snapshot,
            cancelled,
        }
    }
}

impl<'a> ApplyExecutor<'a> {
    /// Creates an executor that persists progress to `store`.
    #[must_use]
    pub fn new(store: &'a dyn StateStore, providers: &'a ProviderRegistry) -> Self {
        Self {
            store,
            providers,
            parallelism: DEFAULT_PARALLELISM,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            cancellation: None,
        }
    }

    /// Sets the maximum number of provider calls in flight.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the timeout of one provider call.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets the cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, signal: CancellationSignal) -> Self {
        self.cancellation = Some(signal);
        self
    }

    /// Applies `plan` to `snapshot`, holding `lock`.
    ///
    /// Provider failures do not return `Err`: the failed step is reported,
    /// its dependents are skipped and independent steps still run.
    ///
    /// # Errors
    ///
    /// Returns `StalePlan` if `snapshot` is not the version the plan was
    /// computed against, or the state error if persisting progress fails.
    /// In the latter case in-flight calls are awaited and one last write of
    /// their results is attempted before returning.
    pub async fn apply(
        &self,
        plan: &Plan,
        mut snapshot: StateSnapshot,
        lock: &LockInfo,
    ) -> Result<ApplyReport> {
        plan.ensure_current(&snapshot)?;
        plan.adopt_lineage(&mut snapshot);
        info!(
            "Applying plan {} ({} steps, parallelism {})",
            plan.id,
            plan.steps.len(),
            self.parallelism
        );

        let mut run = Run::new(plan, snapshot);
        let mut tasks: JoinSet<(usize, ProviderResult<Option<ProviderOutput>>)> = JoinSet::new();
        let mut signal = self.cancellation.clone();
        let mut cancelled = signal.as_ref().is_some_and(CancellationSignal::is_cancelled);
        let mut persist_error: Option<ConvergeError> = None;

        loop {
            while !cancelled && persist_error.is_none() && tasks.len() < self.parallelism {
                let Some(id) = run.ready.pop_front() else {
                    break;
                };
                match self.prepare(&run, id) {
                    Ok(call) => {
                        info!("Starting {}", run.step(id));
                        tasks.spawn(call.run());
                    }
                    Err(e) => run.fail(id, e.to_string()),
                }
            }

            if tasks.is_empty() {
                break;
            }

            let joined = match signal.as_mut() {
                Some(signal) if !cancelled => {
                    tokio::select! {
                        joined = tasks.join_next() => joined,
                        () = signal.cancelled() => {
                            warn!("Cancellation requested; waiting for in-flight steps");
                            cancelled = true;
                            continue;
                        }
                    }
                }
                _ => tasks.join_next().await,
            };
            let Some(joined) = joined else {
                break;
            };
            let (id, result) = joined.map_err(|e| ConvergeError::internal(format!("apply task failed: {e}")))?;

            match result {
                Ok(output) => {
                    info!("Completed {}", run.step(id));
                    run.record(id, output);
                    if persist_error.is_none() {
                        match self.store.write_snapshot(&run.snapshot, lock).await {
                            Ok(written) => {
                                run.snapshot = written;
                                run.succeed(id);
                            }
                            Err(e) => {
                                error!("Failed to persist state after {}: {e}", run.step(id));
                                run.outcomes[id] = Some(StepOutcome::Succeeded);
                                persist_error = Some(e);
                            }
                        }
                    } else {
                        run.outcomes[id] = Some(StepOutcome::Succeeded);
                    }
                }
                Err(e) => run.fail(id, e.to_string()),
            }
        }

        if let Some(e) = persist_error {
            if let Err(retry) = self.store.write_snapshot(&run.snapshot, lock).await {
                error!("Final state write failed as well: {retry}");
            }
            return Err(e);
        }

        run.finish(cancelled);
        if run.finalize_snapshot() {
            run.snapshot = self.store.write_snapshot(&run.snapshot, lock).await?;
        }

        let report = run.report(cancelled);
        info!("{}", report.counts());
        Ok(report)
    }

    /// Resolves a step's provider and attributes.
    fn prepare(&self, run: &Run<'_>, id: usize) -> Result<StepCall> {
        let step = run.step(id);
        let provider = self.providers.get(&step.provider).ok_or_else(|| {
            ConvergeError::Plan(PlanError::MissingProvider {
                provider: step.provider.clone(),
                address: step.address.to_string(),
            })
        })?;

        let attributes = if step.operation.is_forward() {
            let instance = run.instance(id).ok_or_else(|| {
                ConvergeError::internal(format!("{} is not in the planned graph", step.address))
            })?;
            let (mut attributes, unknown) = run.context.evaluate_attributes(&instance.attributes);
            if !unknown.is_empty() {
                let keys: Vec<&str> = unknown.iter().map(String::as_str).collect();
                return Err(ConvergeError::internal(format!(
                    "values of {} are still unknown at apply time",
                    keys.join(", ")
                )));
            }
            if let (StepOperation::Update { .. }, Some(record)) =
                (&step.operation, run.snapshot.get(&step.address))
            {
                overlay_ignored(&mut attributes, &record.attributes, &instance.lifecycle);
            }
            attributes
        } else {
            Attributes::new()
        };

        Ok(StepCall {
            step: id,
            provider,
            resource_type: step.address.resource_type.clone(),
            operation: step.operation.clone(),
            attributes,
            timeout: self.operation_timeout,
        })
    }
}
