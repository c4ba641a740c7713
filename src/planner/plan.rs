//! Plan types.
//!
//! A plan is an immutable artifact: the per-resource actions, the executable
//! steps they split into, and the graph the steps were derived from. It
//! records the snapshot version it was computed against so a stale plan is
//! never applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{ConfigError, ConvergeError, PlanError, Result};
use crate::expr::Resolved;
use crate::graph::{BuiltGraph, ResourceAddress};
use crate::state::StateSnapshot;

/// What a plan converges towards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// Converge to the desired state.
    #[default]
    Apply,
    /// Destroy every recorded resource.
    Destroy,
}

/// Action required for one resource address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Create a new object.
    Create,
    /// Update the existing object in place.
    Update,
    /// Replace the object (destroy and create, in lifecycle order).
    Replace,
    /// Destroy the object.
    Destroy,
    /// Destroy an old object left behind by a create-before-destroy replace.
    DestroyDeposed,
    /// Nothing to do.
    NoOp,
}

/// One changed attribute path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Dotted attribute path.
    pub path: String,
    /// Recorded value, absent for new attributes.
    pub before: Option<Value>,
    /// Desired value.
    pub after: Resolved,
    /// Whether this change forces replacement.
    pub requires_replace: bool,
}

/// The action planned for one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    /// Resource address.
    pub address: ResourceAddress,
    /// Action kind.
    pub kind: ActionKind,
    /// Provider that performs the action.
    pub provider: String,
    /// Attribute changes.
    #[serde(default)]
    pub changes: Vec<AttributeChange>,
    /// External id of the current object, if any.
    pub prior_external_id: Option<String>,
    /// Whether a replace creates the new object first.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Human-readable reason.
    pub reason: String,
}

/// Provider operation performed by one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum StepOperation {
    /// Create a new object from the desired attributes.
    Create,
    /// Update an object in place.
    Update {
        /// Object to update.
        external_id: String,
    },
    /// Destroy the object recorded at the address.
    Destroy {
        /// Object to destroy.
        external_id: String,
    },
    /// Destroy a deposed object recorded at the address.
    DestroyDeposed {
        /// Object to destroy.
        external_id: String,
    },
}

/// One executable unit of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Index of the step within the plan.
    pub id: usize,
    /// Resource address.
    pub address: ResourceAddress,
    /// Provider name.
    pub provider: String,
    /// Operation.
    pub operation: StepOperation,
    /// Steps that must succeed first.
    #[serde(default)]
    pub depends_on: BTreeSet<usize>,
}

/// Counts of planned actions by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources and deposed objects to destroy.
    pub destroy: usize,
    /// Resources left unchanged.
    pub no_op: usize,
}

/// A complete plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan id.
    pub id: String,
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Plan mode.
    pub mode: PlanMode,
    /// Workspace the plan targets.
    pub workspace: String,
    /// Lineage of the snapshot the plan was computed against.
    pub lineage: String,
    /// Serial of the snapshot the plan was computed against.
    pub serial: u64,
    /// Digest of the desired-state document.
    pub config_hash: String,
    /// One action per address, in creation order followed by destroys.
    pub actions: Vec<PlannedAction>,
    /// Executable steps.
    pub steps: Vec<PlanStep>,
    /// Graph and bound instances the plan was computed from.
    pub graph: BuiltGraph,
}

impl ActionKind {
    /// Short marker used in plan listings.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Destroy | Self::DestroyDeposed => "-",
            Self::NoOp => " ",
        }
    }

    /// Returns true for every kind except `NoOp`.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::DestroyDeposed => "destroy deposed",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for StepOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update { external_id } => write!(f, "update {external_id}"),
            Self::Destroy { external_id } => write!(f, "destroy {external_id}"),
            Self::DestroyDeposed { external_id } => write!(f, "destroy deposed {external_id}"),
        }
    }
}

impl StepOperation {
    /// Returns true for create and update steps.
    #[must_use]
    pub const fn is_forward(&self) -> bool {
        matches!(self, Self::Create | Self::Update { .. })
    }

    /// Returns the operation name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update { .. } => "update",
            Self::Destroy { .. } | Self::DestroyDeposed { .. } => "destroy",
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {}", self.id, self.operation, self.address)
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.address, self.reason)
    }
}

impl PlanSummary {
    /// Returns the number of actions that change something.
    #[must_use]
    pub const fn change_count(&self) -> usize {
        self.create + self.update + self.replace + self.destroy
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.change_count() == 0 {
            return write!(f, "No changes. {} resources up to date.", self.no_op);
        }
        write!(
            f,
            "Plan: {} to create, {} to update, {} to replace, {} to destroy, {} unchanged.",
            self.create, self.update, self.replace, self.destroy, self.no_op
        )
    }
}

impl Plan {
    /// Returns the action counts.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action.kind {
                ActionKind::Create => summary.create += 1,
                ActionKind::Update => summary.update += 1,
                ActionKind::Replace => summary.replace += 1,
                ActionKind::Destroy | ActionKind::DestroyDeposed => summary.destroy += 1,
                ActionKind::NoOp => summary.no_op += 1,
            }
        }
        summary
    }

    /// Returns true if applying the plan would call any provider.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Returns the action planned for `address`.
    #[must_use]
    pub fn action(&self, address: &ResourceAddress) -> Option<&PlannedAction> {
        self.actions.iter().find(|a| &a.address == address && a.kind != ActionKind::DestroyDeposed)
    }

    /// Returns the actions that change something.
    pub fn changes(&self) -> impl Iterator<Item = &PlannedAction> {
        self.actions.iter().filter(|a| a.kind.is_change())
    }

    /// Returns the `lineage/serial` label of the snapshot planned against.
    #[must_use]
    pub fn version_label(&self) -> String {
        format!("{}/{}", self.lineage, self.serial)
    }

    /// Checks that `snapshot` is the version this plan was computed against.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::StalePlan` if the lineage or serial differ.
    pub fn ensure_current(&self, snapshot: &StateSnapshot) -> std::result::Result<(), PlanError> {
        let initial = self.serial == 0 && snapshot.is_initial();
        if initial || (snapshot.lineage == self.lineage && snapshot.serial == self.serial) {
            Ok(())
        } else {
            Err(PlanError::StalePlan {
                planned: self.version_label(),
                current: snapshot.version_label(),
            })
        }
    }

    /// Gives a never-persisted snapshot the lineage this plan recorded, so
    /// the first write keeps the lineage the plan was computed against.
    pub fn adopt_lineage(&self, snapshot: &mut StateSnapshot) {
        if self.serial == 0 && snapshot.is_initial() && snapshot.lineage != self.lineage {
            debug!("Adopting lineage {} for a new workspace", self.lineage);
            snapshot.lineage.clone_from(&self.lineage);
        }
    }

    /// For each step, the steps that depend on it.
    #[must_use]
    pub fn step_dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.steps.len()];
        for step in &self.steps {
            for dep in &step.depends_on {
                if let Some(list) = dependents.get_mut(*dep) {
                    list.push(step.id);
                }
            }
        }
        dependents
    }

    /// Writes the plan as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan cannot be serialized or written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConvergeError::internal(format!("Failed to serialize plan: {e}")))?;
        fs::write(path, content).await?;
        info!("Saved plan {} to {}", self.id, path.display());
        Ok(())
    }

    /// Reads a plan written by [`Plan::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|_| ConfigError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                message: format!("Invalid plan file: {e}"),
                location: Some(path.display().to_string()),
            }
            .into()
        })
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.summary();
        if summary.change_count() == 0 {
            return write!(f, "{summary}");
        }

        for action in self.changes() {
            writeln!(f, "{} {}", action.kind.symbol(), action)?;
            for change in &action.changes {
                let before = change
                    .before
                    .as_ref()
                    .map_or_else(|| String::from("(none)"), Value::to_string);
                let marker = if change.requires_replace { " # forces replacement" } else { "" };
                writeln!(f, "    {}: {before} -> {}{marker}", change.path, change.after)?;
            }
        }
        write!(f, "{summary}")
    }
}

/// Checks that the step graph has no cycle.
///
/// # Errors
///
/// Returns `DependencyResolutionFailed` naming the steps left unordered.
pub(crate) fn check_steps_acyclic(steps: &[PlanStep]) -> std::result::Result<(), PlanError> {
    let mut remaining: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
    let mut dependents = vec![Vec::new(); steps.len()];
    for step in steps {
        for dep in &step.depends_on {
            if let Some(list) = dependents.get_mut(*dep) {
                list.push(step.id);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..steps.len()).filter(|i| remaining[*i] == 0).collect();
    let mut visited = 0;
    while let Some(id) = ready.pop_front() {
        visited += 1;
        for dependent in &dependents[id] {
            remaining[*dependent] -= 1;
            if remaining[*dependent] == 0 {
                ready.push_back(*dependent);
            }
        }
    }

    if visited == steps.len() {
        return Ok(());
    }

    let stuck: Vec<String> = steps
        .iter()
        .filter(|s| remaining[s.id] > 0)
        .map(ToString::to_string)
        .collect();
    Err(PlanError::DependencyResolutionFailed {
        message: format!("step ordering has a cycle through {}", stuck.join(", ")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: usize, name: &str, deps: &[usize]) -> PlanStep {
        PlanStep {
            id,
            address: ResourceAddress::new("t", name),
            provider: String::from("mem"),
            operation: StepOperation::Create,
            depends_on: deps.iter().copied().collect(),
        }
    }

    #[test]
    fn test_step_cycle_detection() {
        assert!(check_steps_acyclic(&[step(0, "a", &[]), step(1, "b", &[0])]).is_ok());

        let err = check_steps_acyclic(&[step(0, "a", &[1]), step(1, "b", &[0]), step(2, "c", &[])])
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("t.a"));
        assert!(message.contains("t.b"));
        assert!(!message.contains("t.c"));
    }

    #[test]
    fn test_summary_display() {
        let summary = PlanSummary {
            create: 1,
            destroy: 2,
            ..PlanSummary::default()
        };
        assert_eq!(
            summary.to_string(),
            "Plan: 1 to create, 0 to update, 0 to replace, 2 to destroy, 0 unchanged."
        );
        assert_eq!(
            PlanSummary { no_op: 3, ..PlanSummary::default() }.to_string(),
            "No changes. 3 resources up to date."
        );
    }

    #[test]
    fn test_ensure_current() {
        let snapshot = StateSnapshot::new("default");
        let plan = Plan {
            id: String::from("p"),
            created_at: Utc::now(),
            mode: PlanMode::Apply,
            workspace: String::from("default"),
            lineage: snapshot.lineage.clone(),
            serial: 0,
            config_hash: String::new(),
            actions: Vec::new(),
            steps: Vec::new(),
            graph: BuiltGraph::default(),
        };
        assert!(plan.ensure_current(&snapshot).is_ok());

        let mut advanced = snapshot.clone();
        advanced.serial = 1;
        assert!(matches!(
            plan.ensure_current(&advanced),
            Err(PlanError::StalePlan { .. })
        ));

        let mut foreign = StateSnapshot::new("default");
        foreign.serial = 1;
        assert!(plan.ensure_current(&foreign).is_err());
    }

    #[test]
    fn test_initial_snapshot_adopts_plan_lineage() {
        let plan = Plan {
            id: String::from("p"),
            created_at: Utc::now(),
            mode: PlanMode::Apply,
            workspace: String::from("default"),
            lineage: String::from("planned-lineage"),
            serial: 0,
            config_hash: String::new(),
            actions: Vec::new(),
            steps: Vec::new(),
            graph: BuiltGraph::default(),
        };

        // Nothing persisted yet: a fresh read carries a different lineage.
        let mut fresh = StateSnapshot::new("default");
        assert!(plan.ensure_current(&fresh).is_ok());
        plan.adopt_lineage(&mut fresh);
        assert_eq!(fresh.lineage, "planned-lineage");

        let mut written = StateSnapshot::new("default");
        written.serial = 1;
        plan.adopt_lineage(&mut written);
        assert_ne!(written.lineage, "planned-lineage");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("plan.json");
        let plan = Plan {
            id: String::from("p"),
            created_at: Utc::now(),
            mode: PlanMode::Destroy,
            workspace: String::from("default"),
            lineage: String::from("l"),
            serial: 4,
            config_hash: String::from("abc"),
            actions: Vec::new(),
            steps: vec![step(0, "a", &[])],
            graph: BuiltGraph::default(),
        };
        plan.save(&path).await.unwrap();
        assert_eq!(Plan::load(&path).await.unwrap(), plan);
    }
}
