//! Output formatting for CLI commands.
//!
//! This module renders plans, reports and state as text tables or JSON.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::planner::{
    ActionKind, ApplyCounts, ApplyReport, Plan, PlanMode, StepOutcome, StepReport,
};
use crate::reconciler::DriftReport;
use crate::state::{ResourceRecord, SnapshotVersion, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Step outcome row for table display.
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "ID")]
    id: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Deposed")]
    deposed: usize,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Snapshot version row for table display.
#[derive(Tabled)]
struct VersionRow {
    #[tabled(rename = "Serial")]
    serial: u64,
    #[tabled(rename = "Written")]
    written: String,
    #[tabled(rename = "Resources")]
    resources: usize,
    #[tabled(rename = "Lineage")]
    lineage: String,
}

#[derive(Serialize)]
struct ApplyJson<'a> {
    complete: bool,
    cancelled: bool,
    counts: ApplyCounts,
    steps: &'a [StepReport],
}

#[derive(Serialize)]
struct ValidationJson<'a> {
    valid: bool,
    errors: Vec<BTreeMap<&'a str, &'a str>>,
    warnings: &'a [String],
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = ValidationJson {
                    valid: result.is_valid(),
                    errors: result
                        .errors
                        .iter()
                        .map(|e| {
                            BTreeMap::from([("field", e.field.as_str()), ("message", e.message.as_str())])
                        })
                        .collect(),
                    warnings: &result.warnings,
                };
                to_json(&json)
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for error in &result.errors {
                    let _ = writeln!(output, "{} {}: {}", "✗".red(), error.field, error.message);
                }
                if show_warnings {
                    for warning in &result.warnings {
                        let _ = writeln!(output, "{} {warning}", "⚠".yellow());
                    }
                }
                if result.is_valid() {
                    let _ = writeln!(
                        output,
                        "{} Configuration is valid ({} warnings)",
                        "✓".green(),
                        result.warning_count()
                    );
                }
                output
            }
        }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan) -> String {
        let summary = plan.summary();
        if summary.change_count() == 0 {
            return format!(
                "{} No changes required - {} resources up to date.\n",
                "✓".green(),
                summary.no_op
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan {} ({} mode)", short(&plan.id), mode_name(plan));
        let _ = writeln!(output, "   State: {}", plan.version_label());
        let _ = writeln!(output, "   Config hash: {}\n", short(&plan.config_hash));

        let rows: Vec<PlanActionRow> = plan
            .changes()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action(a.kind),
                resource: a.address.to_string(),
                reason: truncate(&a.reason, 50),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        for action in plan.changes().filter(|a| !a.changes.is_empty()) {
            let _ = writeln!(output, "\n  {} {}", action.kind.symbol(), action.address);
            for change in &action.changes {
                let before = change
                    .before
                    .as_ref()
                    .map_or_else(|| String::from("(none)"), Value::to_string);
                let marker = if change.requires_replace {
                    " # forces replacement".red().to_string()
                } else {
                    String::new()
                };
                let _ = writeln!(output, "      {}: {before} -> {}{marker}", change.path, change.after);
            }
        }

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.destroy.to_string().red()
        );
        output
    }

    /// Formats an apply report.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ApplyJson {
                complete: report.is_complete(),
                cancelled: report.cancelled,
                counts: report.counts(),
                steps: &report.steps,
            }),
            OutputFormat::Text => {
                let rows: Vec<StepRow> = report
                    .steps
                    .iter()
                    .filter(|s| s.outcome != StepOutcome::NoOp)
                    .map(|s| StepRow {
                        resource: s.address.to_string(),
                        operation: s.operation.clone(),
                        result: Self::format_outcome(&s.outcome),
                        id: s.external_id.clone().unwrap_or_default(),
                    })
                    .collect();

                let mut output = String::new();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let status = if report.is_complete() {
                    format!("{} Apply complete", "✓".green())
                } else if report.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply incomplete", "✗".red())
                };
                let _ = writeln!(output, "\n{status}. {}", report.counts());

                let errors = report.errors();
                if !errors.is_empty() {
                    let _ = writeln!(output, "\n{} Errors:", "⚠".yellow());
                    for (address, error) in errors {
                        let _ = writeln!(output, "   - {address}: {error}");
                    }
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected - {} resources converged.\n",
                        "✓".green(),
                        report.resource_count
                    );
                }

                let mut output = String::new();
                if !report.drift.is_empty() {
                    let _ = writeln!(output, "{} Drift detected:\n", "⚠".yellow());
                    for entry in &report.drift {
                        let _ = writeln!(output, "   - {entry}");
                    }
                }
                if !report.pending.is_empty() {
                    let _ = writeln!(output, "\nPending changes:");
                    for change in &report.pending {
                        let _ = writeln!(
                            output,
                            "   {} {} ({})",
                            Self::format_action(change.action),
                            change.address,
                            change.reason
                        );
                    }
                }
                let _ = writeln!(output, "\n{}", report.summary);
                output
            }
        }
    }

    /// Formats published outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => to_json(outputs),
            OutputFormat::Text => {
                if outputs.is_empty() {
                    return String::from("No outputs published.\n");
                }
                let mut output = String::new();
                for (name, value) in outputs {
                    let _ = writeln!(output, "{} = {value}", name.bold());
                }
                output
            }
        }
    }

    /// Formats the records of a snapshot.
    #[must_use]
    pub fn format_records(&self, snapshot: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => to_json(snapshot),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(
                    output,
                    "\nState: {} (serial {}, lineage {})\n",
                    snapshot.workspace,
                    snapshot.serial,
                    short(&snapshot.lineage)
                );
                if snapshot.is_empty() {
                    output.push_str("   No resources recorded.\n");
                    return output;
                }
                let rows: Vec<RecordRow> = snapshot
                    .resources
                    .values()
                    .map(|r| RecordRow {
                        resource: r.address.to_string(),
                        provider: r.provider.clone(),
                        id: truncate(&r.external_id, 24),
                        deposed: r.deposed.len(),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats one record.
    #[must_use]
    pub fn format_record(&self, record: &ResourceRecord) -> String {
        match self.format {
            OutputFormat::Json => to_json(record),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "{}", record.address.to_string().bold());
                let _ = writeln!(output, "   Provider: {}", record.provider);
                let _ = writeln!(output, "   ID: {}", record.external_id);
                let _ = writeln!(output, "   Created: {}", record.created_at);
                let _ = writeln!(output, "   Updated: {}", record.updated_at);
                if !record.dependencies.is_empty() {
                    let deps: Vec<String> = record.dependencies.iter().map(ToString::to_string).collect();
                    let _ = writeln!(output, "   Depends on: {}", deps.join(", "));
                }
                output.push_str("   Attributes:\n");
                for (key, value) in &record.attributes {
                    let _ = writeln!(output, "     {key} = {value}");
                }
                for deposed in &record.deposed {
                    let _ = writeln!(
                        output,
                        "   {} deposed {} (since {})",
                        "⚠".yellow(),
                        deposed.external_id,
                        deposed.deposed_at
                    );
                }
                output
            }
        }
    }

    /// Formats the version history.
    #[must_use]
    pub fn format_history(&self, versions: &[SnapshotVersion]) -> String {
        match self.format {
            OutputFormat::Json => to_json(versions),
            OutputFormat::Text => {
                if versions.is_empty() {
                    return String::from("No versions stored.\n");
                }
                let rows: Vec<VersionRow> = versions
                    .iter()
                    .rev()
                    .map(|v| VersionRow {
                        serial: v.serial,
                        written: v.written_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        resources: v.resource_count,
                        lineage: short(&v.lineage),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", "✓".green().to_string(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", "✗".red().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", "⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, marker: String, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => format!("{marker} {message}"),
        }
    }

    /// Formats an action kind with color.
    fn format_action(kind: ActionKind) -> String {
        let label = format!("{}{kind}", kind.symbol().trim());
        match kind {
            ActionKind::Create => label.green().to_string(),
            ActionKind::Update => label.yellow().to_string(),
            ActionKind::Replace => label.magenta().to_string(),
            ActionKind::Destroy | ActionKind::DestroyDeposed => label.red().to_string(),
            ActionKind::NoOp => label.dimmed().to_string(),
        }
    }

    /// Formats a step outcome with color.
    fn format_outcome(outcome: &StepOutcome) -> String {
        match outcome {
            StepOutcome::Succeeded => "ok".green().to_string(),
            StepOutcome::Failed { error } => format!("{} {}", "failed:".red(), truncate(error, 40)),
            StepOutcome::Skipped { reason } => format!("{} {reason}", "skipped:".yellow()),
            StepOutcome::NoOp => "unchanged".dimmed().to_string(),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn mode_name(plan: &Plan) -> &'static str {
    match plan.mode {
        PlanMode::Apply => "apply",
        PlanMode::Destroy => "destroy",
    }
}

/// First eight characters of an identifier.
fn short(id: &str) -> String {
    id.chars().take(8).collect()
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer reason", 10), "a much ...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }

    #[test]
    fn test_json_messages() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let parsed: Value = serde_json::from_str(&formatter.error("boom")).unwrap();
        assert_eq!(parsed["status"], "error");
        assert_eq!(parsed["message"], "boom");
    }

    #[test]
    fn test_empty_outputs() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        assert_eq!(formatter.format_outputs(&BTreeMap::new()), "No outputs published.\n");
    }
}
