//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{EngineConfig, ValidationResult};
use crate::engine::PlanOutcome;
use crate::planner::{DiffSet, PlanSummary, Step, StepOp};
use crate::resource::PropertyValue;
use crate::state::{ApplyStatus, LockInfo, Snapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Op")]
    op: String,
    #[tabled(rename = "Type")]
    type_token: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Snapshot resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Type")]
    type_token: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: usize,
}

/// How a plan line is displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Create,
    Update,
    Delete,
    Replace,
    CreateReplacement,
    DeleteReplaced,
}

impl Marker {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::Replace => "+-",
            Self::CreateReplacement => "++",
            Self::DeleteReplaced => "--",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::CreateReplacement => "create-replacement",
            Self::DeleteReplaced => "delete-replaced",
        }
    }

    fn colored(self) -> String {
        let text = format!("{} {}", self.symbol(), self.label());
        match self {
            Self::Create | Self::CreateReplacement => text.green().to_string(),
            Self::Update => text.yellow().to_string(),
            Self::Delete | Self::DeleteReplaced => text.red().to_string(),
            Self::Replace => text.magenta().to_string(),
        }
    }
}

/// Picks the steps to display and their markers.
///
/// Unless `show_replace_steps` is set, a replacement is shown once at its
/// create position and the matching old-instance delete is hidden. Deletes
/// of leftover pending instances are always shown.
fn visible_steps(steps: &[Step], show_replace_steps: bool) -> Vec<(usize, &Step, Marker)> {
    steps
        .iter()
        .enumerate()
        .filter_map(|(i, step)| {
            let marker = match step.op {
                StepOp::Create => Marker::Create,
                StepOp::Update => Marker::Update,
                StepOp::Delete => Marker::Delete,
                StepOp::CreateReplacement if show_replace_steps => Marker::CreateReplacement,
                StepOp::CreateReplacement => Marker::Replace,
                StepOp::DeleteReplaced if show_replace_steps => Marker::DeleteReplaced,
                StepOp::DeleteReplaced => {
                    let replaced = steps
                        .iter()
                        .any(|s| s.op == StepOp::CreateReplacement && s.urn == step.urn);
                    if replaced {
                        return None;
                    }
                    Marker::Delete
                }
            };
            Some((i, step, marker))
        })
        .collect()
}

/// Renders a property value compactly.
fn render_value(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Null => String::from("null"),
        PropertyValue::Bool(b) => b.to_string(),
        PropertyValue::Number(n) => n.to_string(),
        PropertyValue::String(s) => format!("{s:?}"),
        PropertyValue::Array(items) => {
            let items: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", items.join(", "))
        }
        PropertyValue::Object(map) => {
            let fields: Vec<String> = map.iter().map(|(k, v)| format!("{k}: {}", render_value(v))).collect();
            format!("{{{}}}", fields.join(", "))
        }
        PropertyValue::Unknown => String::from("<computed>"),
        PropertyValue::Output(reference) => format!("<{reference}>"),
    }
}

fn render_optional(value: Option<&PropertyValue>) -> String {
    value.map_or_else(|| String::from("<absent>"), render_value)
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a planning outcome for display.
    #[must_use]
    pub fn format_plan(&self, outcome: &PlanOutcome, show_replace_steps: bool, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&PlanJson::from(outcome)).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(outcome, show_replace_steps, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(outcome: &PlanOutcome, show_replace_steps: bool, detailed: bool) -> String {
        let plan = &outcome.plan;
        let mut output = String::new();

        for urn in &outcome.excluded {
            let _ = writeln!(output, "{} Excluded after decode failure: {urn}", "⚠".yellow());
        }

        if plan.is_empty() {
            let _ = writeln!(
                output,
                "{} No changes. {} resource(s) are up to date.",
                "✓".green(),
                plan.summary.unchanged
            );
            Self::append_suppressed(&mut output, outcome);
            return output;
        }

        let _ = writeln!(output, "\nPlan for stack {}", plan.stack.bold());
        let _ = writeln!(output, "   Fingerprint: {}\n", plan.fingerprint);

        let rows: Vec<StepRow> = visible_steps(&plan.steps, show_replace_steps)
            .into_iter()
            .map(|(i, step, marker)| StepRow {
                index: i + 1,
                op: marker.colored(),
                type_token: step.type_token.to_string(),
                name: step.urn.name().to_string(),
                reason: Self::truncate(&step.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            Self::append_changes(&mut output, &outcome.diffs, &plan.steps);
        }

        let _ = write!(output, "\n{}\n", Self::format_summary(&plan.summary));
        Self::append_suppressed(&mut output, outcome);
        output
    }

    fn format_summary(summary: &PlanSummary) -> String {
        format!(
            "Plan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            summary.creates.to_string().green(),
            summary.updates.to_string().yellow(),
            summary.replaces.to_string().magenta(),
            summary.deletes.to_string().red(),
            summary.unchanged
        )
    }

    /// Lists changed properties for every resource with a create-side step.
    fn append_changes(output: &mut String, diffs: &DiffSet, steps: &[Step]) {
        output.push_str("\nChanges:\n");
        for step in steps.iter().filter(|s| s.new.is_some()) {
            let Some(diff) = diffs.get(&step.urn) else {
                continue;
            };
            if diff.changes.is_empty() {
                continue;
            }
            let _ = writeln!(output, "   {} ({})", step.urn.name(), diff.kind);
            for change in &diff.changes {
                let marker = if change.replaces { "+-".magenta() } else { "~".yellow() };
                let _ = writeln!(
                    output,
                    "     {marker} {}: {} => {}",
                    change.key,
                    render_optional(change.old.as_ref()),
                    render_optional(change.new.as_ref())
                );
            }
        }
    }

    fn append_suppressed(output: &mut String, outcome: &PlanOutcome) {
        let Some(suppressed) = &outcome.analysis.suppressed else {
            return;
        };
        let _ = write!(output, "\n{} Analyzer findings (not enforced):\n", "⚠".yellow());
        for failure in &suppressed.failures {
            let _ = writeln!(output, "   - {failure}");
        }
        for failure in &suppressed.resource_failures {
            let _ = writeln!(output, "   - {failure}");
        }
    }

    /// Formats a configuration validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &EngineConfig,
        result: &ValidationResult,
        manifest_resources: Option<usize>,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "project": config.project.name,
                    "stack": config.project.stack,
                    "warnings": result.warnings,
                    "manifest_resources": manifest_resources,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Stack: {}", config.project.stack);
                let _ = writeln!(output, "   Snapshot backend: {:?}", config.state.backend);
                let _ = writeln!(output, "   Concurrency: {}", config.apply.concurrency);
                if let Some(count) = manifest_resources {
                    let _ = writeln!(output, "   Manifest resources: {count} (all decoded)");
                }
                output
            }
        }
    }

    /// Formats a snapshot.
    #[must_use]
    pub fn format_snapshot(&self, snapshot: &Snapshot) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(snapshot).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nSnapshot: {}\n\n", snapshot.stack.bold());
                let _ = writeln!(output, "   Version: {}", snapshot.version);
                let _ = writeln!(output, "   Serial: {}", snapshot.serial);
                let _ = writeln!(output, "   Last updated: {}", snapshot.last_updated);
                let _ = writeln!(output, "   Resources: {}", snapshot.resources.len());
                if !snapshot.pending_deletes.is_empty() {
                    let _ = writeln!(
                        output,
                        "   Pending deletes: {}",
                        snapshot.pending_deletes.len().to_string().red()
                    );
                }

                if !snapshot.resources.is_empty() {
                    let rows: Vec<ResourceRow> = snapshot
                        .resources
                        .iter()
                        .map(|r| ResourceRow {
                            type_token: r.type_token.to_string(),
                            name: r.urn.name().to_string(),
                            id: Self::truncate(r.id.as_deref().unwrap_or("-"), 24),
                            dependencies: r.dependencies.len(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !snapshot.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent applies ({}):", snapshot.history.len());
                    for entry in snapshot.history.iter().rev().take(5) {
                        let status = match entry.status {
                            ApplyStatus::Succeeded => "✓".green(),
                            ApplyStatus::PartiallySucceeded | ApplyStatus::Cancelled => "~".yellow(),
                            ApplyStatus::Failed => "✗".red(),
                        };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ok, {} failed, {} skipped ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.succeeded,
                            entry.failed,
                            entry.skipped,
                            Self::truncate(&entry.fingerprint, 12)
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a lock.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "Snapshot locked: {}\n   Holder: {}\n   Expires in: {}s\n",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
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
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson {
    stack: String,
    fingerprint: String,
    summary: PlanSummary,
    steps: Vec<StepJson>,
    excluded: Vec<String>,
    warnings: Vec<String>,
}

#[derive(Serialize)]
struct StepJson {
    op: StepOp,
    urn: String,
    #[serde(rename = "type")]
    type_token: String,
    keys: Vec<String>,
    depends_on: Vec<usize>,
    reason: String,
}

impl From<&PlanOutcome> for PlanJson {
    fn from(outcome: &PlanOutcome) -> Self {
        let plan = &outcome.plan;
        let warnings = outcome
            .analysis
            .suppressed
            .as_ref()
            .map(|s| {
                s.failures
                    .iter()
                    .map(ToString::to_string)
                    .chain(s.resource_failures.iter().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            stack: plan.stack.clone(),
            fingerprint: plan.fingerprint.clone(),
            summary: plan.summary,
            steps: plan
                .steps
                .iter()
                .map(|s| StepJson {
                    op: s.op,
                    urn: s.urn.to_string(),
                    type_token: s.type_token.to_string(),
                    keys: s.keys.clone(),
                    depends_on: s.depends_on.clone(),
                    reason: s.reason.clone(),
                })
                .collect(),
            excluded: outcome.excluded.iter().map(ToString::to_string).collect(),
            warnings,
        }
    }
}
