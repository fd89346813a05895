//! Run summary: a pure view over the state file, rendered as text or JSON.

use crate::checkpoint::{Checkpoint, StateFile};
use crate::orchestrator::RunOutcome;
use crate::step::{Step, StepKind, StepOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A step as declared, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredStep {
    pub id: String,
    pub kind: Option<StepKind>,
}

impl DeclaredStep {
    pub fn from_steps(steps: &[Box<dyn Step>]) -> Vec<Self> {
        steps
            .iter()
            .map(|s| Self {
                id: s.id().to_string(),
                kind: Some(s.kind()),
            })
            .collect()
    }

    /// Fallback when no manifest is at hand: every checkpointed step, by id.
    pub fn from_state(state: &StateFile) -> Vec<Self> {
        state
            .checkpoints
            .keys()
            .map(|id| Self {
                id: id.clone(),
                kind: None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    /// Idempotent check held; `execute` never ran.
    AlreadySatisfied,
    Skipped,
    Failed,
    AwaitingReboot,
    /// Attempt started and was never recorded.
    Interrupted,
    Pending,
}

impl StepStatus {
    fn of(cp: Option<&Checkpoint>) -> Self {
        let Some(cp) = cp else {
            return Self::Pending;
        };
        if cp.in_flight {
            return Self::Interrupted;
        }
        match cp.last_outcome {
            Some(StepOutcome::Success) if cp.satisfied_by_check => Self::AlreadySatisfied,
            Some(StepOutcome::Success) if cp.is_complete() => Self::Succeeded,
            Some(StepOutcome::Skipped { .. }) => Self::Skipped,
            Some(StepOutcome::Failed { .. }) => Self::Failed,
            Some(StepOutcome::RebootRequired) => Self::AwaitingReboot,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "success",
            Self::AlreadySatisfied => "skipped (already satisfied)",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::AwaitingReboot => "awaiting reboot",
            Self::Interrupted => "interrupted",
            Self::Pending => "pending",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<StepKind>,
    pub status: StepStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    pub steps: Vec<StepSummary>,
    pub totals: Totals,
    pub cycles_used: u32,
    pub elapsed_ms: u64,
}

/// Build the summary. Steps appear in declared order; checkpoints for steps
/// no longer declared are ignored.
pub fn summarize(
    declared: &[DeclaredStep],
    state: &StateFile,
    outcome: Option<&RunOutcome>,
    elapsed: Duration,
) -> RunSummary {
    let mut totals = Totals::default();
    let steps: Vec<StepSummary> = declared
        .iter()
        .map(|d| {
            let cp = state.checkpoint(&d.id);
            let status = StepStatus::of(cp);
            match status {
                StepStatus::Succeeded => totals.succeeded += 1,
                StepStatus::AlreadySatisfied | StepStatus::Skipped => totals.skipped += 1,
                StepStatus::Failed => totals.failed += 1,
                StepStatus::AwaitingReboot | StepStatus::Interrupted | StepStatus::Pending => {
                    totals.pending += 1
                }
            }
            StepSummary {
                id: d.id.clone(),
                kind: d.kind,
                status,
                attempts: cp.map_or(0, |c| c.attempts_made),
                duration_ms: cp.map_or(0, |c| c.elapsed_ms),
                reason: cp
                    .and_then(|c| c.last_outcome.as_ref())
                    .and_then(StepOutcome::reason)
                    .map(str::to_string),
            }
        })
        .collect();

    RunSummary {
        run_id: Uuid::new_v4(),
        generated_at: Utc::now(),
        host: state.host.clone(),
        outcome: outcome.cloned(),
        steps,
        totals,
        cycles_used: state.cycle.cycle_number + 1,
        elapsed_ms: elapsed.as_millis() as u64,
    }
}

pub fn render_json(summary: &RunSummary) -> serde_json::Result<String> {
    serde_json::to_string_pretty(summary)
}

/// Plain-text table. Styling is dropped automatically when not on a terminal.
pub fn render_text(summary: &RunSummary) -> String {
    use console::style;
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{}  {}",
        style("Provisioning Summary").bold().cyan(),
        style(format!("run {} on {}", summary.run_id, summary.host)).dim()
    );
    let _ = writeln!(out, "{}", "─".repeat(78));
    let _ = writeln!(
        out,
        "{:<28} {:<10} {:<28} {:>8} {:>9}",
        "Step", "Kind", "Status", "Attempts", "Duration"
    );
    for step in &summary.steps {
        let kind = step.kind.map(|k| k.to_string()).unwrap_or_default();
        let status = format!("{:<28}", step.status.to_string());
        let status = match step.status {
            StepStatus::Succeeded => style(status).green(),
            StepStatus::AlreadySatisfied | StepStatus::Skipped => style(status).dim(),
            StepStatus::Failed | StepStatus::Interrupted => style(status).red(),
            StepStatus::AwaitingReboot => style(status).yellow(),
            StepStatus::Pending => style(status),
        };
        let _ = writeln!(
            out,
            "{:<28} {:<10} {} {:>8} {:>9}",
            step.id,
            kind,
            status,
            step.attempts,
            format_duration(step.duration_ms)
        );
        if let Some(ref reason) = step.reason
            && matches!(step.status, StepStatus::Failed | StepStatus::Skipped)
        {
            let _ = writeln!(out, "    {}", style(reason).dim());
        }
    }
    let _ = writeln!(out, "{}", "─".repeat(78));
    let t = &summary.totals;
    let _ = writeln!(
        out,
        "{} steps: {} succeeded, {} skipped, {} failed, {} pending",
        summary.steps.len(),
        t.succeeded,
        t.skipped,
        t.failed,
        t.pending
    );
    let _ = writeln!(
        out,
        "Cycles used: {}   Elapsed: {}",
        summary.cycles_used,
        format_duration(summary.elapsed_ms)
    );
    if let Some(ref outcome) = summary.outcome {
        let line = format!("Outcome: {}", outcome);
        let line = match outcome {
            RunOutcome::Done => style(line).green().bold(),
            RunOutcome::AwaitingReboot { .. } => style(line).yellow().bold(),
            RunOutcome::Fatal { .. } | RunOutcome::Cancelled => style(line).red().bold(),
        };
        let _ = writeln!(out, "{}", line);
        if let RunOutcome::Fatal { reason } = outcome {
            let _ = writeln!(
                out,
                "{}",
                style(format!(
                    "Fix the cause, then `orchestrate reset --step {}` and run again.",
                    reason.step_id()
                ))
                .dim()
            );
        }
    }
    out
}

fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}
