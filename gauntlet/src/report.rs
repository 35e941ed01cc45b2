use std::fmt::Display;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of a single execution try of a step's command.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Command exited 0.
    Passed,
    /// Command exited nonzero. In-band failure, never an error.
    Failed { exit_code: i32 },
    /// Wall-clock timeout expired; the process tree was terminated.
    TimedOut,
    /// Out-of-band infrastructure fault launching the command (missing
    /// working directory, unspawnable binary). Tagged distinctly from a
    /// failing exit so automation can tell regressions from flakes.
    ExecError { message: String },
    /// The run was aborted while this attempt was in flight.
    Cancelled,
}

impl Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed { exit_code } => write!(f, "failed (exit {exit_code})"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::ExecError { message } => write!(f, "exec_error ({message})"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One execution try of a step, including its captured result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u16,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Bounded tail of the combined stdout/stderr stream.
    pub output_tail: Vec<String>,
}

impl Attempt {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Terminal status of a step. Every step reaches exactly one of these
/// before its stage is finalized.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
    Cancelled,
}

impl Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Final record for one step: the flat, machine-parseable unit of the
/// report (stage, step, flavor, attempts, status, duration, tail).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepReport {
    pub stage: String,
    pub name: String,
    pub flavor: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub attempts: Vec<Attempt>,
}

impl StepReport {
    /// Finalize a step from its recorded attempts.
    pub fn finalize(
        stage: impl Into<String>,
        name: impl Into<String>,
        flavor: impl Into<String>,
        status: StepStatus,
        attempts: Vec<Attempt>,
    ) -> Self {
        let duration_ms = match (attempts.first(), attempts.last()) {
            (Some(first), Some(last)) => (last.finished_at - first.started_at)
                .num_milliseconds()
                .max(0) as u64,
            _ => 0,
        };
        Self {
            stage: stage.into(),
            name: name.into(),
            flavor: flavor.into(),
            status,
            duration_ms,
            attempts,
        }
    }

    /// A step that never ran (stage skipped, flavor without capacity).
    pub fn skipped(
        stage: impl Into<String>,
        name: impl Into<String>,
        flavor: impl Into<String>,
    ) -> Self {
        Self::finalize(stage, name, flavor, StepStatus::Skipped, Vec::new())
    }

    pub fn attempt_count(&self) -> u16 {
        self.attempts.len() as u16
    }

    /// Tail of the last attempt's output, for failure excerpts.
    pub fn last_output_tail(&self) -> &[String] {
        self.attempts
            .last()
            .map(|a| a.output_tail.as_slice())
            .unwrap_or(&[])
    }
}

/// Status of a finalized stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    Skipped,
    Cancelled,
    ResourceUnavailable,
}

impl Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
            Self::ResourceUnavailable => "resource_unavailable",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one stage, computed only once every step is terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub steps: Vec<StepReport>,
}

impl StageReport {
    /// Compute the stage verdict from terminal step statuses.
    ///
    /// A stage is failed iff at least one step failed or timed out;
    /// no silent swallow. `had_inadmissible` marks stages where some
    /// step could never lease its flavor, so the run can surface an
    /// infrastructure condition distinct from a regression.
    pub fn finalize(
        name: impl Into<String>,
        steps: Vec<StepReport>,
        had_inadmissible: bool,
        duration_ms: u64,
    ) -> Self {
        let any = |status: StepStatus| steps.iter().any(|s| s.status == status);
        let status = if any(StepStatus::Failed) || any(StepStatus::TimedOut) {
            StageStatus::Failed
        } else if any(StepStatus::Cancelled) {
            StageStatus::Cancelled
        } else if had_inadmissible {
            StageStatus::ResourceUnavailable
        } else if !steps.is_empty() && steps.iter().all(|s| s.status == StepStatus::Skipped) {
            StageStatus::Skipped
        } else {
            StageStatus::Passed
        };
        Self {
            name: name.into(),
            status,
            duration_ms,
            steps,
        }
    }

    /// A stage that never ran (earlier stage failed under stop-on-first
    /// semantics, or the run was already cancelled).
    pub fn skipped(name: impl Into<String>, steps: Vec<StepReport>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Skipped,
            duration_ms: 0,
            steps,
        }
    }
}

/// Overall verdict of an orchestrator invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
    Cancelled,
    ResourceUnavailable,
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::ResourceUnavailable => "resource_unavailable",
        };
        write!(f, "{s}")
    }
}

/// Aggregate outcome of an entire run, finalized once all stages have
/// completed or the run was aborted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    /// Combine stage outcomes into the run verdict.
    ///
    /// Operator cancellation dominates, then genuine test failure, then
    /// infrastructure gaps; a genuinely failing run is never masked by
    /// a resource shortage elsewhere in the matrix.
    pub fn finalize(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        stages: Vec<StageReport>,
        cancelled: bool,
    ) -> Self {
        let status = if cancelled {
            RunStatus::Cancelled
        } else if stages.iter().any(|s| s.status == StageStatus::Failed) {
            RunStatus::Failed
        } else if stages
            .iter()
            .any(|s| s.status == StageStatus::ResourceUnavailable)
        {
            RunStatus::ResourceUnavailable
        } else {
            RunStatus::Passed
        };
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            stages,
        }
    }

    /// Process exit code for calling automation: 0 all passed, 1 test
    /// failure, 3 resource unavailable, 130 cancelled. Configuration
    /// errors exit 2 before a report exists.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Passed => 0,
            RunStatus::Failed => 1,
            RunStatus::ResourceUnavailable => 3,
            RunStatus::Cancelled => 130,
        }
    }

    /// Flat iterator over every step record.
    pub fn step_records(&self) -> impl Iterator<Item = &StepReport> {
        self.stages.iter().flat_map(|s| s.steps.iter())
    }

    /// Serialize the full report as pretty JSON.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// One JSON object per step, newline-delimited, for CI ingestion.
    pub fn to_json_lines(&self) -> anyhow::Result<String> {
        let mut out = String::new();
        for record in self.step_records() {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Human-readable summary: per-stage and per-step status, duration,
    /// and for failures a bounded excerpt of captured output.
    pub fn render_human(&self) -> String {
        let mut out = String::new();
        let total_secs = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        let _ = writeln!(
            out,
            "run {} {} in {:.2}s",
            self.run_id, self.status, total_secs
        );
        for stage in &self.stages {
            let _ = writeln!(
                out,
                "  stage {}: {} ({:.2}s)",
                stage.name,
                stage.status,
                stage.duration_ms as f64 / 1000.0
            );
            for step in &stage.steps {
                let _ = writeln!(
                    out,
                    "    {} [{}] {} in {:.2}s ({} attempt{})",
                    step.name,
                    step.flavor,
                    step.status,
                    step.duration_ms as f64 / 1000.0,
                    step.attempt_count(),
                    if step.attempt_count() == 1 { "" } else { "s" }
                );
                if matches!(step.status, StepStatus::Failed | StepStatus::TimedOut) {
                    for attempt in &step.attempts {
                        let _ = writeln!(
                            out,
                            "      attempt {}: {}",
                            attempt.number, attempt.outcome
                        );
                    }
                    for line in step.last_output_tail() {
                        let _ = writeln!(out, "      | {line}");
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(number: u16, outcome: AttemptOutcome) -> Attempt {
        let now = Utc::now();
        Attempt {
            number,
            started_at: now,
            finished_at: now,
            outcome,
            output_tail: vec!["boom".to_string()],
        }
    }

    fn step(status: StepStatus) -> StepReport {
        StepReport::finalize(
            "stage",
            "step",
            "g2",
            status,
            vec![attempt(1, AttemptOutcome::Passed)],
        )
    }

    #[test]
    fn stage_failed_iff_step_failed_or_timed_out() {
        let report = StageReport::finalize(
            "s",
            vec![step(StepStatus::Passed), step(StepStatus::TimedOut)],
            false,
            10,
        );
        assert_eq!(report.status, StageStatus::Failed);

        let report = StageReport::finalize(
            "s",
            vec![step(StepStatus::Passed), step(StepStatus::Skipped)],
            false,
            10,
        );
        assert_eq!(report.status, StageStatus::Passed);
    }

    #[test]
    fn inadmissible_steps_surface_as_resource_unavailable() {
        let report = StageReport::finalize(
            "s",
            vec![step(StepStatus::Passed), step(StepStatus::Skipped)],
            true,
            10,
        );
        assert_eq!(report.status, StageStatus::ResourceUnavailable);

        // A genuine failure still dominates.
        let report = StageReport::finalize(
            "s",
            vec![step(StepStatus::Failed), step(StepStatus::Skipped)],
            true,
            10,
        );
        assert_eq!(report.status, StageStatus::Failed);
    }

    #[test]
    fn run_verdict_precedence() {
        let failed = StageReport::finalize("a", vec![step(StepStatus::Failed)], false, 1);
        let starved = StageReport::finalize("b", vec![step(StepStatus::Skipped)], true, 1);
        let passed = StageReport::finalize("c", vec![step(StepStatus::Passed)], false, 1);

        let report = RunReport::finalize(
            Uuid::now_v7(),
            Utc::now(),
            vec![failed.clone(), starved.clone(), passed.clone()],
            false,
        );
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.exit_code(), 1);

        let report =
            RunReport::finalize(Uuid::now_v7(), Utc::now(), vec![starved, passed], false);
        assert_eq!(report.status, RunStatus::ResourceUnavailable);
        assert_eq!(report.exit_code(), 3);

        let report = RunReport::finalize(Uuid::now_v7(), Utc::now(), vec![failed], true);
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.exit_code(), 130);
    }

    #[test]
    fn json_lines_emit_one_record_per_step() {
        let stage = StageReport::finalize(
            "s",
            vec![step(StepStatus::Passed), step(StepStatus::Failed)],
            false,
            5,
        );
        let report = RunReport::finalize(Uuid::now_v7(), Utc::now(), vec![stage], false);
        let lines = report.to_json_lines().unwrap();
        assert_eq!(lines.trim().lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
        assert_eq!(first["stage"], "s");
        assert_eq!(first["flavor"], "g2");
    }

    #[test]
    fn human_render_includes_failure_tail() {
        let failing = StepReport::finalize(
            "s",
            "broken",
            "g2",
            StepStatus::Failed,
            vec![attempt(1, AttemptOutcome::Failed { exit_code: 1 })],
        );
        let stage = StageReport::finalize("s", vec![failing], false, 5);
        let report = RunReport::finalize(Uuid::now_v7(), Utc::now(), vec![stage], false);
        let rendered = report.render_human();
        assert!(rendered.contains("broken [g2] failed"));
        assert!(rendered.contains("| boom"));
    }
}
