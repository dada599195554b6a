//! Run reporting: per-step results, aggregate status, and output.
//!
//! The [`ReportSink`] is append-only during a run — results are recorded
//! once, never mutated, and assembled into a [`RunReport`] at run end.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Terminal outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The probe found the desired state already true; nothing ran.
    Satisfied,
    /// The apply ran and a re-probe confirmed convergence.
    Applied,
    /// Dry-run: the step is unsatisfied and would have been applied.
    WouldApply,
    /// The step failed terminally (retries exhausted, or cancelled).
    Failed,
    /// A prerequisite failed, or the state needs a new login session.
    Skipped,
}

impl StepOutcome {
    /// Whether dependents of a step with this outcome may proceed.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Satisfied | Self::Applied | Self::WouldApply)
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Satisfied => write!(f, "satisfied"),
            Self::Applied => write!(f, "applied"),
            Self::WouldApply => write!(f, "would-apply"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Immutable record of one step attempt.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step identifier.
    pub id: String,
    /// Human-readable step label.
    pub label: String,
    /// Terminal outcome.
    pub outcome: StepOutcome,
    /// Error detail or skip reason, if any.
    pub detail: Option<String>,
    /// Wall-clock duration of the attempt, in milliseconds.
    pub duration_ms: u64,
}

impl StepResult {
    /// Build a result record for a finished step.
    #[must_use]
    pub fn new(
        id: &str,
        label: &str,
        outcome: StepOutcome,
        detail: Option<String>,
        duration: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            outcome,
            detail,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Aggregate status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step ended satisfied or applied.
    Success,
    /// Some steps failed or were skipped, but the run completed.
    PartialFailure,
    /// The plan itself could not be constructed; nothing executed.
    Fatal,
}

impl RunStatus {
    /// Process exit code for this status.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::PartialFailure => 1,
            Self::Fatal => 2,
        }
    }
}

/// Final, immutable report for one provisioning run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Aggregate run status.
    pub status: RunStatus,
    /// Per-step results in plan (execution) order.
    pub results: Vec<StepResult>,
}

impl RunReport {
    /// Compute the aggregate status from completed step results.
    #[must_use]
    pub fn from_results(results: Vec<StepResult>) -> Self {
        let status = if results.iter().all(|r| r.outcome.is_success()) {
            RunStatus::Success
        } else {
            RunStatus::PartialFailure
        };
        Self { status, results }
    }

    /// Machine-readable JSON rendering of the report.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (practically unreachable for
    /// this type).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Count results with the given outcome.
    #[must_use]
    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == outcome)
            .count()
    }

    /// One-line outcome tally for the human summary. Dry-run outcomes are
    /// only mentioned when present.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let would_apply = self.count(StepOutcome::WouldApply);
        let would = if would_apply > 0 {
            format!(", {would_apply} would apply")
        } else {
            String::new()
        };
        format!(
            "{} satisfied, {} applied{would}, {} failed, {} skipped",
            self.count(StepOutcome::Satisfied),
            self.count(StepOutcome::Applied),
            self.count(StepOutcome::Failed),
            self.count(StepOutcome::Skipped),
        )
    }

    /// Print the human-readable summary to stdout and failure details to
    /// stderr.
    pub fn print_summary(&self) {
        println!();
        println!("\x1b[1;34m==>\x1b[0m \x1b[1mSummary\x1b[0m");
        for result in &self.results {
            let (icon, color) = match result.outcome {
                StepOutcome::Satisfied => ("=", "\x1b[2m"),
                StepOutcome::Applied => ("+", "\x1b[32m"),
                StepOutcome::WouldApply => ("~", "\x1b[36m"),
                StepOutcome::Failed => ("x", "\x1b[31m"),
                StepOutcome::Skipped => ("-", "\x1b[33m"),
            };
            let detail = result
                .detail
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default();
            println!(
                "  {color}{icon}\x1b[0m {} [{}]{detail}",
                result.label, result.outcome
            );
        }
        println!("  {}", self.summary_line());

        for result in &self.results {
            if result.outcome == StepOutcome::Failed {
                if let Some(ref detail) = result.detail {
                    eprintln!("\x1b[31mERROR\x1b[0m {}: {detail}", result.id);
                }
            }
        }
    }
}

/// Append-only collector of [`StepResult`]s during a run.
///
/// Results arrive from concurrent step workers; each result is recorded
/// exactly once and owned by the sink for the remainder of the run.
#[derive(Debug, Default)]
pub struct ReportSink {
    results: Mutex<Vec<StepResult>>,
}

impl ReportSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one step's terminal result.
    pub fn record(&self, result: StepResult) {
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(result);
    }

    /// Assemble the final report, ordering results by `plan_order` (ids in
    /// plan execution order).
    #[must_use]
    pub fn finish(self, plan_order: &[String]) -> RunReport {
        let mut results = self
            .results
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let index =
            |id: &str| plan_order.iter().position(|p| p == id).unwrap_or(usize::MAX);
        results.sort_by_key(|r| index(&r.id));
        RunReport::from_results(results)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn result(id: &str, outcome: StepOutcome) -> StepResult {
        StepResult::new(id, id, outcome, None, Duration::from_millis(5))
    }

    #[test]
    fn all_satisfied_or_applied_is_success() {
        let report = RunReport::from_results(vec![
            result("a", StepOutcome::Satisfied),
            result("b", StepOutcome::Applied),
            result("c", StepOutcome::WouldApply),
        ]);
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.status.exit_code(), 0);
    }

    #[test]
    fn any_failure_is_partial_failure() {
        let report = RunReport::from_results(vec![
            result("a", StepOutcome::Applied),
            result("b", StepOutcome::Failed),
        ]);
        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.status.exit_code(), 1);
    }

    #[test]
    fn skipped_steps_also_mean_partial_failure() {
        let report = RunReport::from_results(vec![result("a", StepOutcome::Skipped)]);
        assert_eq!(report.status, RunStatus::PartialFailure);
    }

    #[test]
    fn fatal_exit_code_is_two() {
        assert_eq!(RunStatus::Fatal.exit_code(), 2);
    }

    #[test]
    fn sink_orders_results_by_plan_order() {
        let sink = ReportSink::new();
        sink.record(result("c", StepOutcome::Applied));
        sink.record(result("a", StepOutcome::Satisfied));
        sink.record(result("b", StepOutcome::Applied));

        let order: Vec<String> = ["a", "b", "c"].iter().map(ToString::to_string).collect();
        let report = sink.finish(&order);
        let ids: Vec<&str> = report.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn json_report_contains_status_and_outcomes() {
        let report = RunReport::from_results(vec![result("a", StepOutcome::Applied)]);
        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"success\""));
        assert!(json.contains("\"outcome\": \"applied\""));
        assert!(json.contains("\"duration_ms\": 5"));
    }

    #[test]
    fn count_filters_by_outcome() {
        let report = RunReport::from_results(vec![
            result("a", StepOutcome::Applied),
            result("b", StepOutcome::Applied),
            result("c", StepOutcome::Failed),
        ]);
        assert_eq!(report.count(StepOutcome::Applied), 2);
        assert_eq!(report.count(StepOutcome::Failed), 1);
        assert_eq!(report.count(StepOutcome::Skipped), 0);
    }

    #[test]
    fn summary_line_counts_would_apply_on_dry_runs() {
        let report = RunReport::from_results(vec![
            result("a", StepOutcome::Satisfied),
            result("b", StepOutcome::WouldApply),
            result("c", StepOutcome::WouldApply),
        ]);
        assert_eq!(
            report.summary_line(),
            "1 satisfied, 0 applied, 2 would apply, 0 failed, 0 skipped"
        );
    }

    #[test]
    fn summary_line_omits_would_apply_when_absent() {
        let report = RunReport::from_results(vec![
            result("a", StepOutcome::Applied),
            result("b", StepOutcome::Failed),
        ]);
        assert_eq!(
            report.summary_line(),
            "0 satisfied, 1 applied, 1 failed, 0 skipped"
        );
    }

    #[test]
    fn outcome_success_classification() {
        assert!(StepOutcome::Satisfied.is_success());
        assert!(StepOutcome::Applied.is_success());
        assert!(StepOutcome::WouldApply.is_success());
        assert!(!StepOutcome::Failed.is_success());
        assert!(!StepOutcome::Skipped.is_success());
    }
}
