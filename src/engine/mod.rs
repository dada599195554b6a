//! Reconciliation engine: drive every step of a plan to its desired state.
//!
//! Each step runs on its own OS thread (via `std::thread::scope`) and blocks
//! on a [`DepGraph`] until its prerequisites finish. OS threads are used
//! deliberately — blocking on a `Condvar` inside a fixed-size worker pool
//! would deadlock when the pool is smaller than the number of steps with
//! unsatisfied prerequisites. A [`Semaphore`] bounds how many steps probe or
//! apply at once, and a [`TokenSet`] serializes steps that contend on a
//! shared external resource such as the package database.

pub mod cancel;
pub mod scheduler;
pub mod tokens;

use std::time::{Duration, Instant};

use crate::apply::apply;
use crate::error::StepError;
use crate::exec::Executor;
use crate::plan::{Plan, Step};
use crate::probe::{probe, ProbeState};
use crate::report::{ReportSink, RunReport, StepOutcome, StepResult};

use self::cancel::CancelToken;
use self::scheduler::{DepGraph, DepsStatus, Semaphore};
use self::tokens::TokenSet;

/// Tunable limits for one engine run.
#[derive(Debug, Clone)]
pub struct EngineOpts {
    /// Maximum number of steps probing or applying concurrently.
    pub concurrency: usize,
    /// Retries after the first failed attempt of a retryable step.
    pub max_retries: u32,
    /// Base unit for the quadratic retry backoff (attempt² × base).
    pub backoff_base: Duration,
    /// Time budget for a single probe command.
    pub probe_timeout: Duration,
    /// Default time budget for a single apply command.
    pub apply_timeout: Duration,
    /// Report what would be applied without applying anything.
    pub dry_run: bool,
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism().map_or(4, std::num::NonZero::get),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(30),
            apply_timeout: Duration::from_secs(600),
            dry_run: false,
        }
    }
}

/// Delay before retry number `attempt` (1-based): attempt² × base, giving
/// 1s, 4s, 9s with the default base.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.saturating_mul(attempt))
}

/// Outcome of one reconciliation attempt, before retry policy is applied.
enum Attempt {
    Done(StepOutcome, Option<String>),
    Failed(StepError),
}

/// The reconciliation engine. Borrows an executor so tests can substitute a
/// scripted one.
pub struct Engine<'a> {
    executor: &'a dyn Executor,
    opts: EngineOpts,
    cancel: CancelToken,
}

impl<'a> Engine<'a> {
    /// Create an engine over `executor` with the given limits.
    #[must_use]
    pub fn new(executor: &'a dyn Executor, opts: EngineOpts, cancel: CancelToken) -> Self {
        Self {
            executor,
            opts,
            cancel,
        }
    }

    /// Reconcile every step of `plan` and return the collected report.
    ///
    /// Steps whose prerequisites failed, or were filtered out of the run,
    /// are recorded as skipped without probing. Cancellation stops new work;
    /// in-flight steps finish and are reported normally.
    #[must_use]
    pub fn run(&self, plan: &Plan) -> RunReport {
        let graph = DepGraph::new();
        let semaphore = Semaphore::new(self.opts.concurrency);
        let token_set = TokenSet::new();
        let sink = ReportSink::new();

        // A prerequisite filtered out of this run (via skip) counts as
        // unsuccessful: its dependents are skipped, exactly as if it had
        // failed.
        let present: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();

        std::thread::scope(|s| {
            for step in &plan.steps {
                let graph = &graph;
                let semaphore = &semaphore;
                let token_set = &token_set;
                let sink = &sink;
                let present = &present;
                s.spawn(move || {
                    let missing = step
                        .prerequisites
                        .iter()
                        .any(|d| !present.contains(&d.as_str()));
                    let status = if missing {
                        DepsStatus::Blocked
                    } else {
                        graph.wait_for_deps(&step.prerequisites)
                    };
                    let start = Instant::now();

                    let (outcome, detail) = if missing {
                        tracing::warn!("{}: skipped, prerequisite not in this run", step.id);
                        (
                            StepOutcome::Skipped,
                            Some("prerequisite skipped".to_string()),
                        )
                    } else if status == DepsStatus::Blocked {
                        tracing::warn!("{}: skipped, prerequisite failed", step.id);
                        (
                            StepOutcome::Skipped,
                            Some("prerequisite failed".to_string()),
                        )
                    } else if self.cancel.is_cancelled() {
                        tracing::warn!("{}: not started, run cancelled", step.id);
                        (
                            StepOutcome::Failed,
                            Some(StepError::Cancelled.to_string()),
                        )
                    } else {
                        let _permit = semaphore.acquire();
                        // Held across both probe and apply so no other step
                        // touches the same resource mid-attempt.
                        let _token = step
                            .classification
                            .resource_token()
                            .and_then(|name| token_set.hold(name));
                        self.reconcile(step)
                    };

                    graph.mark_done(&step.id, outcome.is_success());
                    sink.record(StepResult::new(
                        &step.id,
                        &step.label,
                        outcome,
                        detail,
                        start.elapsed(),
                    ));
                });
            }
        });

        let order: Vec<String> = plan.steps.iter().map(|s| s.id.clone()).collect();
        sink.finish(&order)
    }

    /// Drive one step to a terminal outcome, applying the retry policy.
    fn reconcile(&self, step: &Step) -> (StepOutcome, Option<String>) {
        let mut attempt = 0;
        loop {
            match self.attempt(step) {
                Attempt::Done(outcome, detail) => {
                    match outcome {
                        StepOutcome::Satisfied => tracing::info!("{}: satisfied", step.id),
                        StepOutcome::Applied => tracing::info!("{}: applied", step.id),
                        StepOutcome::WouldApply => tracing::info!(
                            target: "converge::dry_run",
                            "{}: would apply",
                            step.id
                        ),
                        StepOutcome::Skipped => {
                            tracing::warn!("{}: {}", step.id, detail.as_deref().unwrap_or(""));
                        }
                        StepOutcome::Failed => {}
                    }
                    return (outcome, detail);
                }
                Attempt::Failed(err) => {
                    attempt += 1;
                    let retryable = err.is_retryable()
                        || (matches!(err, StepError::Apply { .. })
                            && step.classification.is_transient());
                    if !retryable || attempt > self.opts.max_retries || self.cancel.is_cancelled()
                    {
                        tracing::error!("{}: {err}", step.id);
                        return (StepOutcome::Failed, Some(err.to_string()));
                    }
                    let delay = backoff_delay(self.opts.backoff_base, attempt);
                    tracing::warn!(
                        "{}: attempt {attempt} failed ({err}), retrying in {delay:?}",
                        step.id
                    );
                    std::thread::sleep(delay);
                    if self.cancel.is_cancelled() {
                        return (StepOutcome::Failed, Some(StepError::Cancelled.to_string()));
                    }
                }
            }
        }
    }

    /// One probe-then-apply attempt.
    fn attempt(&self, step: &Step) -> Attempt {
        tracing::debug!("{}: probing", step.id);
        let state = match probe(step, self.executor, self.opts.probe_timeout) {
            Ok(state) => state,
            Err(err) => return Attempt::Failed(err),
        };

        match state {
            ProbeState::Satisfied => Attempt::Done(StepOutcome::Satisfied, None),
            ProbeState::RequiresRelogin => Attempt::Done(
                StepOutcome::Skipped,
                Some("configured, effective after next login".to_string()),
            ),
            ProbeState::Unsatisfied if self.opts.dry_run => {
                Attempt::Done(StepOutcome::WouldApply, None)
            }
            ProbeState::Unsatisfied => {
                if self.cancel.is_cancelled() {
                    return Attempt::Failed(StepError::Cancelled);
                }
                tracing::debug!("{}: applying", step.id);
                if let Err(err) = apply(step, self.executor, self.opts.apply_timeout) {
                    // Another actor may have satisfied the condition while
                    // our apply was failing; one re-probe settles it.
                    if matches!(err, StepError::Apply { .. } | StepError::ApplyTimeout(_)) {
                        if let Ok(ProbeState::Satisfied) =
                            probe(step, self.executor, self.opts.probe_timeout)
                        {
                            tracing::debug!("{}: satisfied concurrently", step.id);
                            return Attempt::Done(StepOutcome::Satisfied, None);
                        }
                    }
                    return Attempt::Failed(err);
                }
                self.verify(step)
            }
        }
    }

    /// Re-probe after a successful apply to confirm convergence.
    fn verify(&self, step: &Step) -> Attempt {
        match probe(step, self.executor, self.opts.probe_timeout) {
            Ok(ProbeState::Satisfied) => Attempt::Done(StepOutcome::Applied, None),
            Ok(ProbeState::RequiresRelogin) => Attempt::Done(
                StepOutcome::Skipped,
                Some("applied, effective after next login".to_string()),
            ),
            Ok(ProbeState::Unsatisfied) => Attempt::Failed(StepError::Apply {
                code: 0,
                stdout: String::new(),
                stderr: "apply completed but state is still unsatisfied".to_string(),
            }),
            Err(err) => Attempt::Failed(err),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::exec::test_support::{Response, ScriptedExecutor};
    use crate::plan::{ApplySpec, Classification, ProbeSpec, StepSpec};
    use crate::report::RunStatus;

    fn opts() -> EngineOpts {
        EngineOpts {
            concurrency: 1,
            max_retries: 3,
            backoff_base: Duration::ZERO,
            probe_timeout: Duration::from_secs(5),
            apply_timeout: Duration::from_secs(5),
            dry_run: false,
        }
    }

    fn command_spec(id: &str, prerequisites: &[&str]) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            label: id.to_string(),
            classification: Classification::Command,
            prerequisites: prerequisites.iter().map(ToString::to_string).collect(),
            probe: ProbeSpec {
                check: Some(format!("check {id}")),
                ..ProbeSpec::default()
            },
            apply: ApplySpec {
                command: Some(format!("apply {id}")),
            },
            timeout_secs: None,
        }
    }

    fn package_spec(id: &str) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            label: id.to_string(),
            classification: Classification::Package,
            prerequisites: vec![],
            probe: ProbeSpec {
                package: Some(id.to_string()),
                ..ProbeSpec::default()
            },
            apply: ApplySpec::default(),
            timeout_secs: None,
        }
    }

    fn plan(specs: Vec<StepSpec>) -> Plan {
        Plan::from_specs(specs).expect("valid plan")
    }

    fn run_one(spec: StepSpec, executor: &ScriptedExecutor, opts: EngineOpts) -> RunReport {
        let engine = Engine::new(executor, opts, CancelToken::new());
        engine.run(&plan(vec![spec]))
    }

    #[test]
    fn satisfied_step_never_applies() {
        let executor = ScriptedExecutor::ok("");
        let report = run_one(command_spec("a", &[]), &executor, opts());
        assert_eq!(report.results[0].outcome, StepOutcome::Satisfied);
        assert_eq!(executor.recorded_calls(), vec!["check a"]);
        assert_eq!(report.status, RunStatus::Success);
    }

    #[test]
    fn unsatisfied_step_applies_and_verifies() {
        let executor = ScriptedExecutor::with_responses(vec![
            Response::Complete(ScriptedExecutor::exit_result(1, "")),
            Response::Complete(ScriptedExecutor::ok_result("")),
            Response::Complete(ScriptedExecutor::ok_result("")),
        ]);
        let report = run_one(command_spec("a", &[]), &executor, opts());
        assert_eq!(report.results[0].outcome, StepOutcome::Applied);
        assert_eq!(
            executor.recorded_calls(),
            vec!["check a", "apply a", "check a"]
        );
    }

    #[test]
    fn dry_run_reports_would_apply_without_applying() {
        let executor = ScriptedExecutor::exit(1, "");
        let mut o = opts();
        o.dry_run = true;
        let report = run_one(command_spec("a", &[]), &executor, o);
        assert_eq!(report.results[0].outcome, StepOutcome::WouldApply);
        assert_eq!(executor.recorded_calls(), vec!["check a"]);
        assert_eq!(report.status, RunStatus::Success);
    }

    #[test]
    fn failed_apply_with_concurrent_satisfaction_is_satisfied() {
        let executor = ScriptedExecutor::with_responses(vec![
            Response::Complete(ScriptedExecutor::exit_result(1, "")),
            Response::Complete(ScriptedExecutor::exit_result(100, "lock held")),
            Response::Complete(ScriptedExecutor::ok_result("")),
        ]);
        let report = run_one(command_spec("a", &[]), &executor, opts());
        assert_eq!(report.results[0].outcome, StepOutcome::Satisfied);
        assert_eq!(report.status, RunStatus::Success);
    }

    #[test]
    fn probe_errors_are_retried_until_success() {
        let executor = ScriptedExecutor::with_responses(vec![
            Response::SpawnError("transient".to_string()),
            Response::Complete(ScriptedExecutor::ok_result("")),
        ]);
        let report = run_one(command_spec("a", &[]), &executor, opts());
        assert_eq!(report.results[0].outcome, StepOutcome::Satisfied);
        assert_eq!(executor.recorded_calls().len(), 2);
    }

    #[test]
    fn retries_are_bounded_by_max_retries() {
        let responses = std::iter::repeat_with(|| Response::SpawnError("down".to_string()))
            .take(10)
            .collect();
        let executor = ScriptedExecutor::with_responses(responses);
        let mut o = opts();
        o.max_retries = 2;
        let report = run_one(command_spec("a", &[]), &executor, o);
        assert_eq!(report.results[0].outcome, StepOutcome::Failed);
        // Initial attempt plus two retries.
        assert_eq!(executor.recorded_calls().len(), 3);
        assert_eq!(report.status, RunStatus::PartialFailure);
    }

    #[test]
    fn command_apply_failure_is_terminal() {
        let executor = ScriptedExecutor::with_responses(vec![
            Response::Complete(ScriptedExecutor::exit_result(1, "")),
            Response::Complete(ScriptedExecutor::exit_result(2, "boom")),
            Response::Complete(ScriptedExecutor::exit_result(1, "")),
        ]);
        let report = run_one(command_spec("a", &[]), &executor, opts());
        assert_eq!(report.results[0].outcome, StepOutcome::Failed);
        let detail = report.results[0].detail.as_deref().unwrap();
        assert!(detail.contains("boom"), "detail: {detail}");
        // Probe, apply, post-failure re-probe. No retry for command steps.
        assert_eq!(executor.recorded_calls().len(), 3);
    }

    #[test]
    fn package_apply_failure_is_retried() {
        // Package steps contend on the package database, so a failed install
        // is worth retrying.
        let executor = ScriptedExecutor::with_responses(vec![
            Response::Complete(ScriptedExecutor::exit_result(1, "")), // probe
            Response::Complete(ScriptedExecutor::exit_result(100, "dpkg lock")), // apply
            Response::Complete(ScriptedExecutor::exit_result(1, "")), // re-probe
            Response::Complete(ScriptedExecutor::exit_result(1, "")), // probe (retry)
            Response::Complete(ScriptedExecutor::ok_result("")),      // apply
            Response::Complete(ScriptedExecutor::ok_result("install ok installed")), // verify
        ]);
        let report = run_one(package_spec("git"), &executor, opts());
        assert_eq!(report.results[0].outcome, StepOutcome::Applied);
        assert_eq!(executor.recorded_calls().len(), 6);
    }

    #[test]
    fn package_then_dependent_service_end_to_end() {
        let service = StepSpec {
            id: "apache".to_string(),
            label: "Apache running".to_string(),
            classification: Classification::Service,
            prerequisites: vec!["git".to_string()],
            probe: ProbeSpec {
                unit: Some("apache2".to_string()),
                ..ProbeSpec::default()
            },
            apply: ApplySpec::default(),
            timeout_secs: None,
        };
        let executor = ScriptedExecutor::with_responses(vec![
            Response::Complete(ScriptedExecutor::exit_result(1, "")), // package probe
            Response::Complete(ScriptedExecutor::ok_result("")),      // install
            Response::Complete(ScriptedExecutor::ok_result("install ok installed")), // verify
            Response::Complete(ScriptedExecutor::ok_result("")),      // service probe
        ]);
        let engine = Engine::new(&executor, opts(), CancelToken::new());
        let report = engine.run(&plan(vec![package_spec("git"), service]));

        assert_eq!(report.results[0].outcome, StepOutcome::Applied);
        assert_eq!(report.results[1].outcome, StepOutcome::Satisfied);
        let calls = executor.recorded_calls();
        assert_eq!(calls.len(), 4);
        // The service probe runs only after the package step resolved, and
        // a satisfied probe means no apply was issued for it.
        assert!(calls[3].starts_with("systemctl is-active"));
        assert_eq!(report.status, RunStatus::Success);
    }

    #[test]
    fn relogin_probe_is_skipped_with_detail() {
        let mut spec = command_spec("docker-group", &[]);
        spec.probe.relogin_exit = Some(42);
        let executor = ScriptedExecutor::exit(42, "");
        let report = run_one(spec, &executor, opts());
        assert_eq!(report.results[0].outcome, StepOutcome::Skipped);
        assert!(report.results[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("login"));
        assert_eq!(report.status, RunStatus::PartialFailure);
    }

    #[test]
    fn dependents_of_failed_steps_are_skipped() {
        let executor =
            ScriptedExecutor::with_responses(vec![Response::SpawnError("down".to_string())]);
        let mut o = opts();
        o.max_retries = 0;
        let engine = Engine::new(&executor, o, CancelToken::new());
        let report = engine.run(&plan(vec![
            command_spec("a", &[]),
            command_spec("b", &["a"]),
            command_spec("c", &["b"]),
        ]));

        assert_eq!(report.results[0].outcome, StepOutcome::Failed);
        assert_eq!(report.results[1].outcome, StepOutcome::Skipped);
        assert_eq!(report.results[2].outcome, StepOutcome::Skipped);
        // Only the failed step ever reached the executor.
        assert_eq!(executor.recorded_calls().len(), 1);
    }

    #[test]
    fn dependents_of_skip_filtered_steps_are_skipped() {
        let executor = ScriptedExecutor::default();
        let engine = Engine::new(&executor, opts(), CancelToken::new());
        let filtered = plan(vec![
            command_spec("base", &[]),
            command_spec("dependent", &["base"]),
            command_spec("transitive", &["dependent"]),
        ])
        .skip(&["base".to_string()]);
        let report = engine.run(&filtered);

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].outcome, StepOutcome::Skipped);
        assert_eq!(
            report.results[0].detail.as_deref(),
            Some("prerequisite skipped")
        );
        // The cascade reaches steps whose own prerequisites are present.
        assert_eq!(report.results[1].outcome, StepOutcome::Skipped);
        assert!(executor.recorded_calls().is_empty());
        assert_eq!(report.status, RunStatus::PartialFailure);
    }

    #[test]
    fn skipped_dependent_outcome_names_the_reason() {
        let executor = ScriptedExecutor::with_responses(vec![
            Response::Complete(ScriptedExecutor::exit_result(1, "")),
            Response::Complete(ScriptedExecutor::exit_result(7, "bad")),
            Response::Complete(ScriptedExecutor::exit_result(1, "")),
        ]);
        let engine = Engine::new(&executor, opts(), CancelToken::new());
        let report = engine.run(&plan(vec![
            command_spec("a", &[]),
            command_spec("b", &["a"]),
        ]));
        assert_eq!(report.results[1].outcome, StepOutcome::Skipped);
        assert_eq!(
            report.results[1].detail.as_deref(),
            Some("prerequisite failed")
        );
    }

    #[test]
    fn cancelled_run_fails_unstarted_steps() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let executor = ScriptedExecutor::default();
        let engine = Engine::new(&executor, opts(), cancel);
        let report = engine.run(&plan(vec![command_spec("a", &[])]));
        assert_eq!(report.results[0].outcome, StepOutcome::Failed);
        assert_eq!(report.results[0].detail.as_deref(), Some("cancelled"));
        assert!(executor.recorded_calls().is_empty());
        assert_eq!(report.status, RunStatus::PartialFailure);
    }

    #[test]
    fn results_come_back_in_plan_order_despite_concurrency() {
        let executor = ScriptedExecutor::with_responses(
            std::iter::repeat_with(|| Response::Complete(ScriptedExecutor::ok_result("")))
                .take(4)
                .collect(),
        );
        let mut o = opts();
        o.concurrency = 4;
        let engine = Engine::new(&executor, o, CancelToken::new());
        let report = engine.run(&plan(vec![
            command_spec("a", &[]),
            command_spec("b", &[]),
            command_spec("c", &[]),
            command_spec("d", &[]),
        ]));
        let ids: Vec<&str> = report.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn backoff_grows_quadratically() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(9));
    }

    #[test]
    fn default_opts_match_documented_limits() {
        let o = EngineOpts::default();
        assert_eq!(o.max_retries, 3);
        assert_eq!(o.backoff_base, Duration::from_secs(1));
        assert_eq!(o.probe_timeout, Duration::from_secs(30));
        assert_eq!(o.apply_timeout, Duration::from_secs(600));
        assert!(!o.dry_run);
        assert!(o.concurrency >= 1);
    }
}
