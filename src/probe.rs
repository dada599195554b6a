//! Side-effect-free probes: is a step's desired end state already true?
//!
//! Probes never mutate system state and are safe to call repeatedly — the
//! reconciliation loop relies on both properties when it re-probes after an
//! apply (and after a *failed* apply, to tolerate another process having
//! satisfied the condition concurrently).

use std::time::Duration;

use sha2::{Digest as _, Sha256};

use crate::error::StepError;
use crate::exec::{shell_quote, ExecOutcome, ExecResult, Executor};
use crate::plan::{Action, PackageManager, Step};

/// Current state of a step's target, as observed by a probe.
///
/// `RequiresRelogin` models session-scoped state (e.g. supplementary group
/// membership) that is configured correctly but only takes effect in a new
/// login session — callers must re-probe from a fresh session rather than
/// trusting any cached flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeState {
    /// Desired state already holds; no apply needed.
    Satisfied,
    /// Desired state does not hold; an apply is required.
    Unsatisfied,
    /// Configured, but a new login session is required before it holds.
    RequiresRelogin,
}

/// Hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// The binary a package probe shells out to.
const fn package_query_tool(manager: PackageManager) -> &'static str {
    match manager {
        PackageManager::Apt => "dpkg-query",
        PackageManager::Pacman => "pacman",
        PackageManager::Snap => "snap",
    }
}

/// Fail fast when the tool a probe needs is not installed at all.
///
/// An absent package or service manager is an environment defect, not a
/// transient condition, so this maps to the non-retryable
/// [`StepError::MissingTool`] rather than a probe error.
fn require_tool(executor: &dyn Executor, tool: &str) -> Result<(), StepError> {
    if executor.which(tool) {
        Ok(())
    } else {
        Err(StepError::MissingTool(tool.to_string()))
    }
}

/// The query command used to probe a package's install state.
fn package_query(manager: PackageManager, name: &str) -> String {
    let name = shell_quote(name);
    match manager {
        // dpkg-query exits 0 for known-but-removed packages, so the
        // status field has to be inspected as well.
        PackageManager::Apt => format!("dpkg-query -W -f='${{Status}}' {name}"),
        PackageManager::Pacman => format!("pacman -Q {name}"),
        PackageManager::Snap => format!("snap list {name}"),
    }
}

/// The query command used to probe a service unit's active state.
fn service_query(unit: &str, user: bool) -> String {
    let scope = if user { " --user" } else { "" };
    format!("systemctl{scope} is-active --quiet {}", shell_quote(unit))
}

/// Run a probe command and map its completion to a state via `interpret`.
fn run_probe(
    executor: &dyn Executor,
    command: &str,
    timeout: Duration,
    interpret: impl FnOnce(&ExecResult) -> ProbeState,
) -> Result<ProbeState, StepError> {
    let outcome = executor
        .run_shell(command, Some(timeout))
        .map_err(|e| StepError::Probe(format!("{e:#}")))?;
    match outcome {
        ExecOutcome::Completed(result) => Ok(interpret(&result)),
        ExecOutcome::TimedOut => Err(StepError::ProbeTimeout(timeout)),
    }
}

/// Probe whether `step`'s desired end state already holds.
///
/// # Errors
///
/// Returns a retryable [`StepError::Probe`] when the state cannot be
/// determined (spawn failure, unreadable file),
/// [`StepError::ProbeTimeout`] when the probe command exceeds `timeout`, and
/// the non-retryable [`StepError::MissingTool`] when the package or service
/// manager binary the probe needs is not on `PATH`.
pub fn probe(
    step: &Step,
    executor: &dyn Executor,
    timeout: Duration,
) -> Result<ProbeState, StepError> {
    match &step.action {
        Action::Package { name, manager } => {
            require_tool(executor, package_query_tool(*manager))?;
            let command = package_query(*manager, name);
            run_probe(executor, &command, timeout, |result| {
                let installed = match manager {
                    PackageManager::Apt => {
                        result.success && result.stdout.contains("install ok installed")
                    }
                    PackageManager::Pacman | PackageManager::Snap => result.success,
                };
                if installed {
                    ProbeState::Satisfied
                } else {
                    ProbeState::Unsatisfied
                }
            })
        }
        Action::Service { unit, user } => {
            require_tool(executor, "systemctl")?;
            let command = service_query(unit, *user);
            run_probe(executor, &command, timeout, |result| {
                if result.success {
                    ProbeState::Satisfied
                } else {
                    ProbeState::Unsatisfied
                }
            })
        }
        Action::File { path, content } => match std::fs::read(path) {
            Ok(bytes) => {
                if content_hash(&bytes) == content_hash(content.as_bytes()) {
                    Ok(ProbeState::Satisfied)
                } else {
                    Ok(ProbeState::Unsatisfied)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProbeState::Unsatisfied),
            Err(e) => Err(StepError::Probe(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        },
        Action::Command {
            check,
            relogin_exit,
            ..
        } => {
            let relogin_exit = *relogin_exit;
            run_probe(executor, check, timeout, |result| {
                if result.success {
                    ProbeState::Satisfied
                } else if result.code.is_some() && result.code == relogin_exit {
                    ProbeState::RequiresRelogin
                } else {
                    ProbeState::Unsatisfied
                }
            })
        }
    }
}
