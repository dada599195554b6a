//! Apply actions: drive an unsatisfied step toward its desired state.
//!
//! Precondition: only invoked after a negative probe. Every action here is
//! idempotent by contract — package installs use the manager's
//! already-installed semantics, service enables are no-ops when active, and
//! file writes converge on the declared content.

use std::time::Duration;

use crate::error::StepError;
use crate::exec::{shell_quote, ExecOutcome, Executor};
use crate::plan::{Action, PackageManager, Step};

/// The default apply command for a step, if its action is command-based.
///
/// File steps return `None` — their apply is a native write, not a
/// subprocess (unless an `apply.command` override is declared).
#[must_use]
pub fn default_apply_command(step: &Step) -> Option<String> {
    if let Some(ref command) = step.apply_override {
        return Some(command.clone());
    }
    match &step.action {
        Action::Package { name, manager } => {
            let name = shell_quote(name);
            Some(match manager {
                PackageManager::Apt => {
                    format!("sudo DEBIAN_FRONTEND=noninteractive apt-get install -y {name}")
                }
                PackageManager::Pacman => {
                    format!("sudo pacman -S --needed --noconfirm {name}")
                }
                PackageManager::Snap => format!("sudo snap install {name}"),
            })
        }
        Action::Service { unit, user } => {
            let unit = shell_quote(unit);
            Some(if *user {
                format!("systemctl --user enable --now {unit}")
            } else {
                format!("sudo systemctl enable --now {unit}")
            })
        }
        Action::Command { apply, .. } => Some(apply.clone()),
        Action::File { .. } => None,
    }
}

/// Write a file step's declared content, creating parent directories.
fn apply_file(path: &std::path::Path, content: &str) -> Result<(), StepError> {
    let io_err = |e: std::io::Error| StepError::Apply {
        code: -1,
        stdout: String::new(),
        stderr: format!("cannot write {}: {e}", path.display()),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, content).map_err(io_err)
}

/// Apply `step`'s action.
///
/// # Errors
///
/// Returns [`StepError::Apply`] with captured output on non-zero exit (or
/// write failure) and [`StepError::ApplyTimeout`] when the subprocess
/// exceeds `timeout` and is killed. The caller re-probes after any failure
/// before declaring the step failed.
pub fn apply(step: &Step, executor: &dyn Executor, timeout: Duration) -> Result<(), StepError> {
    let Some(command) = default_apply_command(step) else {
        // Native file write.
        if let Action::File { path, content } = &step.action {
            return apply_file(path, content);
        }
        return Ok(());
    };

    let timeout = step.apply_timeout.unwrap_or(timeout);
    let outcome = executor
        .run_shell(&command, Some(timeout))
        .map_err(|e| StepError::Apply {
            code: -1,
            stdout: String::new(),
            stderr: format!("{e:#}"),
        })?;

    match outcome {
        ExecOutcome::Completed(result) if result.success => Ok(()),
        ExecOutcome::Completed(result) => Err(StepError::Apply {
            code: result.code.unwrap_or(-1),
            stdout: result.stdout,
            stderr: result.stderr,
        }),
        ExecOutcome::TimedOut => Err(StepError::ApplyTimeout(timeout)),
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

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn spec(classification: Classification) -> StepSpec {
        StepSpec {
            id: "s".to_string(),
            label: "s".to_string(),
            classification,
            prerequisites: vec![],
            probe: ProbeSpec::default(),
            apply: ApplySpec::default(),
            timeout_secs: None,
        }
    }

    fn apt_step(name: &str) -> Step {
        let mut s = spec(Classification::Package);
        s.probe.package = Some(name.to_string());
        Step::from_spec(s).unwrap()
    }

    // -----------------------------------------------------------------------
    // default_apply_command
    // -----------------------------------------------------------------------

    #[test]
    fn apt_install_command() {
        let cmd = default_apply_command(&apt_step("git")).unwrap();
        assert_eq!(
            cmd,
            "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y 'git'"
        );
    }

    #[test]
    fn pacman_install_uses_needed_noconfirm() {
        let mut s = spec(Classification::Package);
        s.probe.package = Some("git".to_string());
        s.probe.manager = Some(PackageManager::Pacman);
        let cmd = default_apply_command(&Step::from_spec(s).unwrap()).unwrap();
        assert_eq!(cmd, "sudo pacman -S --needed --noconfirm 'git'");
    }

    #[test]
    fn service_enable_now_with_scope() {
        let mut s = spec(Classification::Service);
        s.probe.unit = Some("apache2".to_string());
        let cmd = default_apply_command(&Step::from_spec(s.clone()).unwrap()).unwrap();
        assert_eq!(cmd, "sudo systemctl enable --now 'apache2'");

        s.probe.user = Some(true);
        let cmd = default_apply_command(&Step::from_spec(s).unwrap()).unwrap();
        assert_eq!(cmd, "systemctl --user enable --now 'apache2'");
    }

    #[test]
    fn apply_override_replaces_default() {
        let mut s = spec(Classification::Package);
        s.probe.package = Some("docker-ce".to_string());
        s.apply.command = Some("sh /tmp/get-docker.sh".to_string());
        let cmd = default_apply_command(&Step::from_spec(s).unwrap()).unwrap();
        assert_eq!(cmd, "sh /tmp/get-docker.sh");
    }

    #[test]
    fn file_step_has_no_subprocess_command() {
        let mut s = spec(Classification::File);
        s.probe.path = Some(std::path::PathBuf::from("/tmp/x"));
        s.probe.content = Some("x".to_string());
        assert!(default_apply_command(&Step::from_spec(s).unwrap()).is_none());
    }

    // -----------------------------------------------------------------------
    // apply
    // -----------------------------------------------------------------------

    #[test]
    fn successful_apply_returns_ok() {
        let executor = ScriptedExecutor::ok("");
        apply(&apt_step("git"), &executor, TIMEOUT).unwrap();
        assert_eq!(executor.recorded_calls().len(), 1);
    }

    #[test]
    fn nonzero_exit_carries_captured_output() {
        let executor = ScriptedExecutor::exit(100, "E: Unable to locate package gti");
        let err = apply(&apt_step("gti"), &executor, TIMEOUT).unwrap_err();
        match err {
            StepError::Apply { code, stderr, .. } => {
                assert_eq!(code, 100);
                assert!(stderr.contains("Unable to locate package"));
            }
            other => panic!("expected Apply, got: {other}"),
        }
    }

    #[test]
    fn timeout_maps_to_apply_timeout() {
        let executor = ScriptedExecutor::with_responses(vec![Response::TimedOut]);
        let err = apply(&apt_step("git"), &executor, TIMEOUT).unwrap_err();
        assert!(matches!(err, StepError::ApplyTimeout(_)));
    }

    #[test]
    fn per_step_timeout_override_is_used() {
        let mut s = spec(Classification::Package);
        s.probe.package = Some("git".to_string());
        s.timeout_secs = Some(7);
        let step = Step::from_spec(s).unwrap();
        let executor = ScriptedExecutor::with_responses(vec![Response::TimedOut]);
        let err = apply(&step, &executor, TIMEOUT).unwrap_err();
        match err {
            StepError::ApplyTimeout(t) => assert_eq!(t, Duration::from_secs(7)),
            other => panic!("expected ApplyTimeout, got: {other}"),
        }
    }

    #[test]
    fn file_apply_writes_content_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/profile.toml");
        let mut s = spec(Classification::File);
        s.probe.path = Some(path.clone());
        s.probe.content = Some("key = 1\n".to_string());
        let step = Step::from_spec(s).unwrap();

        let executor = ScriptedExecutor::default();
        apply(&step, &executor, TIMEOUT).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "key = 1\n");
        assert!(executor.recorded_calls().is_empty());
    }

    #[test]
    fn file_apply_into_unwritable_dir_is_apply_error() {
        let mut s = spec(Classification::File);
        s.probe.path = Some(std::path::PathBuf::from("/proc/converge-test/file"));
        s.probe.content = Some("x".to_string());
        let step = Step::from_spec(s).unwrap();
        let err = apply(&step, &ScriptedExecutor::default(), TIMEOUT).unwrap_err();
        assert!(matches!(err, StepError::Apply { .. }));
    }
}
