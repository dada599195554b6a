//! Domain-specific error types for the provisioning engine.
//!
//! This module provides a structured error hierarchy using [`thiserror`].
//! Plan construction returns [`PlanError`] (always fatal — nothing executes);
//! step reconciliation returns [`StepError`], some variants of which are
//! retryable. Command handlers at the CLI boundary convert both to
//! [`anyhow::Error`] via the standard `?` operator.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that prevent a plan from being constructed.
///
/// Any `PlanError` aborts the run before any step executes, so an invalid
/// plan can never cause partial application.
#[derive(Error, Debug)]
pub enum PlanError {
    /// The step dependency graph contains a cycle.
    #[error("dependency cycle detected: {path}")]
    Cycle {
        /// Human-readable cycle path (e.g. `a -> b -> a`).
        path: String,
    },

    /// A step names a prerequisite that is not declared in the plan.
    #[error("step '{step}' requires unknown step '{dependency}'")]
    UnknownDependency {
        /// Id of the step with the dangling reference.
        step: String,
        /// The missing prerequisite id.
        dependency: String,
    },

    /// Two steps share the same id.
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    /// A step definition is malformed for its classification.
    #[error("invalid step '{step}': {message}")]
    InvalidStep {
        /// Id of the malformed step.
        step: String,
        /// What is wrong with it.
        message: String,
    },

    /// The plan file could not be read.
    #[error("failed to read plan file {path}: {source}")]
    Read {
        /// Path to the plan file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The plan file is not valid TOML.
    #[error("failed to parse plan file {path}: {message}")]
    Parse {
        /// Path to the plan file.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },
}

/// Errors that arise while reconciling a single step.
#[derive(Error, Debug)]
pub enum StepError {
    /// The probe could not determine the current state (environment error,
    /// e.g. a locked package database). Retryable.
    #[error("probe failed: {0}")]
    Probe(String),

    /// The probe exceeded its time budget. Retryable.
    #[error("probe timed out after {0:?}")]
    ProbeTimeout(std::time::Duration),

    /// A tool the step depends on (package manager, service manager) is not
    /// installed. Not retryable — waiting will not make it appear.
    #[error("required tool '{0}' not found on PATH")]
    MissingTool(String),

    /// The apply command exited non-zero. Carries the captured output.
    #[error("apply failed (exit {code}): {stderr}")]
    Apply {
        /// Exit code reported by the subprocess (`-1` if killed by signal).
        code: i32,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The apply subprocess exceeded its time budget and was killed.
    /// Retryable.
    #[error("apply timed out after {0:?}")]
    ApplyTimeout(std::time::Duration),

    /// The run was cancelled before this step finished.
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether the reconciliation loop may retry after this error.
    ///
    /// Probe and timeout failures are environmental and always retryable.
    /// Apply failures are only retried for transient step classifications
    /// (network-backed package fetches) — that policy lives in the engine,
    /// which combines this flag with the step's classification.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Probe(_) | Self::ProbeTimeout(_) | Self::ApplyTimeout(_)
        )
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    // -----------------------------------------------------------------------
    // PlanError
    // -----------------------------------------------------------------------

    #[test]
    fn plan_error_cycle_display() {
        let e = PlanError::Cycle {
            path: "a -> b -> a".to_string(),
        };
        assert_eq!(e.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn plan_error_unknown_dependency_display() {
        let e = PlanError::UnknownDependency {
            step: "docker-group".to_string(),
            dependency: "docker".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "step 'docker-group' requires unknown step 'docker'"
        );
    }

    #[test]
    fn plan_error_duplicate_step_display() {
        let e = PlanError::DuplicateStep("git".to_string());
        assert_eq!(e.to_string(), "duplicate step id 'git'");
    }

    #[test]
    fn plan_error_invalid_step_display() {
        let e = PlanError::InvalidStep {
            step: "apache".to_string(),
            message: "service classification requires probe.unit".to_string(),
        };
        assert!(e.to_string().contains("invalid step 'apache'"));
        assert!(e.to_string().contains("probe.unit"));
    }

    #[test]
    fn plan_error_read_has_source() {
        use std::error::Error as _;
        let e = PlanError::Read {
            path: PathBuf::from("/plans/dev.toml"),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert!(e.to_string().contains("/plans/dev.toml"));
        assert!(e.source().is_some());
    }

    // -----------------------------------------------------------------------
    // StepError
    // -----------------------------------------------------------------------

    #[test]
    fn step_error_apply_display_includes_code_and_stderr() {
        let e = StepError::Apply {
            code: 100,
            stdout: String::new(),
            stderr: "E: Unable to locate package".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "apply failed (exit 100): E: Unable to locate package"
        );
    }

    #[test]
    fn probe_and_timeout_errors_are_retryable() {
        assert!(StepError::Probe("db locked".to_string()).is_retryable());
        assert!(StepError::ProbeTimeout(Duration::from_secs(30)).is_retryable());
        assert!(StepError::ApplyTimeout(Duration::from_secs(600)).is_retryable());
    }

    #[test]
    fn apply_and_cancelled_errors_are_not_retryable() {
        let apply = StepError::Apply {
            code: 1,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(!apply.is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
    }

    #[test]
    fn missing_tool_is_terminal_and_names_the_tool() {
        let e = StepError::MissingTool("pacman".to_string());
        assert!(!e.is_retryable());
        assert_eq!(e.to_string(), "required tool 'pacman' not found on PATH");
    }

    // -----------------------------------------------------------------------
    // Bounds and conversions
    // -----------------------------------------------------------------------

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn error_types_are_send_sync() {
        assert_send_sync::<PlanError>();
        assert_send_sync::<StepError>();
    }

    #[test]
    fn errors_convert_to_anyhow() {
        let _e: anyhow::Error = PlanError::DuplicateStep("x".to_string()).into();
        let _e: anyhow::Error = StepError::Cancelled.into();
    }
}
