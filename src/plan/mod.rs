//! Declarative plan input: step descriptors and the validated, ordered plan.
//!
//! A plan file is a TOML document containing `[[step]]` records. Each record
//! is deserialized into a raw [`StepSpec`], validated into a typed [`Step`]
//! (classification-specific fields are checked at load time), and ordered
//! topologically by [`graph::topological_order`]. Construction failures are
//! [`PlanError`]s and abort the run before any side effect occurs.

pub mod graph;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::PlanError;

/// What kind of system state a step manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// An OS package that must be installed.
    Package,
    /// A service-manager unit that must be active.
    Service,
    /// A file that must exist with specific content.
    File,
    /// An arbitrary idempotent check/apply command pair.
    Command,
}

impl Classification {
    /// Whether apply failures for this classification are treated as
    /// transient (network-backed fetches) and retried.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Package)
    }

    /// Named mutual-exclusion token serializing steps of this classification,
    /// if they share an external resource.
    ///
    /// Only one package step may touch the OS package database at a time,
    /// regardless of graph concurrency.
    #[must_use]
    pub const fn resource_token(self) -> Option<&'static str> {
        match self {
            Self::Package => Some("package-db"),
            Self::Service | Self::File | Self::Command => None,
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Package => write!(f, "package"),
            Self::Service => write!(f, "service"),
            Self::File => write!(f, "file"),
            Self::Command => write!(f, "command"),
        }
    }
}

/// Supported OS package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// Debian/Ubuntu packages (apt / dpkg).
    #[default]
    Apt,
    /// Arch Linux packages (pacman).
    Pacman,
    /// Snap packages (snapd).
    Snap,
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apt => write!(f, "apt"),
            Self::Pacman => write!(f, "pacman"),
            Self::Snap => write!(f, "snap"),
        }
    }
}

/// Raw probe fields as they appear in the plan file.
///
/// Which fields are required depends on the step's classification; the
/// combination is validated by [`Step::from_spec`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeSpec {
    /// Package name to query (package classification).
    pub package: Option<String>,
    /// Package manager to query with (defaults to apt).
    pub manager: Option<PackageManager>,
    /// Service unit name (service classification).
    pub unit: Option<String>,
    /// Query the user-scope service manager instead of the system one.
    pub user: Option<bool>,
    /// Target file path (file classification).
    pub path: Option<PathBuf>,
    /// Expected file content (file classification).
    pub content: Option<String>,
    /// Idempotent check command; exit 0 means satisfied (command
    /// classification).
    pub check: Option<String>,
    /// Check-command exit code that means "satisfied, but only after a new
    /// login session" (e.g. group membership).
    pub relogin_exit: Option<i32>,
}

/// Raw apply fields as they appear in the plan file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplySpec {
    /// Apply command. Required for command steps; for other classifications
    /// it overrides the default action derived from the probe fields.
    pub command: Option<String>,
}

/// One raw `[[step]]` record from a plan file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    /// Unique step identifier.
    pub id: String,
    /// Human-readable label for logs and reports.
    pub label: String,
    /// What kind of state this step manages.
    pub classification: Classification,
    /// Ids of steps that must reach a successful terminal state first.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Probe description.
    #[serde(default)]
    pub probe: ProbeSpec,
    /// Apply description.
    #[serde(default)]
    pub apply: ApplySpec,
    /// Per-step apply timeout override, in seconds.
    pub timeout_secs: Option<u64>,
}

/// Typed, validated action for a step.
#[derive(Debug, Clone)]
pub enum Action {
    /// Ensure a package is installed.
    Package {
        /// Package name.
        name: String,
        /// Package manager to use.
        manager: PackageManager,
    },
    /// Ensure a service unit is active.
    Service {
        /// Unit name (e.g. `apache2.service`).
        unit: String,
        /// Use the user-scope service manager.
        user: bool,
    },
    /// Ensure a file exists with exactly the given content.
    File {
        /// Target path.
        path: PathBuf,
        /// Desired content.
        content: String,
    },
    /// Run a user-supplied check/apply command pair.
    Command {
        /// Idempotent check command; exit 0 means satisfied.
        check: String,
        /// Command that drives the state toward satisfaction.
        apply: String,
        /// Check exit code mapped to the requires-relogin outcome.
        relogin_exit: Option<i32>,
    },
}

/// A validated step: one declared unit of desired system state.
///
/// Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique step identifier.
    pub id: String,
    /// Human-readable label.
    pub label: String,
    /// Classification of the managed state.
    pub classification: Classification,
    /// Ids of prerequisite steps.
    pub prerequisites: Vec<String>,
    /// The typed probe/apply action.
    pub action: Action,
    /// Apply command override for non-command classifications.
    pub apply_override: Option<String>,
    /// Per-step apply timeout override.
    pub apply_timeout: Option<Duration>,
}

impl Step {
    /// Validate a raw [`StepSpec`] into a typed step.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InvalidStep`] when the probe/apply fields do not
    /// match the declared classification.
    pub fn from_spec(spec: StepSpec) -> Result<Self, PlanError> {
        let invalid = |message: &str| PlanError::InvalidStep {
            step: spec.id.clone(),
            message: message.to_string(),
        };

        if spec.id.trim().is_empty() {
            return Err(PlanError::InvalidStep {
                step: "<unnamed>".to_string(),
                message: "step id must not be empty".to_string(),
            });
        }

        let action = match spec.classification {
            Classification::Package => Action::Package {
                name: spec
                    .probe
                    .package
                    .clone()
                    .ok_or_else(|| invalid("package classification requires probe.package"))?,
                manager: spec.probe.manager.unwrap_or_default(),
            },
            Classification::Service => Action::Service {
                unit: spec
                    .probe
                    .unit
                    .clone()
                    .ok_or_else(|| invalid("service classification requires probe.unit"))?,
                user: spec.probe.user.unwrap_or(false),
            },
            Classification::File => Action::File {
                path: spec
                    .probe
                    .path
                    .clone()
                    .ok_or_else(|| invalid("file classification requires probe.path"))?,
                content: spec
                    .probe
                    .content
                    .clone()
                    .ok_or_else(|| invalid("file classification requires probe.content"))?,
            },
            Classification::Command => Action::Command {
                check: spec
                    .probe
                    .check
                    .clone()
                    .ok_or_else(|| invalid("command classification requires probe.check"))?,
                apply: spec
                    .apply
                    .command
                    .clone()
                    .ok_or_else(|| invalid("command classification requires apply.command"))?,
                relogin_exit: spec.probe.relogin_exit,
            },
        };

        let apply_override = match spec.classification {
            Classification::Command => None,
            _ => spec.apply.command,
        };

        Ok(Self {
            id: spec.id,
            label: spec.label,
            classification: spec.classification,
            prerequisites: spec.prerequisites,
            action,
            apply_override,
            apply_timeout: spec.timeout_secs.map(Duration::from_secs),
        })
    }
}

/// Top-level plan file document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    #[serde(default, rename = "step")]
    steps: Vec<StepSpec>,
}

/// A topologically ordered sequence of validated steps.
///
/// Invariant: every step's prerequisites appear earlier in `steps`, and the
/// order among independent steps follows declaration order, so re-runs
/// produce identical execution order.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

impl Plan {
    /// Load and validate a plan from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a [`PlanError`] if the file cannot be read or parsed, a step
    /// is malformed, ids collide, a prerequisite is unknown, or the
    /// dependency graph contains a cycle.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: PlanFile = toml::from_str(&content).map_err(|e| PlanError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_specs(file.steps)
    }

    /// Validate raw step records and order them topologically.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Plan::load`], minus file I/O.
    pub fn from_specs(specs: Vec<StepSpec>) -> Result<Self, PlanError> {
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.id.clone()) {
                return Err(PlanError::DuplicateStep(spec.id.clone()));
            }
        }

        let steps: Vec<Step> = specs
            .into_iter()
            .map(Step::from_spec)
            .collect::<Result<_, _>>()?;

        let order = graph::topological_order(&steps)?;
        let mut by_index: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
        let steps = order
            .into_iter()
            .filter_map(|i| by_index.get_mut(i).and_then(Option::take))
            .collect();

        Ok(Self { steps })
    }

    /// Restrict the plan to the named steps plus their prerequisite closure.
    ///
    /// Keeping prerequisites preserves the plan invariant — running a step
    /// without its declared prerequisites would silently drop the ordering
    /// guarantees the ids encode.
    #[must_use]
    pub fn only(mut self, ids: &[String]) -> Self {
        if ids.is_empty() {
            return self;
        }
        let mut keep: HashSet<String> = ids.iter().cloned().collect();
        // Steps are topologically ordered, so one reverse sweep closes over
        // all transitive prerequisites.
        for step in self.steps.iter().rev() {
            if keep.contains(&step.id) {
                keep.extend(step.prerequisites.iter().cloned());
            }
        }
        self.steps.retain(|s| keep.contains(&s.id));
        self
    }

    /// Drop the named steps from the plan.
    ///
    /// Dependents of a dropped step keep their prerequisite declaration; the
    /// engine will skip them, mirroring a failed prerequisite.
    #[must_use]
    pub fn skip(mut self, ids: &[String]) -> Self {
        if ids.is_empty() {
            return self;
        }
        let drop: HashSet<&String> = ids.iter().collect();
        self.steps.retain(|s| !drop.contains(&s.id));
        self
    }

    /// Look up a step by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
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

    fn command_spec(id: &str, prerequisites: &[&str]) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            label: format!("step {id}"),
            classification: Classification::Command,
            prerequisites: prerequisites.iter().map(ToString::to_string).collect(),
            probe: ProbeSpec {
                check: Some("true".to_string()),
                ..ProbeSpec::default()
            },
            apply: ApplySpec {
                command: Some("true".to_string()),
            },
            timeout_secs: None,
        }
    }

    // -----------------------------------------------------------------------
    // Step validation
    // -----------------------------------------------------------------------

    #[test]
    fn package_step_requires_package_name() {
        let spec = StepSpec {
            id: "git".to_string(),
            label: "Install git".to_string(),
            classification: Classification::Package,
            prerequisites: vec![],
            probe: ProbeSpec::default(),
            apply: ApplySpec::default(),
            timeout_secs: None,
        };
        let err = Step::from_spec(spec).unwrap_err();
        assert!(err.to_string().contains("probe.package"));
    }

    #[test]
    fn command_step_requires_check_and_apply() {
        let mut spec = command_spec("x", &[]);
        spec.probe.check = None;
        let err = Step::from_spec(spec).unwrap_err();
        assert!(err.to_string().contains("probe.check"));

        let mut spec = command_spec("x", &[]);
        spec.apply.command = None;
        let err = Step::from_spec(spec).unwrap_err();
        assert!(err.to_string().contains("apply.command"));
    }

    #[test]
    fn file_step_requires_path_and_content() {
        let spec = StepSpec {
            id: "motd".to_string(),
            label: "Write motd".to_string(),
            classification: Classification::File,
            prerequisites: vec![],
            probe: ProbeSpec {
                path: Some(PathBuf::from("/etc/motd")),
                ..ProbeSpec::default()
            },
            apply: ApplySpec::default(),
            timeout_secs: None,
        };
        let err = Step::from_spec(spec).unwrap_err();
        assert!(err.to_string().contains("probe.content"));
    }

    #[test]
    fn package_manager_defaults_to_apt() {
        let spec = StepSpec {
            id: "git".to_string(),
            label: "Install git".to_string(),
            classification: Classification::Package,
            prerequisites: vec![],
            probe: ProbeSpec {
                package: Some("git".to_string()),
                ..ProbeSpec::default()
            },
            apply: ApplySpec::default(),
            timeout_secs: None,
        };
        let step = Step::from_spec(spec).unwrap();
        match step.action {
            Action::Package { manager, .. } => assert_eq!(manager, PackageManager::Apt),
            _ => panic!("expected package action"),
        }
    }

    #[test]
    fn empty_step_id_is_rejected() {
        let mut spec = command_spec("x", &[]);
        spec.id = "  ".to_string();
        assert!(Step::from_spec(spec).is_err());
    }

    // -----------------------------------------------------------------------
    // Plan construction
    // -----------------------------------------------------------------------

    #[test]
    fn duplicate_ids_are_rejected() {
        let err =
            Plan::from_specs(vec![command_spec("a", &[]), command_spec("a", &[])]).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateStep(ref id) if id == "a"));
    }

    #[test]
    fn declaration_order_is_preserved_for_independent_steps() {
        let plan = Plan::from_specs(vec![
            command_spec("c", &[]),
            command_spec("a", &[]),
            command_spec("b", &[]),
        ])
        .unwrap();
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn prerequisites_order_before_dependents() {
        let plan = Plan::from_specs(vec![
            command_spec("b", &["a"]),
            command_spec("c", &["b"]),
            command_spec("a", &[]),
        ])
        .unwrap();
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let err =
            Plan::from_specs(vec![command_spec("a", &["b"]), command_spec("b", &["a"])])
                .unwrap_err();
        assert!(matches!(err, PlanError::Cycle { .. }), "got: {err}");
    }

    #[test]
    fn unknown_prerequisite_is_rejected() {
        let err = Plan::from_specs(vec![command_spec("a", &["ghost"])]).unwrap_err();
        match err {
            PlanError::UnknownDependency { step, dependency } => {
                assert_eq!(step, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected UnknownDependency, got: {other}"),
        }
    }

    // -----------------------------------------------------------------------
    // only / skip filters
    // -----------------------------------------------------------------------

    #[test]
    fn only_keeps_prerequisite_closure() {
        let plan = Plan::from_specs(vec![
            command_spec("a", &[]),
            command_spec("b", &["a"]),
            command_spec("c", &["b"]),
            command_spec("d", &[]),
        ])
        .unwrap()
        .only(&["c".to_string()]);
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn skip_drops_named_steps() {
        let plan = Plan::from_specs(vec![
            command_spec("a", &[]),
            command_spec("b", &[]),
            command_spec("c", &[]),
        ])
        .unwrap()
        .skip(&["b".to_string()]);
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    // -----------------------------------------------------------------------
    // TOML parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parse_full_plan_document() {
        let doc = r#"
            [[step]]
            id = "git"
            label = "Install Git"
            classification = "package"
            [step.probe]
            package = "git"
            manager = "apt"

            [[step]]
            id = "apache"
            label = "Apache running"
            classification = "service"
            prerequisites = ["git"]
            [step.probe]
            unit = "apache2"
        "#;
        let file: PlanFile = toml::from_str(doc).unwrap();
        let plan = Plan::from_specs(file.steps).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].id, "git");
        assert_eq!(plan.steps[1].prerequisites, vec!["git".to_string()]);
    }

    #[test]
    fn unknown_toml_field_is_a_parse_error() {
        let doc = r#"
            [[step]]
            id = "x"
            label = "x"
            classification = "command"
            not_a_field = true
        "#;
        assert!(toml::from_str::<PlanFile>(doc).is_err());
    }

    // -----------------------------------------------------------------------
    // Classification helpers
    // -----------------------------------------------------------------------

    #[test]
    fn only_package_classification_is_transient() {
        assert!(Classification::Package.is_transient());
        assert!(!Classification::Service.is_transient());
        assert!(!Classification::File.is_transient());
        assert!(!Classification::Command.is_transient());
    }

    #[test]
    fn package_classification_serializes_on_package_db_token() {
        assert_eq!(Classification::Package.resource_token(), Some("package-db"));
        assert_eq!(Classification::Command.resource_token(), None);
    }
}
