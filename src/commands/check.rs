//! Command: validate a plan without executing anything.

use anyhow::{Context as _, Result};

use crate::cli::CheckOpts;
use crate::logging;
use crate::plan::Plan;
use crate::report::RunStatus;

/// Run the `check` subcommand.
///
/// Loads and validates the plan (parse, duplicate ids, unknown
/// prerequisites, cycles) and prints the resolved execution order. No probe
/// or apply runs.
pub fn run(opts: &CheckOpts) -> RunStatus {
    match execute(opts) {
        Ok(()) => RunStatus::Success,
        Err(e) => {
            tracing::error!("{e:#}");
            RunStatus::Fatal
        }
    }
}

fn execute(opts: &CheckOpts) -> Result<()> {
    logging::stage("Validating plan");
    let plan = Plan::load(&opts.plan)
        .with_context(|| format!("invalid plan: {}", opts.plan.display()))?;

    tracing::info!("{} steps, execution order:", plan.steps.len());
    for step in &plan.steps {
        if step.prerequisites.is_empty() {
            tracing::info!("  {}", step.id);
        } else {
            tracing::info!("  {} (after {})", step.id, step.prerequisites.join(", "));
        }
    }
    Ok(())
}
