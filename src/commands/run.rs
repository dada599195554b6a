//! Command: reconcile a plan against the current machine state.

use anyhow::{Context as _, Result};

use crate::cli::RunOpts;
use crate::engine::cancel::{install_signal_handler, CancelToken};
use crate::engine::{Engine, EngineOpts};
use crate::exec::SystemExecutor;
use crate::logging;
use crate::plan::Plan;
use crate::report::RunStatus;

/// Run the `run` subcommand, returning the status that decides the process
/// exit code. Plan construction failures are fatal; step failures during
/// reconciliation are reported per step and surface as a partial failure.
pub fn run(opts: &RunOpts) -> RunStatus {
    match execute(opts) {
        Ok(status) => status,
        Err(e) => {
            tracing::error!("{e:#}");
            RunStatus::Fatal
        }
    }
}

fn execute(opts: &RunOpts) -> Result<RunStatus> {
    logging::stage("Loading plan");
    let mut plan = Plan::load(&opts.plan)
        .with_context(|| format!("invalid plan: {}", opts.plan.display()))?;
    tracing::info!("{}: {} steps", opts.plan.display(), plan.steps.len());

    if !opts.only.is_empty() {
        plan = plan.only(&opts.only);
        tracing::info!(
            "restricted to {} steps (selection plus prerequisites)",
            plan.steps.len()
        );
    }
    if !opts.skip.is_empty() {
        plan = plan.skip(&opts.skip);
    }

    let cancel = CancelToken::new();
    install_signal_handler(&cancel)?;

    let engine_opts = EngineOpts {
        concurrency: opts.concurrency.unwrap_or_else(|| EngineOpts::default().concurrency),
        dry_run: opts.dry_run,
        ..EngineOpts::default()
    };

    if opts.dry_run {
        logging::stage("Reconciling (dry run)");
    } else {
        logging::stage("Reconciling");
    }
    let executor = SystemExecutor;
    let report = Engine::new(&executor, engine_opts, cancel).run(&plan);

    if opts.json {
        println!("{}", report.to_json()?);
    } else {
        report.print_summary();
    }
    Ok(report.status)
}
