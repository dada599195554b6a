use clap::{Parser, Subcommand};

/// Top-level CLI entry point for the convergence engine.
#[derive(Parser, Debug)]
#[command(
    name = "converge",
    about = "Idempotent, declarative environment provisioning",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reconcile the plan against the current machine state
    Run(RunOpts),
    /// Validate a plan without executing anything
    Check(CheckOpts),
    /// Print version information
    Version,
}

/// Options for the `run` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct RunOpts {
    /// Path to the plan file
    #[arg(long, default_value = "plan.toml")]
    pub plan: std::path::PathBuf,

    /// Maximum number of steps executing concurrently
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Probe and report without applying anything
    #[arg(short = 'd', long)]
    pub dry_run: bool,

    /// Run only these steps (plus their prerequisites)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Skip these steps
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Emit the report as JSON instead of the human summary
    #[arg(long)]
    pub json: bool,
}

/// Options for the `check` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct CheckOpts {
    /// Path to the plan file
    #[arg(long, default_value = "plan.toml")]
    pub plan: std::path::PathBuf,
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["converge", "run"]);
        match cli.command {
            Command::Run(opts) => {
                assert_eq!(opts.plan, std::path::PathBuf::from("plan.toml"));
                assert_eq!(opts.concurrency, None);
                assert!(!opts.dry_run);
                assert!(opts.only.is_empty());
                assert!(opts.skip.is_empty());
                assert!(!opts.json);
            }
            other => panic!("expected Run, got: {other:?}"),
        }
    }

    #[test]
    fn parse_run_with_plan_path() {
        let cli = Cli::parse_from(["converge", "run", "--plan", "/etc/converge/dev.toml"]);
        if let Command::Run(opts) = cli.command {
            assert_eq!(
                opts.plan,
                std::path::PathBuf::from("/etc/converge/dev.toml")
            );
        } else {
            panic!("expected Run command");
        }
    }

    #[test]
    fn parse_run_concurrency() {
        let cli = Cli::parse_from(["converge", "run", "--concurrency", "2"]);
        if let Command::Run(opts) = cli.command {
            assert_eq!(opts.concurrency, Some(2));
        } else {
            panic!("expected Run command");
        }
    }

    #[test]
    fn parse_run_dry_run_short() {
        let cli = Cli::parse_from(["converge", "-v", "run", "-d"]);
        assert!(cli.verbose);
        if let Command::Run(opts) = cli.command {
            assert!(opts.dry_run);
        } else {
            panic!("expected Run command");
        }
    }

    #[test]
    fn parse_run_only_comma_separated() {
        let cli = Cli::parse_from(["converge", "run", "--only", "git,docker"]);
        if let Command::Run(opts) = cli.command {
            assert_eq!(opts.only, vec!["git", "docker"]);
        } else {
            panic!("expected Run command");
        }
    }

    #[test]
    fn parse_run_skip_comma_separated() {
        let cli = Cli::parse_from(["converge", "run", "--skip", "fonts,themes"]);
        if let Command::Run(opts) = cli.command {
            assert_eq!(opts.skip, vec!["fonts", "themes"]);
        } else {
            panic!("expected Run command");
        }
    }

    #[test]
    fn parse_check() {
        let cli = Cli::parse_from(["converge", "check", "--plan", "plan.toml"]);
        assert!(matches!(cli.command, Command::Check(_)));
    }

    #[test]
    fn parse_version() {
        let cli = Cli::parse_from(["converge", "version"]);
        assert!(matches!(cli.command, Command::Version));
    }
}
