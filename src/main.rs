use std::process::ExitCode;

use clap::Parser;

use converge_cli::report::RunStatus;
use converge_cli::{cli, commands, logging};

fn main() -> ExitCode {
    let args = cli::Cli::parse();
    logging::init_subscriber(args.verbose);

    let status = match args.command {
        cli::Command::Run(opts) => commands::run::run(&opts),
        cli::Command::Check(opts) => commands::check::run(&opts),
        cli::Command::Version => {
            commands::version::run();
            RunStatus::Success
        }
    };

    ExitCode::from(status.exit_code())
}
