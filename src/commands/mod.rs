//! Top-level subcommand orchestration.

pub mod check;
pub mod run;
pub mod version;
