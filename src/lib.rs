//! Idempotent, declarative environment provisioning engine.
//!
//! A plan file declares the desired end state of a machine as a set of
//! steps — packages installed, services running, files present, arbitrary
//! conditions holding. Each step pairs a side-effect-free probe with an
//! idempotent apply; the engine probes first, applies only what is missing,
//! and re-probes to confirm convergence. Running the same plan twice changes
//! nothing the second time.
//!
//! The API is organised into five layers:
//!
//! - **[`plan`]** — parse, validate, and dependency-order step declarations
//! - **[`probe`] / [`apply`]** — per-classification check and converge primitives
//! - **[`engine`]** — parallel reconciliation with retries, timeouts, and cancellation
//! - **[`report`]** — per-step outcomes, aggregate status, exit codes
//! - **[`commands`]** — top-level subcommand orchestration (`run`, `check`)

pub mod apply;
pub mod cli;
pub mod commands;
pub mod engine;
pub mod error;
pub mod exec;
pub mod logging;
pub mod plan;
pub mod probe;
pub mod report;
