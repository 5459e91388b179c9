//! Command-line interface for xtraplatform-jobs.
//!
//! Provides commands for inspecting queue status, pushing jobs, clearing
//! failed jobs, sweeping orphans, and exporting metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
