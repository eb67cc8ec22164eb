//! Command-line interface for shard-launch.
//!
//! Provides commands for planning, submitting, watching and cancelling
//! sharded cluster jobs.

mod commands;

pub use commands::{exit_code_for, parse_cli, run, run_with_cli, Cli};
