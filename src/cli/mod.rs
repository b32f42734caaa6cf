//! Command-line interface for debt-forge.
//!
//! Provides the HTTP service, standalone workers, offline analysis and
//! database and queue maintenance commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
