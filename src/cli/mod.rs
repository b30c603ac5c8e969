//! Command-line interface for scan-coordinator.
//!
//! Provides the coordinator daemon plus task, execution and settings
//! management commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
