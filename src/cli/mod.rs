//! Command-line interface for clusterforge.
//!
//! Provides the cluster-oriented task-script surface: start, stop, status,
//! and restart.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
