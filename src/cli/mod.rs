//! Command-line interface for collection-watcher.
//!
//! This module provides CLI commands for scanning collection roots into the
//! SQLite store, watching them for changes and listing what is stored.

mod commands;

pub use commands::{Cli, Commands, run_command};
