//! CLI module for the Converge deployment engine.
//!
//! This module provides the command-line interface for validating
//! configuration, previewing plans and managing snapshots.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
