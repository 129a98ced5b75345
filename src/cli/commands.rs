//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Converge - Plan infrastructure changes from a desired state and a snapshot.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration, and a manifest when one is given.
    Validate {
        /// Manifest whose resources are decoded against their schemas.
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute the plan for a manifest without changing anything.
    Plan {
        /// Manifest listing the desired resources.
        #[arg(short, long)]
        manifest: PathBuf,

        /// Show both halves of each replacement instead of one line.
        #[arg(long)]
        show_replace_steps: bool,

        /// Show changed properties for each step.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Inspect or manage the snapshot.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// Snapshot management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the current snapshot.
    Show,

    /// Lock the snapshot.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the snapshot.
    Unlock {
        /// Lock ID to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Remove the lock regardless of who holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_plan() {
        let cli = Cli::try_parse_from([
            "converge",
            "--output",
            "json",
            "plan",
            "--manifest",
            "stack.yaml",
            "--show-replace-steps",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        let Commands::Plan {
            manifest,
            show_replace_steps,
            detailed,
        } = cli.command
        else {
            panic!("expected plan command");
        };
        assert_eq!(manifest, PathBuf::from("stack.yaml"));
        assert!(show_replace_steps);
        assert!(!detailed);
    }

    #[test]
    fn test_plan_requires_manifest() {
        assert!(Cli::try_parse_from(["converge", "plan"]).is_err());
    }
}
