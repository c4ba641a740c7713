//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Converge - declarative resource reconciliation.
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

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and build the resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the plan.
    Plan {
        /// Save the plan to a file for a later `apply`.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Refresh recorded objects before planning.
        #[arg(long)]
        refresh: bool,

        /// Plan the destruction of every recorded resource.
        #[arg(long)]
        destroy: bool,
    },

    /// Apply the configuration, or a saved plan.
    Apply {
        /// Saved plan file (computes a fresh plan if omitted).
        plan_file: Option<PathBuf>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Destroy every recorded resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Check for drift between configuration, state and live objects.
    Drift,

    /// Show published outputs.
    Outputs {
        /// Read another run's outputs from a published snapshot URL.
        #[arg(long)]
        from: Option<String>,

        /// Bearer token for `--from`.
        #[arg(long, env = "CONVERGE_REMOTE_TOKEN", requires = "from")]
        token: Option<String>,
    },

    /// Inspect and edit recorded state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List recorded resources.
    List,

    /// Show one recorded resource.
    Show {
        /// Resource address, e.g. `local_file.config[0]`.
        address: String,
    },

    /// Move a record to a new address.
    Mv {
        /// Current address.
        from: String,
        /// New address.
        to: String,
    },

    /// Forget a record without destroying its object.
    Rm {
        /// Resource address.
        address: String,
    },

    /// Adopt an existing object.
    Import {
        /// Resource address.
        address: String,
        /// External id of the object.
        id: String,
    },

    /// List stored snapshot versions.
    History,

    /// Make a stored version current again.
    Rollback {
        /// Serial of the version to restore.
        serial: u64,
    },

    /// Delete old snapshot versions.
    Prune {
        /// Number of newest versions to keep.
        #[arg(long, default_value = "20")]
        keep: usize,
    },

    /// Remove a lock left behind by a crashed run.
    Unlock {
        /// Lock ID to remove.
        lock_id: String,
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

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
