//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "hostward")]
#[command(author, version, about = "Declarative firewall and compose provisioning over SSH")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Manifest path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// State file path (overrides `state_file` from the manifest)
    #[arg(short, long, global = true)]
    pub state: Option<PathBuf>,

    /// Quiet mode (warnings and errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode (debug output, including generated scripts)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show what apply would do
    Plan,

    /// Converge the host to the manifest
    Apply {
        /// Print the scripts instead of running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Run every recorded delete script, newest first
    Destroy {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Load the manifest and build every resource without contacting the host
    Validate,

    /// Print the generated script of one resource
    Render {
        /// Resource name, e.g. chain/filter/DOCKER-USER/ipv4
        resource: String,
    },

    /// Print a commented default manifest
    Init,

    /// Show version
    Version,
}
