use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sitesync")]
#[command(about = "Operate a sitesync node from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the node database (overrides SYNC_DATABASE_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one sync cycle against the configured remote
    Sync {
        /// Output the run log as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show watermark, last result and remote reachability
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent sync run logs
    Logs {
        /// Number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List conflicts waiting for manual review
    Conflicts {
        /// Number of recent runs to scan
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
