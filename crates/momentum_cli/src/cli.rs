use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "momentum")]
#[command(about = "Reconcile project documents with the store and score project momentum")]
pub struct Cli {
    /// SQLite store path.
    #[arg(long, default_value = "momentum.db")]
    pub db: PathBuf,
    /// Root of the document tree.
    #[arg(long, default_value = ".")]
    pub docs: PathBuf,
    /// Engine config (TOML). A missing file means defaults.
    #[arg(long, default_value = "momentum.toml")]
    pub config: PathBuf,
    /// Enables file logging into this directory.
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Classify every linked project without writing anything.
    Scan,
    /// Scan, resolve and apply.
    Reconcile,
    /// Recompute momentum for one project or all tracked projects.
    Momentum {
        #[arg(long)]
        project: Option<String>,
    },
    /// Run the scheduler until stdin closes. Lines `sync` and `momentum`
    /// trigger an immediate tick.
    Watch,
    /// List linked documents and their agreed digests.
    Documents,
    /// Write a fresh document for a store-created project.
    Export { project: String, path: String },
}
