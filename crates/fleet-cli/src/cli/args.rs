use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "fleet", author, version, about = "Keep a fleet of git checkouts in sync")]
pub(super) struct Cli {
    /// Config file (defaults to the per-user config directory).
    #[arg(long, global = true)]
    pub(super) config: Option<PathBuf>,
    /// Directory for the JSONL audit trail.
    #[arg(long, global = true)]
    pub(super) audit_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub(super) command: Commands,
}

#[derive(Debug, Subcommand)]
pub(super) enum Commands {
    #[command(about = "Show the actions a sync would take")]
    Plan(PlanArgs),
    #[command(about = "Clone, update and clean up repositories")]
    Sync(SyncArgs),
    #[command(about = "Report the health of every checkout")]
    Health(HealthArgs),
}

impl Commands {
    pub(super) fn label(&self) -> &'static str {
        match self {
            Commands::Plan(_) => "plan",
            Commands::Sync(_) => "sync",
            Commands::Health(_) => "health",
        }
    }
}

#[derive(Debug, Parser)]
pub(super) struct PlanArgs {
    /// Include deletions of orphaned directories.
    #[arg(long)]
    pub(super) cleanup: bool,
    /// Print the plan as JSON.
    #[arg(long)]
    pub(super) json: bool,
}

#[derive(Debug, Parser)]
pub(super) struct SyncArgs {
    /// Report what would happen without touching any checkout.
    #[arg(long)]
    pub(super) dry_run: bool,
    /// Skip repos the previous run already finished.
    #[arg(long)]
    pub(super) resume: bool,
    /// Worker count (overrides the config).
    #[arg(long, short = 'j')]
    pub(super) jobs: Option<usize>,
    /// Delete orphaned directories under the cleanup roots.
    #[arg(long)]
    pub(super) cleanup: bool,
    /// Run state file (overrides the config).
    #[arg(long)]
    pub(super) state: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub(super) struct HealthArgs {
    /// Use local refs only.
    #[arg(long)]
    pub(super) skip_fetch: bool,
    /// Print the full report as JSON.
    #[arg(long)]
    pub(super) json: bool,
    /// Worker count (overrides the config).
    #[arg(long, short = 'j')]
    pub(super) jobs: Option<usize>,
}
