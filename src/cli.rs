use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::model::{FailurePolicy, HypervisorKind, OperationType, VariantKey};

/// Disaster-recovery orchestration validation engine.
#[derive(Parser)]
#[command(name = "drove", version, about, long_about = None)]
pub struct Cli {
    /// Log debug output to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print JSON Schema for operation requests.
    Schema(SchemaArgs),
    /// Show the expected phases of an operation for one replication variant.
    Catalog(CatalogArgs),
    /// Match a recorded job trace against the catalog.
    CheckTrace(CheckTraceArgs),
    /// Run an operation request against a recorded environment.
    Replay(ReplayArgs),
}

#[derive(Args)]
pub struct SchemaArgs {
    /// Print the schema of recordings instead.
    #[arg(long)]
    pub recording: bool,
}

/// Replication variant selected on the command line.
#[derive(Args, Clone)]
pub struct VariantArgs {
    /// Destination hypervisor.
    #[arg(long, value_enum)]
    pub hypervisor: HypervisorKind,

    #[arg(long)]
    pub aux_copy: bool,

    #[arg(long)]
    pub warm_sync: bool,

    /// Deploy VM during failover (Azure).
    #[arg(long)]
    pub dvdf: bool,

    #[arg(long)]
    pub snapshot_based: bool,

    /// Continuous (journal based) replication.
    #[arg(long)]
    pub continuous: bool,
}

impl VariantArgs {
    pub fn key(&self) -> VariantKey {
        VariantKey {
            hypervisor: self.hypervisor,
            aux_copy: self.aux_copy,
            warm_sync: self.warm_sync,
            dvdf: self.dvdf,
            snapshot_based: self.snapshot_based,
            continuous: self.continuous,
        }
    }
}

#[derive(Args)]
pub struct CatalogArgs {
    #[arg(long, value_enum)]
    pub operation: OperationType,

    #[command(flatten)]
    pub variant: VariantArgs,

    /// Output structured JSON to stdout.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct CheckTraceArgs {
    /// Path to a job trace JSON file.
    #[arg(long, required = true)]
    pub trace: PathBuf,

    #[arg(long, value_enum)]
    pub operation: OperationType,

    #[command(flatten)]
    pub variant: VariantArgs,

    /// Output structured JSON to stdout.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Path to operation request JSON file.
    #[arg(long, required = true)]
    pub request: PathBuf,

    /// Path to recording JSON file.
    #[arg(long, required = true)]
    pub recording: PathBuf,

    /// Output structured JSON to stdout.
    #[arg(long)]
    pub json: bool,

    /// Append events to an NDJSON journal.
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Override the settle delay (e.g. "30s").
    #[arg(long)]
    pub settle_delay: Option<String>,

    /// Override the failure policy.
    #[arg(long, value_enum)]
    pub failure_policy: Option<FailurePolicy>,
}
