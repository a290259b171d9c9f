use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tracemem",
    version,
    about = "Durable session memory with queued enrichment and replication"
)]
pub struct Cli {
    /// Config file path
    #[arg(long, env = "TRACEMEM_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Embedded database path (overrides storage.path)
    #[arg(long, env = "TRACEMEM_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show backend, record counts and queue state
    Status,
    /// List jobs not yet processed: failed, processing, then pending
    Queue(QueueArgs),
    /// Put a pending, processing or failed job back in the queue
    Retry(JobArgs),
    /// Delete a job without retrying it
    Abort(JobArgs),
    /// Requeue jobs stuck in processing
    Recover(RecoverArgs),
    /// Trim processed job history
    Cleanup(CleanupArgs),
    /// Write sessions, observations, summaries and prompts to a JSON file
    Export(ExportArgs),
    /// Import a JSON export; entities already present are skipped
    Import(ImportArgs),
}

#[derive(Parser)]
pub struct QueueArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct JobArgs {
    /// Job id
    pub id: i64,
}

#[derive(Parser)]
pub struct RecoverArgs {
    /// Only requeue jobs claimed longer ago than this; 0 requeues all
    /// (default: queue.stuck_threshold_secs)
    #[arg(long)]
    pub threshold_secs: Option<u64>,
}

#[derive(Parser)]
pub struct CleanupArgs {
    /// Processed jobs to keep (default: queue.processed_retention)
    #[arg(long)]
    pub keep: Option<i64>,
}

#[derive(Parser)]
pub struct ExportArgs {
    /// Only this project
    #[arg(long)]
    pub project: Option<String>,

    /// Output file
    pub file: PathBuf,
}

#[derive(Parser)]
pub struct ImportArgs {
    /// Export file to read
    pub file: PathBuf,
}
