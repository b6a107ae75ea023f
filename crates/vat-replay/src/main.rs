use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vat_kernel::WorkerConfig;
use vat_replay::{DEFAULT_AUDIT_LOG, ReplayConfig, ReplayDriver, WorkerMode, config};

#[derive(Parser, Debug)]
#[command(name = "vat-replay", version, about = "Replay a vat transcript and verify its syscalls")]
struct Cli {
    /// Transcript file (NDJSON, gzip when the name ends in .gz)
    transcript: PathBuf,

    /// Snapshot store directory
    #[arg(long, default_value = ".", env = "VAT_SNAPSHOT_DIR")]
    snapshot_dir: PathBuf,

    /// Audit log of snapshot activity
    #[arg(long, default_value = DEFAULT_AUDIT_LOG)]
    audit_log: PathBuf,

    /// Warn instead of failing when a snapshot hash differs from the recorded one
    #[arg(long)]
    ignore_snapshot_hash_differences: bool,

    /// First delivery number that gets a forced snapshot
    #[arg(long, default_value_t = config::DEFAULT_FORCED_SNAPSHOT_INITIAL)]
    forced_snapshot_initial: u64,

    /// Deliveries between forced snapshots (0 disables)
    #[arg(long, default_value_t = config::DEFAULT_FORCED_SNAPSHOT_INTERVAL)]
    forced_snapshot_interval: u64,

    /// Run the vat in this worker binary instead of in-process (env: VAT_WORKER_PATH)
    #[arg(long, env = "VAT_WORKER_PATH")]
    worker: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> ReplayConfig {
        ReplayConfig {
            snapshot_dir: self.snapshot_dir.clone(),
            audit_log_path: self.audit_log.clone(),
            ignore_snapshot_hash_differences: self.ignore_snapshot_hash_differences,
            forced_snapshot_initial: self.forced_snapshot_initial,
            forced_snapshot_interval: self.forced_snapshot_interval,
            worker: match &self.worker {
                Some(path) => WorkerMode::Subprocess(WorkerConfig {
                    worker_path: path.clone(),
                }),
                None => WorkerMode::InProcess,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let driver = ReplayDriver::new(cli.config())?;
    let summary = driver.replay(&cli.transcript).await?;
    tracing::info!(
        lines = summary.lines,
        deliveries = summary.deliveries,
        snapshots_loaded = summary.snapshots_loaded,
        snapshots_saved = summary.snapshots_saved,
        forced_snapshots = summary.forced_snapshots,
        hash_mismatches = summary.hash_mismatches,
        "replay complete"
    );
    Ok(())
}
