use anyhow::{Context, Result};
use std::io::{self, BufReader, BufWriter};
use tracing_subscriber::EnvFilter;

fn setup_logging() {
    // stdout carries frames; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    setup_logging();
    let name = std::env::var("VAT_WORKER_NAME").unwrap_or_else(|_| "vat-worker".into());
    tracing::debug!(worker = %name, "worker starting");
    let stdin = BufReader::new(io::stdin().lock());
    let stdout = BufWriter::new(io::stdout().lock());
    vat_worker::run_worker(stdin, stdout).with_context(|| format!("worker {name} failed"))
}
