use std::{path::PathBuf, sync::Arc};

use vat_kernel::WorkerConfig;
use vat_worker::InProcessLauncher;
use vat_worker_protocol::WorkerLauncher;

/// Default name of the snapshot audit log.
pub const DEFAULT_AUDIT_LOG: &str = "snapshot-activity.jsonl";

pub const DEFAULT_FORCED_SNAPSHOT_INITIAL: u64 = 2;
pub const DEFAULT_FORCED_SNAPSHOT_INTERVAL: u64 = 1000;

/// Where the replayed vat runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkerMode {
    /// Worker loop on a thread of this process.
    #[default]
    InProcess,
    /// A `vat-worker` subprocess.
    Subprocess(WorkerConfig),
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Snapshot store directory.
    pub snapshot_dir: PathBuf,
    pub audit_log_path: PathBuf,
    /// Downgrade a snapshot hash that differs from the recorded one to a warning.
    pub ignore_snapshot_hash_differences: bool,
    pub forced_snapshot_initial: u64,
    /// Take an extra snapshot every this many deliveries. Zero disables.
    pub forced_snapshot_interval: u64,
    pub worker: WorkerMode,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("."),
            audit_log_path: PathBuf::from(DEFAULT_AUDIT_LOG),
            ignore_snapshot_hash_differences: false,
            forced_snapshot_initial: DEFAULT_FORCED_SNAPSHOT_INITIAL,
            forced_snapshot_interval: DEFAULT_FORCED_SNAPSHOT_INTERVAL,
            worker: WorkerMode::default(),
        }
    }
}

impl ReplayConfig {
    pub fn forced_snapshot_due(&self, transcript_num: u64) -> bool {
        self.forced_snapshot_interval != 0
            && transcript_num >= self.forced_snapshot_initial
            && (transcript_num - self.forced_snapshot_initial) % self.forced_snapshot_interval == 0
    }

    pub fn launcher(&self) -> Arc<dyn WorkerLauncher> {
        match &self.worker {
            WorkerMode::InProcess => Arc::new(InProcessLauncher),
            WorkerMode::Subprocess(worker) => Arc::new(worker.launcher()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_snapshots_follow_initial_and_interval() {
        let config = ReplayConfig::default();
        let due: Vec<u64> = (0..2500).filter(|n| config.forced_snapshot_due(*n)).collect();
        assert_eq!(due, vec![2, 1002, 2002]);
    }

    #[test]
    fn zero_interval_disables_forced_snapshots() {
        let config = ReplayConfig {
            forced_snapshot_interval: 0,
            ..ReplayConfig::default()
        };
        assert!(!(0..5000).any(|n| config.forced_snapshot_due(n)));
    }
}
