use std::path::PathBuf;
use vat_worker_protocol::{SubprocessLauncher, WORKER_PATH_ENV};

pub const DEFAULT_MAX_VATS_ONLINE: usize = 50;
pub const MAX_VATS_ONLINE_ENV: &str = "VAT_MAX_VATS_ONLINE";

/// Residency policy for the vat warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehousePolicy {
    /// Upper bound on resident vats. Always at least 1.
    pub max_vats_online: usize,
}

impl Default for WarehousePolicy {
    fn default() -> Self {
        Self {
            max_vats_online: DEFAULT_MAX_VATS_ONLINE,
        }
    }
}

impl WarehousePolicy {
    pub fn with_max_vats_online(max_vats_online: usize) -> Self {
        Self {
            max_vats_online: max_vats_online.max(1),
        }
    }

    /// Read `VAT_MAX_VATS_ONLINE`, falling back to the default when unset or invalid.
    pub fn from_env() -> Self {
        match std::env::var(MAX_VATS_ONLINE_ENV) {
            Ok(raw) => match raw.trim().parse::<usize>() {
                Ok(n) => Self::with_max_vats_online(n),
                Err(err) => {
                    log::warn!("ignoring {MAX_VATS_ONLINE_ENV}={raw:?}: {err}");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

/// How worker subprocesses are started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_path: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_path: PathBuf::from("vat-worker"),
        }
    }
}

impl WorkerConfig {
    /// Read `VAT_WORKER_PATH`, defaulting to `vat-worker` on `PATH`.
    pub fn from_env() -> Self {
        std::env::var_os(WORKER_PATH_ENV)
            .map(|path| Self {
                worker_path: PathBuf::from(path),
            })
            .unwrap_or_default()
    }

    pub fn launcher(&self) -> SubprocessLauncher {
        SubprocessLauncher::new(&self.worker_path)
    }
}
