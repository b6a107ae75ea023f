//! Content-addressed storage for compressed vat heap snapshots.
//!
//! Snapshots are addressed by the SHA-256 of their uncompressed bytes and
//! stored as `<root>/<hash>.gz`. Writes go through a temp file in the same
//! directory and become visible only by rename.

mod fs_store;

pub use fs_store::{SnapStore, SnapshotResult};

use std::{fmt, io, path::PathBuf};
use vat_codec::Hash;

pub type SnapStoreResult<T> = Result<T, SnapStoreError>;

#[derive(Debug, thiserror::Error)]
pub enum SnapStoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },
    #[error("no snapshot stored for {0}")]
    Missing(Hash),
    #[error("{}", AggregateDisplay(.0))]
    Aggregate(Vec<SnapStoreError>),
    #[error("snapshot worker task failed: {0}")]
    Task(String),
}

struct AggregateDisplay<'a>(&'a [SnapStoreError]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} snapshot deletions failed", self.0.len())?;
        for err in self.0 {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> SnapStoreError {
    SnapStoreError::Io {
        path: path.into(),
        source: err,
    }
}
