use crate::{keeper::KeeperError, transcript::ReplayError, vat::VatId};
use thiserror::Error;
use vat_snapstore::SnapStoreError;
use vat_worker_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("snapshot store error: {0}")]
    SnapStore(#[from] SnapStoreError),
    #[error("worker protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("vat keeper error: {0}")]
    Keeper(#[from] KeeperError),
    #[error("unknown vat {0}")]
    UnknownVat(VatId),
    #[error("unknown bundle '{0}'")]
    UnknownBundle(String),
    #[error("snapshot on evict is not supported (vat {0})")]
    SnapshotOnEvict(VatId),
    #[error("vat {0} has no running worker")]
    NoWorker(VatId),
    #[error("worker for vat {vat_id} failed: {message}")]
    Worker { vat_id: VatId, message: String },
    #[error("unrecoverable vat failure: {0}")]
    Panicked(String),
}

pub type KernelResult<T> = Result<T, KernelError>;
