//! Vat lifecycle and persistence: transcripts, the vat keeper interface,
//! worker-backed vat managers, and the warehouse that bounds how many vats
//! are resident at once.

pub mod config;
pub mod error;
pub mod journal;
pub mod keeper;
pub mod loader;
pub mod manager;
pub mod syscall;
pub mod transcript;
pub mod vat;
pub mod warehouse;

pub use config::{WarehousePolicy, WorkerConfig};
pub use error::{KernelError, KernelResult};
pub use journal::{PositionedEntry, TranscriptLog, TranscriptPos};
pub use keeper::{KernelKeeper, KeeperError, MemKernelKeeper, VatKeeper};
pub use loader::{VatLoader, WorkerVatLoader};
pub use manager::{VatManager, WorkerVatManager};
pub use syscall::{SentMessage, SyscallHandler, VatstoreSyscalls};
pub use transcript::{CompareSyscalls, ReplayError, RequireIdentical, TranscriptManager};
pub use vat::{
    SnapshotPointer, SyscallRecord, TranscriptEntry, VatId, VatKind, VatOptions, VatSource,
    VatSourceAndOptions,
};
pub use warehouse::{PanicHook, VatLookup, VatWarehouse, WarehouseEntry, abort_on_panic};
