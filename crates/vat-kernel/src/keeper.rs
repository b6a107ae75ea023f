//! Persisted vat metadata and transcripts, as seen by the warehouse.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use thiserror::Error;
use vat_codec::Hash;

use crate::{
    journal::{
        JournalError, PositionedEntry, TranscriptLog, TranscriptPos, fs::FsTranscriptLog,
        mem::MemTranscriptLog,
    },
    vat::{SnapshotPointer, TranscriptEntry, VatId, VatKind, VatOptions, VatSourceAndOptions},
};

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("transcript log error: {0}")]
    Journal(#[from] JournalError),
    #[error("vat {0} is already allocated")]
    AlreadyAllocated(VatId),
    #[error("snapshot for vat {vat_id} ends at {end_pos}, past transcript length {len}")]
    SnapshotPastTranscript {
        vat_id: VatId,
        end_pos: TranscriptPos,
        len: TranscriptPos,
    },
}

/// Per-vat persisted state.
pub trait VatKeeper: Send + Sync {
    fn vat_id(&self) -> &VatId;
    fn get_source_and_options(&self) -> VatSourceAndOptions;
    fn set_options(&self, options: VatOptions);
    fn add_to_transcript(&self, entry: TranscriptEntry) -> Result<TranscriptPos, KeeperError>;
    fn get_transcript(&self, start_pos: TranscriptPos) -> Result<Vec<PositionedEntry>, KeeperError>;
    fn transcript_len(&self) -> TranscriptPos;
    fn transcript_span_hash(&self) -> Hash;
    fn get_last_snapshot(&self) -> Option<SnapshotPointer>;
    fn save_snapshot(&self, pointer: SnapshotPointer) -> Result<(), KeeperError>;
}

/// Kernel-wide registry of vats.
pub trait KernelKeeper: Send + Sync {
    fn get_vat_keeper(&self, vat_id: &VatId) -> Option<Arc<dyn VatKeeper>>;
    fn allocate_vat_keeper(
        &self,
        vat_id: &VatId,
        record: VatSourceAndOptions,
        kind: VatKind,
    ) -> Result<Arc<dyn VatKeeper>, KeeperError>;
    /// `(name, vat id)` in declaration order.
    fn get_static_vats(&self) -> Vec<(String, VatId)>;
    /// Dynamic vats in creation order.
    fn get_dynamic_vats(&self) -> Vec<VatId>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemVatKeeper {
    vat_id: VatId,
    record: RwLock<VatSourceAndOptions>,
    log: Mutex<Box<dyn TranscriptLog>>,
    last_snapshot: Mutex<Option<SnapshotPointer>>,
}

impl std::fmt::Debug for MemVatKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemVatKeeper")
            .field("vat_id", &self.vat_id)
            .field("transcript_len", &self.transcript_len())
            .finish()
    }
}

impl MemVatKeeper {
    pub fn new(vat_id: VatId, record: VatSourceAndOptions, log: Box<dyn TranscriptLog>) -> Self {
        Self {
            vat_id,
            record: RwLock::new(record),
            log: Mutex::new(log),
            last_snapshot: Mutex::new(None),
        }
    }
}

impl VatKeeper for MemVatKeeper {
    fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    fn get_source_and_options(&self) -> VatSourceAndOptions {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_options(&self, options: VatOptions) {
        self.record
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .options = options;
    }

    fn add_to_transcript(&self, entry: TranscriptEntry) -> Result<TranscriptPos, KeeperError> {
        Ok(lock(&self.log).append(&entry)?)
    }

    fn get_transcript(
        &self,
        start_pos: TranscriptPos,
    ) -> Result<Vec<PositionedEntry>, KeeperError> {
        Ok(lock(&self.log).load_from(start_pos)?)
    }

    fn transcript_len(&self) -> TranscriptPos {
        lock(&self.log).next_pos()
    }

    fn transcript_span_hash(&self) -> Hash {
        lock(&self.log).span_hash()
    }

    fn get_last_snapshot(&self) -> Option<SnapshotPointer> {
        *lock(&self.last_snapshot)
    }

    fn save_snapshot(&self, pointer: SnapshotPointer) -> Result<(), KeeperError> {
        let len = self.transcript_len();
        if pointer.end_pos > len {
            return Err(KeeperError::SnapshotPastTranscript {
                vat_id: self.vat_id.clone(),
                end_pos: pointer.end_pos,
                len,
            });
        }
        *lock(&self.last_snapshot) = Some(pointer);
        Ok(())
    }
}

#[derive(Default)]
struct Registry {
    vats: BTreeMap<VatId, Arc<MemVatKeeper>>,
    static_vats: Vec<(String, VatId)>,
    dynamic_vats: Vec<VatId>,
    mem_logs: BTreeMap<VatId, MemTranscriptLog>,
}

/// Kernel keeper holding vat records in memory. Transcripts live in memory
/// too unless a transcript directory is configured.
#[derive(Default)]
pub struct MemKernelKeeper {
    registry: Mutex<Registry>,
    transcript_dir: Option<PathBuf>,
}

impl MemKernelKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store transcripts as files under `dir`.
    pub fn with_transcript_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            registry: Mutex::default(),
            transcript_dir: Some(dir.into()),
        }
    }

    /// Declare a static vat.
    pub fn add_static_vat(
        &self,
        name: impl Into<String>,
        vat_id: impl Into<VatId>,
        mut record: VatSourceAndOptions,
    ) -> Result<Arc<dyn VatKeeper>, KeeperError> {
        record.options.name = Some(name.into());
        self.allocate_vat_keeper(&vat_id.into(), record, VatKind::Static)
    }

    /// The in-memory log backing a vat's transcript, when transcripts are not on disk.
    pub fn mem_transcript(&self, vat_id: &VatId) -> Option<MemTranscriptLog> {
        lock(&self.registry).mem_logs.get(vat_id).cloned()
    }

    fn open_log(
        &self,
        vat_id: &VatId,
    ) -> Result<(Box<dyn TranscriptLog>, Option<MemTranscriptLog>), KeeperError> {
        match &self.transcript_dir {
            Some(dir) => Ok((Box::new(FsTranscriptLog::open(dir, vat_id)?), None)),
            None => {
                let log = MemTranscriptLog::new();
                Ok((Box::new(log.clone()), Some(log)))
            }
        }
    }
}

impl KernelKeeper for MemKernelKeeper {
    fn get_vat_keeper(&self, vat_id: &VatId) -> Option<Arc<dyn VatKeeper>> {
        lock(&self.registry)
            .vats
            .get(vat_id)
            .map(|keeper| keeper.clone() as Arc<dyn VatKeeper>)
    }

    fn allocate_vat_keeper(
        &self,
        vat_id: &VatId,
        record: VatSourceAndOptions,
        kind: VatKind,
    ) -> Result<Arc<dyn VatKeeper>, KeeperError> {
        let mut registry = lock(&self.registry);
        if registry.vats.contains_key(vat_id) {
            return Err(KeeperError::AlreadyAllocated(vat_id.clone()));
        }
        let (log, mem_log) = self.open_log(vat_id)?;
        let name = record.options.name.clone();
        let keeper = Arc::new(MemVatKeeper::new(vat_id.clone(), record, log));
        registry.vats.insert(vat_id.clone(), keeper.clone());
        if let Some(mem_log) = mem_log {
            registry.mem_logs.insert(vat_id.clone(), mem_log);
        }
        match kind {
            VatKind::Static => registry
                .static_vats
                .push((name.unwrap_or_else(|| vat_id.to_string()), vat_id.clone())),
            VatKind::Dynamic => registry.dynamic_vats.push(vat_id.clone()),
        }
        log::debug!("allocated {kind:?} vat keeper for {vat_id}");
        Ok(keeper)
    }

    fn get_static_vats(&self) -> Vec<(String, VatId)> {
        lock(&self.registry).static_vats.clone()
    }

    fn get_dynamic_vats(&self) -> Vec<VatId> {
        lock(&self.registry).dynamic_vats.clone()
    }
}
