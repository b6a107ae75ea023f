use std::{collections::HashMap, io::BufRead, path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use vat_codec::Hash;
use vat_kernel::{
    KernelKeeper, MemKernelKeeper, RequireIdentical, SnapshotPointer, TranscriptManager, VatId,
    VatKind, VatManager, VatOptions, VatSource, VatSourceAndOptions, VatstoreSyscalls,
    WorkerVatLoader, WorkerVatManager,
};
use vat_snapstore::SnapStore;
use vat_worker_protocol::WorkerLauncher;

use crate::{
    audit::{AuditEvent, AuditKind, AuditLog},
    config::ReplayConfig,
    record::{CreateVat, Delivery, SnapshotLoad, SnapshotSave, TranscriptRecord, open_transcript},
};

const PROGRESS_INTERVAL: u64 = 1000;
const DELIVERY_PREVIEW_LEN: usize = 200;

/// Counters for one replayed transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub lines: u64,
    pub deliveries: u64,
    pub snapshots_loaded: u64,
    pub snapshots_saved: u64,
    pub forced_snapshots: u64,
    pub hash_mismatches: u64,
}

/// Drives a single vat through a recorded transcript, checking every syscall.
pub struct ReplayDriver {
    config: ReplayConfig,
    store: Arc<SnapStore>,
    loader: WorkerVatLoader,
    keepers: MemKernelKeeper,
}

impl ReplayDriver {
    pub fn new(config: ReplayConfig) -> Result<Self> {
        let launcher = config.launcher();
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: ReplayConfig, launcher: Arc<dyn WorkerLauncher>) -> Result<Self> {
        let store = Arc::new(SnapStore::open(&config.snapshot_dir).with_context(|| {
            format!("open snapshot store {}", config.snapshot_dir.display())
        })?);
        // Every syscall is answered from the transcript; the handler only
        // exists to satisfy the loader.
        let loader = WorkerVatLoader::new(launcher, Arc::new(VatstoreSyscalls::new()))
            .with_snap_store(store.clone());
        Ok(Self {
            config,
            store,
            loader,
            keepers: MemKernelKeeper::new(),
        })
    }

    pub fn snap_store(&self) -> &Arc<SnapStore> {
        &self.store
    }

    /// Replay `transcript_path` to the end. Stops at the first error, after
    /// shutting down the worker.
    pub async fn replay(&self, transcript_path: &Path) -> Result<ReplaySummary> {
        let mut session = Session {
            transcript_file: transcript_path.display().to_string(),
            audit: AuditLog::open(&self.config.audit_log_path).with_context(|| {
                format!("open audit log {}", self.config.audit_log_path.display())
            })?,
            vat_id: None,
            source: VatSourceAndOptions::bundle(Value::Null),
            manager: None,
            rewrites: HashMap::new(),
            last_transcript_num: None,
            summary: ReplaySummary::default(),
        };
        tracing::info!(transcript = %session.transcript_file, "replaying transcript");
        let outcome = self.run(transcript_path, &mut session).await;
        if let Some(mut manager) = session.manager.take() {
            if let Err(err) = manager.shutdown().await {
                if outcome.is_ok() {
                    return Err(err).context("shut down worker");
                }
                tracing::debug!(%err, "worker shutdown after failed replay");
            }
        }
        outcome.map(|()| session.summary)
    }

    async fn run(&self, transcript_path: &Path, session: &mut Session) -> Result<()> {
        let reader = open_transcript(transcript_path)
            .with_context(|| format!("open transcript {}", transcript_path.display()))?;
        for (index, line) in reader.lines().enumerate() {
            let line_number = index as u64 + 1;
            if line_number % PROGRESS_INTERVAL == 0 {
                tracing::info!(line = line_number, "transcript progress");
            }
            let line = line.with_context(|| format!("read line {line_number}"))?;
            session.summary.lines = line_number;
            if line.trim().is_empty() {
                continue;
            }
            let record = TranscriptRecord::parse(&line)
                .with_context(|| format!("line {line_number}: malformed transcript record"))?;
            self.apply(record, line_number, session)
                .await
                .with_context(|| format!("line {line_number}"))?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        record: TranscriptRecord,
        line_number: u64,
        session: &mut Session,
    ) -> Result<()> {
        match record {
            TranscriptRecord::HeapSnapshotLoad(load) => self.load_snapshot(load, session).await,
            TranscriptRecord::CreateVat(create) => self.create_vat(create, session).await,
            _ if session.manager.is_none() => {
                bail!("first record of transcript was not a create-vat or heap-snapshot-load")
            }
            TranscriptRecord::HeapSnapshotSave(save) => self.save_snapshot(save, session).await,
            TranscriptRecord::Delivery(delivery) => {
                self.replay_delivery(delivery, line_number, session).await
            }
        }
    }

    async fn create_vat(&self, create: CreateVat, session: &mut Session) -> Result<()> {
        if session.manager.is_some() {
            bail!("create-vat record for {} while a vat is already running", create.vat_id);
        }
        session.source =
            VatSourceAndOptions::bundle(create.vat_source_bundle).with_options(VatOptions {
                vat_parameters: create.vat_parameters,
                ..VatOptions::default()
            });
        session.vat_id = Some(create.vat_id.clone());
        let manager = self.start_manager(&create.vat_id, session, None).await?;
        session.manager = Some(manager);
        tracing::info!(vat_id = %create.vat_id, "manager created from bundle source");
        session
            .audit
            .append(&AuditEvent::new(&session.transcript_file, AuditKind::Create, create.vat_id))?;
        Ok(())
    }

    async fn load_snapshot(&self, load: SnapshotLoad, session: &mut Session) -> Result<()> {
        if let Some(mut manager) = session.manager.take() {
            manager.shutdown().await.context("shut down worker before snapshot load")?;
        }
        let load_id = session
            .rewrites
            .get(&load.snapshot_id)
            .cloned()
            .unwrap_or_else(|| load.snapshot_id.clone());
        if let Some(vat_id) = load.vat_id {
            session.vat_id = Some(vat_id);
        }
        let vat_id = session
            .vat_id
            .clone()
            .ok_or_else(|| anyhow!("heap-snapshot-load of {} names no vat", load.snapshot_id))?;
        let snapshot_id = Hash::from_hex_str(&load_id)
            .with_context(|| format!("invalid snapshot id {load_id}"))?;
        let pointer = SnapshotPointer {
            snapshot_id,
            end_pos: 0,
        };
        let manager = self.start_manager(&vat_id, session, Some(pointer)).await?;
        session.manager = Some(manager);
        session.summary.snapshots_loaded += 1;
        tracing::info!(%vat_id, snapshot = %load_id, "manager created from snapshot");

        let mut event = AuditEvent::new(&session.transcript_file, AuditKind::Load, vat_id);
        event.snapshot_id = Some(load.snapshot_id);
        event.load_snapshot_id = Some(load_id);
        session.audit.append(&event)?;
        Ok(())
    }

    async fn save_snapshot(&self, save: SnapshotSave, session: &mut Session) -> Result<()> {
        let manager = session.manager_mut()?;
        let result = manager.make_snapshot(&self.store).await.context("make snapshot")?;
        let hash = result.hash.to_hex();
        session
            .rewrites
            .insert(save.snapshot_id.clone(), hash.clone());
        session.summary.snapshots_saved += 1;

        let mut event =
            AuditEvent::new(&session.transcript_file, AuditKind::Save, session.vat_id()?);
        event.transcript_num = session.last_transcript_num;
        event.snapshot_id = Some(hash.clone());
        event.save_snapshot_id = Some(save.snapshot_id.clone());
        session.audit.append(&event)?;

        if hash != save.snapshot_id {
            let message = format!("snapshot hash does not match: {hash} != {}", save.snapshot_id);
            if !self.config.ignore_snapshot_hash_differences {
                bail!(message);
            }
            tracing::warn!("{message}");
            session.summary.hash_mismatches += 1;
        } else {
            tracing::info!(snapshot = %hash, "made snapshot");
        }
        Ok(())
    }

    async fn replay_delivery(
        &self,
        delivery: Delivery,
        line_number: u64,
        session: &mut Session,
    ) -> Result<()> {
        let Delivery {
            transcript_num,
            d,
            syscalls,
        } = delivery;
        tracing::info!(
            transcript_num,
            line = line_number,
            delivery = %preview(&d),
            "replaying delivery"
        );
        session.last_transcript_num = Some(transcript_num);
        session
            .manager_mut()?
            .replay_one_delivery(d, syscalls, transcript_num)
            .await
            .with_context(|| format!("replay delivery {transcript_num}"))?;
        session.summary.deliveries += 1;

        if self.config.forced_snapshot_due(transcript_num) {
            let result = session
                .manager_mut()?
                .make_snapshot(&self.store)
                .await
                .with_context(|| format!("forced snapshot after delivery {transcript_num}"))?;
            let hash = result.hash.to_hex();
            tracing::info!(snapshot = %hash, transcript_num, "made forced snapshot");
            session.summary.forced_snapshots += 1;
            let mut event =
                AuditEvent::new(&session.transcript_file, AuditKind::Save, session.vat_id()?);
            event.transcript_num = Some(transcript_num);
            event.snapshot_id = Some(hash);
            session.audit.append(&event)?;
        }
        Ok(())
    }

    async fn start_manager(
        &self,
        vat_id: &VatId,
        session: &Session,
        snapshot: Option<SnapshotPointer>,
    ) -> Result<WorkerVatManager> {
        let keeper = match self.keepers.get_vat_keeper(vat_id) {
            Some(keeper) => keeper,
            None => self
                .keepers
                .allocate_vat_keeper(vat_id, session.source.clone(), VatKind::Dynamic)?,
        };
        let transcript = TranscriptManager::new(keeper, Arc::new(RequireIdentical::default()));
        let source: &VatSource = &session.source.source;
        self.loader
            .start_worker(vat_id, source, transcript, &session.source.options, snapshot)
            .await
            .with_context(|| format!("start worker for vat {vat_id}"))
    }
}

struct Session {
    transcript_file: String,
    audit: AuditLog,
    vat_id: Option<VatId>,
    source: VatSourceAndOptions,
    manager: Option<WorkerVatManager>,
    /// Recorded snapshot id to the id this run produced for the same save.
    rewrites: HashMap<String, String>,
    last_transcript_num: Option<u64>,
    summary: ReplaySummary,
}

impl Session {
    fn manager_mut(&mut self) -> Result<&mut WorkerVatManager> {
        self.manager
            .as_mut()
            .ok_or_else(|| anyhow!("no vat is running"))
    }

    fn vat_id(&self) -> Result<VatId> {
        self.vat_id.clone().ok_or_else(|| anyhow!("no vat id known"))
    }
}

fn preview(delivery: &Value) -> String {
    let text = delivery.to_string();
    match text.char_indices().nth(DELIVERY_PREVIEW_LEN) {
        Some((end, _)) => text[..end].to_string(),
        None => text,
    }
}
