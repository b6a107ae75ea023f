//! Turning persisted vat records into running vat managers.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use vat_snapstore::SnapStore;
use vat_worker_protocol::{ManagerRequest, RejectSyscalls, WorkerLauncher};

use crate::{
    error::{KernelError, KernelResult},
    manager::{VatManager, WorkerVatManager},
    syscall::SyscallHandler,
    transcript::TranscriptManager,
    vat::{SnapshotPointer, VatId, VatOptions, VatSource},
};

#[async_trait]
pub trait VatLoader: Send + Sync {
    /// Start a brand-new vat with an empty transcript.
    async fn create_vat_dynamically(
        &self,
        vat_id: &VatId,
        source: &VatSource,
        transcript: TranscriptManager,
        options: &VatOptions,
    ) -> KernelResult<Box<dyn VatManager>>;

    /// Bring back a previously created dynamic vat.
    async fn recreate_dynamic_vat(
        &self,
        vat_id: &VatId,
        source: &VatSource,
        transcript: TranscriptManager,
        options: &VatOptions,
    ) -> KernelResult<Box<dyn VatManager>>;

    /// Bring back a static vat.
    async fn recreate_static_vat(
        &self,
        vat_id: &VatId,
        source: &VatSource,
        transcript: TranscriptManager,
        options: &VatOptions,
    ) -> KernelResult<Box<dyn VatManager>>;
}

/// Loader that hosts every vat in a worker obtained from a [`WorkerLauncher`].
///
/// Recreated vats start from their latest heap snapshot when a snapshot store
/// is configured, and from their bundle otherwise.
pub struct WorkerVatLoader {
    launcher: Arc<dyn WorkerLauncher>,
    syscalls: Arc<dyn SyscallHandler>,
    snap_store: Option<Arc<SnapStore>>,
    bundles: HashMap<String, Value>,
}

impl WorkerVatLoader {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, syscalls: Arc<dyn SyscallHandler>) -> Self {
        Self {
            launcher,
            syscalls,
            snap_store: None,
            bundles: HashMap::new(),
        }
    }

    pub fn with_snap_store(mut self, store: Arc<SnapStore>) -> Self {
        self.snap_store = Some(store);
        self
    }

    /// Register a bundle that [`VatSource::BundleId`] can refer to.
    pub fn with_bundle(mut self, bundle_id: impl Into<String>, bundle: Value) -> Self {
        self.bundles.insert(bundle_id.into(), bundle);
        self
    }

    pub fn snap_store(&self) -> Option<&Arc<SnapStore>> {
        self.snap_store.as_ref()
    }

    fn resolve_bundle(&self, source: &VatSource) -> KernelResult<Value> {
        match source {
            VatSource::Bundle(bundle) => Ok(bundle.clone()),
            VatSource::BundleId(id) => self
                .bundles
                .get(id)
                .cloned()
                .ok_or_else(|| KernelError::UnknownBundle(id.clone())),
        }
    }

    /// Launch a worker for `vat_id`, install the vat from `snapshot` or from
    /// its bundle, and wrap it in a manager.
    pub async fn start_worker(
        &self,
        vat_id: &VatId,
        source: &VatSource,
        transcript: TranscriptManager,
        options: &VatOptions,
        snapshot: Option<SnapshotPointer>,
    ) -> KernelResult<WorkerVatManager> {
        let mut channel = self.launcher.launch(vat_id.as_str()).await?;
        let transcript_start = match (snapshot, self.snap_store.as_ref()) {
            (Some(pointer), Some(store)) => {
                let worker = &mut channel;
                store
                    .load(pointer.snapshot_id, |path| async move {
                        worker
                            .call_ok(
                                ManagerRequest::LoadSnapshot {
                                    vat_id: vat_id.to_string(),
                                    path,
                                },
                                &mut RejectSyscalls,
                            )
                            .await
                            .map_err(KernelError::from)
                    })
                    .await?;
                log::debug!(
                    "vat {vat_id} loaded snapshot {} at position {}",
                    pointer.snapshot_id,
                    pointer.end_pos
                );
                pointer.end_pos
            }
            (snapshot, store) => {
                if snapshot.is_some() && store.is_none() {
                    log::warn!(
                        "vat {vat_id} has a snapshot but no snapshot store is configured; replaying its full transcript"
                    );
                }
                let bundle = self.resolve_bundle(source)?;
                channel
                    .call_ok(
                        ManagerRequest::SetBundle {
                            vat_id: vat_id.to_string(),
                            bundle,
                            vat_parameters: options.vat_parameters.clone(),
                            virtual_object_cache_size: options.virtual_object_cache_size,
                        },
                        &mut RejectSyscalls,
                    )
                    .await?;
                0
            }
        };
        let manager = WorkerVatManager::new(channel, transcript, self.syscalls.clone())
            .starting_at(transcript_start);
        Ok(if options.use_transcript {
            manager
        } else {
            manager.without_transcript()
        })
    }

    async fn recreate(
        &self,
        vat_id: &VatId,
        source: &VatSource,
        transcript: TranscriptManager,
        options: &VatOptions,
    ) -> KernelResult<Box<dyn VatManager>> {
        let snapshot = transcript.keeper().get_last_snapshot();
        let manager = self
            .start_worker(vat_id, source, transcript, options, snapshot)
            .await?;
        Ok(Box::new(manager))
    }
}

#[async_trait]
impl VatLoader for WorkerVatLoader {
    async fn create_vat_dynamically(
        &self,
        vat_id: &VatId,
        source: &VatSource,
        transcript: TranscriptManager,
        options: &VatOptions,
    ) -> KernelResult<Box<dyn VatManager>> {
        log::debug!("creating dynamic vat {vat_id}");
        let manager = self
            .start_worker(vat_id, source, transcript, options, None)
            .await?;
        Ok(Box::new(manager))
    }

    async fn recreate_dynamic_vat(
        &self,
        vat_id: &VatId,
        source: &VatSource,
        transcript: TranscriptManager,
        options: &VatOptions,
    ) -> KernelResult<Box<dyn VatManager>> {
        log::debug!("recreating dynamic vat {vat_id}");
        self.recreate(vat_id, source, transcript, options).await
    }

    async fn recreate_static_vat(
        &self,
        vat_id: &VatId,
        source: &VatSource,
        transcript: TranscriptManager,
        options: &VatOptions,
    ) -> KernelResult<Box<dyn VatManager>> {
        log::debug!(
            "recreating static vat {} as {vat_id}",
            options.name.as_deref().unwrap_or("(unnamed)")
        );
        self.recreate(vat_id, source, transcript, options).await
    }
}
