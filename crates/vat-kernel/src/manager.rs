//! Kernel-side handle on a running vat.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use vat_snapstore::{SnapStore, SnapshotResult};
use vat_worker_protocol::{
    ManagerRequest, RejectSyscalls, UpcallHandler, WorkerChannel, WorkerReply,
};

use crate::{
    error::{KernelError, KernelResult},
    journal::{PositionedEntry, TranscriptPos},
    syscall::SyscallHandler,
    transcript::TranscriptManager,
    vat::{SyscallRecord, VatId},
};

/// A live vat the warehouse can deliver to.
#[async_trait]
pub trait VatManager: Send {
    fn vat_id(&self) -> &VatId;

    /// Run one delivery and return the vat's delivery result.
    async fn deliver(&mut self, delivery: Value) -> KernelResult<Value>;

    /// Replay every transcript entry the vat's starting state does not
    /// already include. Returns the number of deliveries replayed.
    async fn replay_transcript(&mut self) -> KernelResult<u64>;

    /// Replay a single recorded delivery, checking its syscalls.
    async fn replay_one_delivery(
        &mut self,
        delivery: Value,
        syscalls: Vec<SyscallRecord>,
        delivery_num: TranscriptPos,
    ) -> KernelResult<Value>;

    async fn make_snapshot(&mut self, store: &SnapStore) -> KernelResult<SnapshotResult>;

    async fn shutdown(&mut self) -> KernelResult<()>;
}

struct ManagerUpcalls<'a> {
    vat_id: &'a VatId,
    transcript: &'a mut TranscriptManager,
    syscalls: &'a dyn SyscallHandler,
}

impl UpcallHandler for ManagerUpcalls<'_> {
    fn syscall(&mut self, request: Value) -> Value {
        if self.transcript.in_replay() {
            // The violation is latched in the transcript manager and
            // reported once the delivery returns.
            return match self.transcript.simulate_syscall(&request) {
                Ok(response) => response,
                Err(err) => json!(["error", err.to_string()]),
            };
        }
        let response = self.syscalls.handle(self.vat_id, &request);
        self.transcript.add_syscall(request, response.clone());
        response
    }

    fn console(&mut self, level: &str, args: &[Value]) {
        if self.transcript.in_replay() {
            return;
        }
        log::info!("vat {} console.{level}: {}", self.vat_id, Value::from(args.to_vec()));
    }

    fn test_log(&mut self, args: &[Value]) {
        log::debug!("vat {} testLog: {}", self.vat_id, Value::from(args.to_vec()));
    }
}

/// Vat manager backed by a worker on the other end of a [`WorkerChannel`].
pub struct WorkerVatManager {
    vat_id: VatId,
    channel: Option<WorkerChannel>,
    transcript: TranscriptManager,
    syscalls: Arc<dyn SyscallHandler>,
    transcript_start: TranscriptPos,
    use_transcript: bool,
}

impl std::fmt::Debug for WorkerVatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerVatManager")
            .field("vat_id", &self.vat_id)
            .field("channel", &self.channel)
            .field("transcript_start", &self.transcript_start)
            .finish()
    }
}

impl WorkerVatManager {
    /// `channel` must already have a vat installed.
    pub fn new(
        channel: WorkerChannel,
        transcript: TranscriptManager,
        syscalls: Arc<dyn SyscallHandler>,
    ) -> Self {
        Self {
            vat_id: transcript.vat_id().clone(),
            channel: Some(channel),
            transcript,
            syscalls,
            transcript_start: 0,
            use_transcript: true,
        }
    }

    /// Position of the first delivery not baked into the worker's starting state.
    pub fn starting_at(mut self, transcript_start: TranscriptPos) -> Self {
        self.transcript_start = transcript_start;
        self
    }

    pub fn without_transcript(mut self) -> Self {
        self.use_transcript = false;
        self
    }

    pub fn transcript_start(&self) -> TranscriptPos {
        self.transcript_start
    }

    pub fn transcript(&self) -> &TranscriptManager {
        &self.transcript
    }

    /// Stop the worker after a failed exchange. Its state is no longer
    /// trusted; the shutdown request is best effort.
    async fn abandon_worker(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        let name = channel.name().to_string();
        log::warn!("abandoning worker {name} for vat {}", self.vat_id);
        if let Err(err) = channel.close().await {
            log::debug!("worker {name} did not shut down cleanly: {err}");
        }
    }
}

#[async_trait]
impl VatManager for WorkerVatManager {
    fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    async fn deliver(&mut self, delivery: Value) -> KernelResult<Value> {
        self.transcript.check_replay_error()?;
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| KernelError::NoWorker(self.vat_id.clone()))?;
        if self.use_transcript || self.transcript.in_replay() {
            self.transcript.start_dispatch(delivery.clone());
        }
        let mut upcalls = ManagerUpcalls {
            vat_id: &self.vat_id,
            transcript: &mut self.transcript,
            syscalls: self.syscalls.as_ref(),
        };
        let outcome = channel
            .call(ManagerRequest::Deliver(delivery), &mut upcalls)
            .await;
        match outcome {
            Ok(WorkerReply::Ok(result)) => {
                self.transcript.finish_dispatch()?;
                Ok(result)
            }
            Ok(other) => {
                self.abandon_worker().await;
                Err(KernelError::Worker {
                    vat_id: self.vat_id.clone(),
                    message: format!("unexpected delivery reply {other:?}"),
                })
            }
            Err(err) => {
                self.abandon_worker().await;
                Err(err.into())
            }
        }
    }

    async fn replay_transcript(&mut self) -> KernelResult<u64> {
        let entries = self.transcript.keeper().get_transcript(self.transcript_start)?;
        if entries.is_empty() {
            return Ok(0);
        }
        log::debug!(
            "replaying {} deliveries for vat {} from position {}",
            entries.len(),
            self.vat_id,
            self.transcript_start
        );
        self.transcript.start_replay();
        let mut replayed = 0;
        for PositionedEntry { pos, entry } in entries {
            if let Err(err) = self.replay_one_delivery(entry.d, entry.syscalls, pos).await {
                self.transcript.finish_replay();
                return Err(err);
            }
            replayed += 1;
        }
        self.transcript.finish_replay();
        Ok(replayed)
    }

    async fn replay_one_delivery(
        &mut self,
        delivery: Value,
        syscalls: Vec<SyscallRecord>,
        delivery_num: TranscriptPos,
    ) -> KernelResult<Value> {
        let was_replaying = self.transcript.in_replay();
        if !was_replaying {
            self.transcript.start_replay();
        }
        self.transcript.start_replay_delivery(syscalls);
        let outcome = self.deliver(delivery).await;
        let finished = self.transcript.finish_replay_delivery(delivery_num);
        if !was_replaying {
            self.transcript.finish_replay();
        }
        finished?;
        outcome
    }

    async fn make_snapshot(&mut self, store: &SnapStore) -> KernelResult<SnapshotResult> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| KernelError::NoWorker(self.vat_id.clone()))?;
        let result = store
            .save(|path| async move {
                channel
                    .call_ok(ManagerRequest::Snapshot { path }, &mut RejectSyscalls)
                    .await?;
                Ok::<_, KernelError>(())
            })
            .await?;
        log::info!(
            "snapshot {} of vat {}: {} bytes raw, {} compressed",
            result.hash,
            self.vat_id,
            result.raw_size,
            result.compressed_size
        );
        Ok(result)
    }

    async fn shutdown(&mut self) -> KernelResult<()> {
        match self.channel.take() {
            Some(channel) => Ok(channel.close().await?),
            None => Ok(()),
        }
    }
}
