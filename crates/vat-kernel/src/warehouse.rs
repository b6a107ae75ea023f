//! The vat warehouse keeps a bounded set of vats resident.
//!
//! Every delivery goes through [`VatWarehouse::deliver_to_vat`]. The target
//! becomes the most recently used vat; if that pushes the recency list past
//! the limit, the least recently used vat is evicted first.
//! Bringing a vat online means starting a worker (from its latest snapshot
//! when there is one) and replaying the transcript entries the worker's
//! starting state does not cover.
//!
//! Once concurrent callers settle, the resident vats are exactly the vats in
//! the recency list. A vat is only inserted while it holds a recency slot.
//! Every vat pushed out of the list goes through `evict_displaced`, which
//! takes it offline unless it was used again in the meantime.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use vat_snapstore::{SnapStore, SnapshotResult};

use crate::{
    config::WarehousePolicy,
    error::{KernelError, KernelResult},
    keeper::KernelKeeper,
    loader::VatLoader,
    manager::VatManager,
    transcript::{CompareSyscalls, RequireIdentical, TranscriptManager},
    vat::{SnapshotPointer, VatId, VatKind, VatSourceAndOptions},
};

/// Called with the underlying error when a vat fails in a way the kernel
/// cannot recover from, e.g. a replay divergence.
pub type PanicHook = Arc<dyn Fn(&KernelError) + Send + Sync>;

/// Default panic hook: log and abort the process.
pub fn abort_on_panic() -> PanicHook {
    Arc::new(|err| {
        log::error!("kernel panic: {err}");
        std::process::abort();
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VatLookup {
    pub enable_pipelining: bool,
}

/// A resident vat.
#[derive(Clone)]
pub struct WarehouseEntry {
    manager: Arc<AsyncMutex<Box<dyn VatManager>>>,
    enable_pipelining: bool,
}

impl WarehouseEntry {
    pub fn enable_pipelining(&self) -> bool {
        self.enable_pipelining
    }
}

/// Recency list with a fixed capacity.
#[derive(Debug)]
pub(crate) struct Lru {
    capacity: usize,
    order: VecDeque<VatId>,
}

impl Lru {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
        }
    }

    /// Mark `vat_id` most recently used. Returns the vat that fell off the
    /// end, if the list grew past capacity.
    pub(crate) fn touch(&mut self, vat_id: &VatId) -> Option<VatId> {
        if self.order.back() == Some(vat_id) {
            return None;
        }
        if let Some(pos) = self.order.iter().position(|id| id == vat_id) {
            self.order.remove(pos);
        }
        self.order.push_back(vat_id.clone());
        if self.order.len() > self.capacity {
            self.order.pop_front()
        } else {
            None
        }
    }

    pub(crate) fn contains(&self, vat_id: &VatId) -> bool {
        self.order.contains(vat_id)
    }

    pub(crate) fn remove(&mut self, vat_id: &VatId) {
        self.order.retain(|id| id != vat_id);
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
    }

    /// Least recently used first.
    pub(crate) fn recency(&self) -> Vec<VatId> {
        self.order.iter().cloned().collect()
    }
}

struct State {
    entries: HashMap<VatId, WarehouseEntry>,
    lru: Lru,
}

impl State {
    /// Whether `entry` is still the resident entry for `vat_id`.
    fn holds(&self, vat_id: &VatId, entry: &WarehouseEntry) -> bool {
        self.entries
            .get(vat_id)
            .is_some_and(|resident| Arc::ptr_eq(&resident.manager, &entry.manager))
    }
}

pub struct VatWarehouse {
    kernel_keeper: Arc<dyn KernelKeeper>,
    loader: Arc<dyn VatLoader>,
    policy: WarehousePolicy,
    compare: Arc<dyn CompareSyscalls>,
    panic_hook: PanicHook,
    state: Mutex<State>,
    // One gate per vat so that concurrent requests bring a vat online once.
    residency: Mutex<HashMap<VatId, Arc<AsyncMutex<()>>>>,
}

impl VatWarehouse {
    pub fn new(
        kernel_keeper: Arc<dyn KernelKeeper>,
        loader: Arc<dyn VatLoader>,
        policy: WarehousePolicy,
    ) -> Self {
        Self {
            kernel_keeper,
            loader,
            state: Mutex::new(State {
                entries: HashMap::new(),
                lru: Lru::new(policy.max_vats_online),
            }),
            policy,
            compare: Arc::new(RequireIdentical::default()),
            panic_hook: abort_on_panic(),
            residency: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_comparator(mut self, compare: Arc<dyn CompareSyscalls>) -> Self {
        self.compare = compare;
        self
    }

    pub fn with_panic_hook(mut self, hook: PanicHook) -> Self {
        self.panic_hook = hook;
        self
    }

    pub fn policy(&self) -> &WarehousePolicy {
        &self.policy
    }

    /// Bring every known vat online: static vats in declaration order, then
    /// dynamic vats in creation order.
    pub async fn start(&self) -> KernelResult<()> {
        for (name, vat_id) in self.kernel_keeper.get_static_vats() {
            log::info!("starting static vat {name} as {vat_id}");
            self.bring_online(&vat_id).await?;
        }
        for vat_id in self.kernel_keeper.get_dynamic_vats() {
            log::debug!("starting dynamic vat {vat_id}");
            self.bring_online(&vat_id).await?;
        }
        Ok(())
    }

    /// Allocate a new dynamic vat and bring it online.
    pub async fn create_dynamic_vat(
        &self,
        vat_id: &VatId,
        record: VatSourceAndOptions,
    ) -> KernelResult<()> {
        self.kernel_keeper
            .allocate_vat_keeper(vat_id, record, VatKind::Dynamic)?;
        self.apply_availability_policy(vat_id).await;
        self.ensure_resident(vat_id, false).await?;
        Ok(())
    }

    /// Deliver to a vat, bringing it online first if needed.
    ///
    /// A delivery that fails in the worker or the transcript takes the vat
    /// out of the warehouse, so the next delivery recreates it from its
    /// transcript.
    pub async fn deliver_to_vat(&self, vat_id: &VatId, delivery: Value) -> KernelResult<Value> {
        if self.kernel_keeper.get_vat_keeper(vat_id).is_none() {
            return Err(KernelError::UnknownVat(vat_id.clone()));
        }
        loop {
            self.apply_availability_policy(vat_id).await;
            let entry = match self.ensure_resident(vat_id, true).await {
                Ok(entry) => entry,
                Err(err) => return Err(self.panic(err)),
            };
            let mut manager = entry.manager.lock().await;
            if !self.is_current(vat_id, &entry) {
                log::debug!("vat {vat_id} was evicted before delivery, bringing it back");
                continue;
            }
            let outcome = manager.deliver(delivery).await;
            drop(manager);
            if outcome.is_err() {
                self.retire(vat_id, &entry).await;
            }
            return outcome;
        }
    }

    pub fn lookup(&self, vat_id: &VatId) -> Option<VatLookup> {
        if let Some(entry) = self.resident_entry(vat_id) {
            return Some(VatLookup {
                enable_pipelining: entry.enable_pipelining,
            });
        }
        self.kernel_keeper.get_vat_keeper(vat_id).map(|keeper| VatLookup {
            enable_pipelining: keeper.get_source_and_options().options.enable_pipelining,
        })
    }

    /// Take a vat offline. Succeeds without effect when the vat is known but
    /// not resident.
    pub async fn evict(&self, vat_id: &VatId, make_snapshot: bool) -> KernelResult<()> {
        if make_snapshot {
            return Err(KernelError::SnapshotOnEvict(vat_id.clone()));
        }
        let gate = self.residency_gate(vat_id);
        let _gate = gate.lock().await;
        let entry = {
            let mut state = self.lock_state();
            state.lru.remove(vat_id);
            state.entries.remove(vat_id)
        };
        let Some(entry) = entry else {
            return match self.kernel_keeper.get_vat_keeper(vat_id) {
                Some(_) => Ok(()),
                None => Err(KernelError::UnknownVat(vat_id.clone())),
            };
        };
        log::debug!("evicting vat {vat_id}");
        let mut manager = entry.manager.lock().await;
        manager.shutdown().await
    }

    pub async fn vat_was_terminated(&self, vat_id: &VatId) {
        if let Err(err) = self.evict(vat_id, false).await {
            log::debug!("ignoring eviction failure for terminated vat {vat_id}: {err}");
        }
        // A gate still shared with an in-flight caller must outlive it.
        let mut gates = self.residency.lock().unwrap_or_else(PoisonError::into_inner);
        if gates.get(vat_id).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(vat_id);
        }
    }

    /// Snapshot a resident vat, record the snapshot as its latest, and queue
    /// the snapshot it replaces for deletion.
    pub async fn snapshot_vat(
        &self,
        vat_id: &VatId,
        store: &SnapStore,
    ) -> KernelResult<SnapshotResult> {
        let keeper = self
            .kernel_keeper
            .get_vat_keeper(vat_id)
            .ok_or_else(|| KernelError::UnknownVat(vat_id.clone()))?;
        let entry = self
            .resident_entry(vat_id)
            .ok_or_else(|| KernelError::NoWorker(vat_id.clone()))?;
        let mut manager = entry.manager.lock().await;
        let result = manager.make_snapshot(store).await?;
        let previous = keeper.get_last_snapshot();
        keeper.save_snapshot(SnapshotPointer {
            snapshot_id: result.hash,
            end_pos: keeper.transcript_len(),
        })?;
        if let Some(previous) = previous {
            if previous.snapshot_id != result.hash {
                store.prepare_to_delete(previous.snapshot_id);
            }
        }
        Ok(result)
    }

    /// Resident vats, sorted by id.
    pub fn active_vat_ids(&self) -> Vec<VatId> {
        let mut ids: Vec<VatId> = self.lock_state().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Vats in recency order, least recently used first.
    pub fn recency(&self) -> Vec<VatId> {
        self.lock_state().lru.recency()
    }

    pub fn is_resident(&self, vat_id: &VatId) -> bool {
        self.lock_state().entries.contains_key(vat_id)
    }

    /// Shut down every resident vat.
    pub async fn shutdown(&self) -> KernelResult<()> {
        let entries: Vec<(VatId, WarehouseEntry)> = {
            let mut state = self.lock_state();
            state.lru.clear();
            state.entries.drain().collect()
        };
        for (vat_id, entry) in entries {
            let mut manager = entry.manager.lock().await;
            if let Err(err) = manager.shutdown().await {
                log::warn!("failed to shut down vat {vat_id}: {err}");
            }
        }
        Ok(())
    }

    async fn bring_online(&self, vat_id: &VatId) -> KernelResult<()> {
        self.apply_availability_policy(vat_id).await;
        match self.ensure_resident(vat_id, true).await {
            Ok(_) => Ok(()),
            Err(err) => Err(self.panic(err)),
        }
    }

    async fn apply_availability_policy(&self, vat_id: &VatId) {
        let victim = self.lock_state().lru.touch(vat_id);
        if let Some(victim) = victim {
            log::debug!("vat {vat_id} displaces least recently used vat {victim}");
            self.evict_displaced(&victim).await;
        }
    }

    /// Take a vat that fell off the recency list offline, unless it has been
    /// touched again since.
    async fn evict_displaced(&self, victim: &VatId) {
        let gate = self.residency_gate(victim);
        let _gate = gate.lock().await;
        let entry = {
            let mut state = self.lock_state();
            if state.lru.contains(victim) {
                None
            } else {
                state.entries.remove(victim)
            }
        };
        if let Some(entry) = entry {
            log::debug!("evicting vat {victim}");
            let mut manager = entry.manager.lock().await;
            if let Err(err) = manager.shutdown().await {
                log::warn!("failed to evict vat {victim}: {err}");
            }
        }
    }

    async fn ensure_resident(
        &self,
        vat_id: &VatId,
        recreate: bool,
    ) -> KernelResult<WarehouseEntry> {
        let (entry, displaced) = self.bring_up(vat_id, recreate).await?;
        if let Some(victim) = displaced {
            log::debug!("vat {vat_id} came back online and displaces {victim}");
            self.evict_displaced(&victim).await;
        }
        Ok(entry)
    }

    /// Start and register a worker for `vat_id` under its residency gate.
    ///
    /// If another caller pushed `vat_id` off the recency list while the worker
    /// was starting, the vat takes a slot again and the vat this displaces is
    /// returned for eviction once the gate is released.
    async fn bring_up(
        &self,
        vat_id: &VatId,
        recreate: bool,
    ) -> KernelResult<(WarehouseEntry, Option<VatId>)> {
        if let Some(entry) = self.resident_entry(vat_id) {
            return Ok((entry, None));
        }
        let gate = self.residency_gate(vat_id);
        let _gate = gate.lock().await;
        if let Some(entry) = self.resident_entry(vat_id) {
            return Ok((entry, None));
        }

        let (manager, enable_pipelining) = match self.start_manager(vat_id, recreate).await {
            Ok(started) => started,
            Err(err) => {
                self.lock_state().lru.remove(vat_id);
                return Err(err);
            }
        };
        let entry = WarehouseEntry {
            manager: Arc::new(AsyncMutex::new(manager)),
            enable_pipelining,
        };
        let mut state = self.lock_state();
        let displaced = if state.lru.contains(vat_id) {
            None
        } else {
            state.lru.touch(vat_id)
        };
        state.entries.insert(vat_id.clone(), entry.clone());
        Ok((entry, displaced))
    }

    async fn start_manager(
        &self,
        vat_id: &VatId,
        recreate: bool,
    ) -> KernelResult<(Box<dyn VatManager>, bool)> {
        let keeper = self
            .kernel_keeper
            .get_vat_keeper(vat_id)
            .ok_or_else(|| KernelError::UnknownVat(vat_id.clone()))?;
        let VatSourceAndOptions { source, options } = keeper.get_source_and_options();
        let transcript = TranscriptManager::new(keeper, self.compare.clone());
        let mut manager = if !recreate {
            self.loader
                .create_vat_dynamically(vat_id, &source, transcript, &options)
                .await?
        } else if self.kernel_keeper.get_dynamic_vats().contains(vat_id) {
            self.loader
                .recreate_dynamic_vat(vat_id, &source, transcript, &options)
                .await?
        } else {
            self.loader
                .recreate_static_vat(vat_id, &source, transcript, &options)
                .await?
        };

        match manager.replay_transcript().await {
            Ok(0) => {}
            Ok(replayed) => log::info!("vat {vat_id} replayed {replayed} deliveries"),
            Err(err) => {
                if let Err(shutdown_err) = manager.shutdown().await {
                    log::debug!("shutdown after failed replay of {vat_id}: {shutdown_err}");
                }
                return Err(err);
            }
        }
        Ok((manager, options.enable_pipelining))
    }

    /// Drop `entry` after a failed delivery, if it is still the vat's
    /// resident entry.
    async fn retire(&self, vat_id: &VatId, entry: &WarehouseEntry) {
        let gate = self.residency_gate(vat_id);
        let _gate = gate.lock().await;
        let removed = {
            let mut state = self.lock_state();
            let current = state.holds(vat_id, entry);
            if current {
                state.entries.remove(vat_id);
                state.lru.remove(vat_id);
            }
            current
        };
        if !removed {
            return;
        }
        log::warn!("vat {vat_id} left the warehouse after a failed delivery");
        let mut manager = entry.manager.lock().await;
        if let Err(err) = manager.shutdown().await {
            log::debug!("shutdown of failed vat {vat_id}: {err}");
        }
    }

    fn is_current(&self, vat_id: &VatId, entry: &WarehouseEntry) -> bool {
        self.lock_state().holds(vat_id, entry)
    }

    fn panic(&self, err: KernelError) -> KernelError {
        log::error!("unrecoverable failure: {err}");
        (self.panic_hook)(&err);
        KernelError::Panicked(err.to_string())
    }

    fn resident_entry(&self, vat_id: &VatId) -> Option<WarehouseEntry> {
        self.lock_state().entries.get(vat_id).cloned()
    }

    fn residency_gate(&self, vat_id: &VatId) -> Arc<AsyncMutex<()>> {
        self.residency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(vat_id.clone())
            .or_default()
            .clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
