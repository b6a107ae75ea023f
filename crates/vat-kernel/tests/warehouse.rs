use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use vat_kernel::{
    KernelError, KernelKeeper, MemKernelKeeper, TranscriptEntry, VatId, VatKind, VatKeeper,
    VatOptions, VatSourceAndOptions, VatWarehouse, VatstoreSyscalls, WarehousePolicy,
    WorkerVatLoader,
};
use vat_snapstore::SnapStore;
use vat_worker::InProcessLauncher;
use vat_worker_protocol::{
    FromWorker, ProtocolError, ProtocolResult, WorkerChannel, WorkerLauncher, WorkerReply,
    frame::{read_frame_async, write_frame_async},
};

fn counter() -> VatSourceAndOptions {
    VatSourceAndOptions::bundle(json!({ "moduleFormat": "builtin", "name": "counter" }))
}

fn message(method: &str, args: Value) -> Value {
    json!(["message", "o+0", { "methargs": { "method": method, "args": args } }])
}

fn vat(id: &str) -> VatId {
    VatId::new(id)
}

struct Harness {
    keeper: Arc<MemKernelKeeper>,
    syscalls: Arc<VatstoreSyscalls>,
    panics: Arc<Mutex<Vec<String>>>,
    warehouse: VatWarehouse,
}

fn harness(max_vats_online: usize, store: Option<Arc<SnapStore>>) -> Harness {
    harness_with(max_vats_online, store, Arc::new(InProcessLauncher))
}

fn harness_with(
    max_vats_online: usize,
    store: Option<Arc<SnapStore>>,
    launcher: Arc<dyn WorkerLauncher>,
) -> Harness {
    let keeper = Arc::new(MemKernelKeeper::new());
    let syscalls = Arc::new(VatstoreSyscalls::new());
    let mut loader = WorkerVatLoader::new(launcher, syscalls.clone());
    if let Some(store) = store {
        loader = loader.with_snap_store(store);
    }
    let panics = Arc::new(Mutex::new(Vec::new()));
    let recorded = panics.clone();
    let warehouse = VatWarehouse::new(
        keeper.clone(),
        Arc::new(loader),
        WarehousePolicy::with_max_vats_online(max_vats_online),
    )
    .with_panic_hook(Arc::new(move |err: &KernelError| {
        recorded.lock().unwrap().push(err.to_string());
    }));
    Harness {
        keeper,
        syscalls,
        panics,
        warehouse,
    }
}

impl Harness {
    fn allocate(&self, id: &str) -> Arc<dyn VatKeeper> {
        self.keeper
            .allocate_vat_keeper(&vat(id), counter(), VatKind::Dynamic)
            .unwrap()
    }

    async fn increment(&self, id: &str) -> Result<Value> {
        Ok(self
            .warehouse
            .deliver_to_vat(&vat(id), message("increment", json!([])))
            .await?)
    }

    fn count(&self, id: &str) -> Option<String> {
        self.syscalls.vatstore_get(&vat(id), "count")
    }
}

#[tokio::test]
async fn most_recently_used_vats_stay_resident() -> Result<()> {
    let h = harness(2, None);
    for id in ["v1", "v2", "v3"] {
        h.allocate(id);
    }
    for id in ["v1", "v2", "v1", "v3"] {
        h.increment(id).await?;
    }
    assert_eq!(h.warehouse.active_vat_ids(), vec![vat("v1"), vat("v3")]);
    assert_eq!(h.warehouse.recency(), vec![vat("v1"), vat("v3")]);
    h.warehouse.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_deliveries_respect_the_residency_limit() -> Result<()> {
    let ids = ["v0", "v1", "v2", "v3", "v4", "v5"];
    for _ in 0..5 {
        let h = Arc::new(harness(2, None));
        for id in ids {
            h.allocate(id);
        }
        let mut tasks = Vec::new();
        for _ in 0..4 {
            for id in ids {
                let h = h.clone();
                tasks.push(tokio::spawn(async move { h.increment(id).await }));
            }
        }
        for task in tasks {
            task.await??;
        }

        let active = h.warehouse.active_vat_ids();
        let mut recency = h.warehouse.recency();
        recency.sort();
        assert!(active.len() <= 2, "resident: {active:?}");
        assert_eq!(active, recency);
        for id in ids {
            assert_eq!(h.count(id).as_deref(), Some("4"), "vat {id}");
        }
        assert!(h.panics.lock().unwrap().is_empty());
        h.warehouse.shutdown().await?;
    }
    Ok(())
}

/// The first worker accepts its bundle and then exits on its first delivery.
/// Later launches get a regular in-process worker.
#[derive(Default)]
struct DiesOnFirstDelivery {
    launches: AtomicUsize,
}

#[async_trait]
impl WorkerLauncher for DiesOnFirstDelivery {
    async fn launch(&self, name: &str) -> ProtocolResult<WorkerChannel> {
        if self.launches.fetch_add(1, Ordering::SeqCst) > 0 {
            return InProcessLauncher.launch(name).await;
        }
        let (runtime_end, worker_end) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(worker_end);
            if let Ok(Some(_bundle)) = read_frame_async(&mut reader).await {
                let ready = FromWorker::Reply(WorkerReply::DispatchReady)
                    .encode()
                    .unwrap();
                write_frame_async(&mut writer, &ready).await.unwrap();
            }
            let _delivery = read_frame_async(&mut reader).await;
        });
        let (read_half, write_half) = tokio::io::split(runtime_end);
        Ok(WorkerChannel::new(
            name,
            Box::new(read_half),
            Box::new(write_half),
        ))
    }
}

#[tokio::test]
async fn dead_worker_is_recreated_on_next_delivery() -> Result<()> {
    let launcher = Arc::new(DiesOnFirstDelivery::default());
    let h = harness_with(2, None, launcher.clone());
    h.allocate("v1");

    let err = h.increment("v1").await.unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<KernelError>(),
            Some(KernelError::Protocol(ProtocolError::WorkerExited(_)))
        ),
        "{err:#}"
    );
    assert!(!h.warehouse.is_resident(&vat("v1")));
    assert!(h.warehouse.recency().is_empty());
    let keeper = h.keeper.get_vat_keeper(&vat("v1")).unwrap();
    assert_eq!(keeper.transcript_len(), 0);

    h.increment("v1").await?;
    h.increment("v1").await?;
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert_eq!(h.count("v1").as_deref(), Some("2"));
    assert_eq!(keeper.transcript_len(), 2);
    assert_eq!(h.warehouse.recency(), vec![vat("v1")]);
    assert!(h.panics.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn exceeding_the_limit_evicts_exactly_one_vat() -> Result<()> {
    let h = harness(3, None);
    for id in ["v1", "v2", "v3", "v4"] {
        h.warehouse.create_dynamic_vat(&vat(id), counter()).await?;
    }
    let active = h.warehouse.active_vat_ids();
    assert_eq!(active.len(), 3);
    assert!(!h.warehouse.is_resident(&vat("v1")));
    assert_eq!(active, vec![vat("v2"), vat("v3"), vat("v4")]);
    Ok(())
}

#[tokio::test]
async fn delivery_results_come_from_the_worker() -> Result<()> {
    let h = harness(5, None);
    h.allocate("v1");
    let ok = h.increment("v1").await?;
    assert_eq!(ok, json!(["ok", null, { "syscalls": 1 }]));
    let failed = h
        .warehouse
        .deliver_to_vat(&vat("v1"), message("fail", json!([])))
        .await?;
    assert_eq!(failed[0], json!("error"));
    // Failed deliveries are part of the transcript too.
    let keeper = h.keeper.get_vat_keeper(&vat("v1")).unwrap();
    assert_eq!(keeper.transcript_len(), 2);
    Ok(())
}

#[tokio::test]
async fn evicted_vat_resumes_from_its_transcript() -> Result<()> {
    let h = harness(1, None);
    h.allocate("v1");
    h.allocate("v2");
    h.increment("v1").await?;
    h.increment("v1").await?;
    h.increment("v2").await?;
    assert!(!h.warehouse.is_resident(&vat("v1")));

    h.increment("v1").await?;
    assert_eq!(h.count("v1").as_deref(), Some("3"));
    assert_eq!(h.count("v2").as_deref(), Some("1"));
    let keeper = h.keeper.get_vat_keeper(&vat("v1")).unwrap();
    assert_eq!(keeper.transcript_len(), 3);
    assert!(h.panics.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn evict_rules() -> Result<()> {
    let h = harness(4, None);
    h.allocate("v1");
    h.increment("v1").await?;

    let err = h.warehouse.evict(&vat("v1"), true).await.unwrap_err();
    assert!(matches!(err, KernelError::SnapshotOnEvict(_)));
    assert!(h.warehouse.is_resident(&vat("v1")));

    h.warehouse.evict(&vat("v1"), false).await?;
    assert!(!h.warehouse.is_resident(&vat("v1")));
    assert!(h.warehouse.recency().is_empty());
    // Known but offline.
    h.warehouse.evict(&vat("v1"), false).await?;

    let err = h.warehouse.evict(&vat("v404"), false).await.unwrap_err();
    assert!(matches!(err, KernelError::UnknownVat(_)));
    Ok(())
}

#[tokio::test]
async fn unknown_vat_is_not_a_panic() {
    let h = harness(4, None);
    let err = h
        .warehouse
        .deliver_to_vat(&vat("v9"), message("increment", json!([])))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::UnknownVat(_)));
    assert!(h.panics.lock().unwrap().is_empty());
}

#[tokio::test]
async fn start_brings_static_then_dynamic_vats_online() -> Result<()> {
    let h = harness(10, None);
    h.keeper.add_static_vat("bootstrap", "v1", counter())?;
    h.keeper.add_static_vat("timer", "v2", counter())?;
    h.allocate("v3");
    h.warehouse.start().await?;
    assert_eq!(
        h.warehouse.active_vat_ids(),
        vec![vat("v1"), vat("v2"), vat("v3")]
    );
    assert_eq!(h.warehouse.recency(), vec![vat("v1"), vat("v2"), vat("v3")]);
    Ok(())
}

#[tokio::test]
async fn start_failure_goes_through_the_panic_hook() -> Result<()> {
    let h = harness(10, None);
    h.keeper.add_static_vat(
        "broken",
        "v1",
        VatSourceAndOptions::bundle(json!({ "moduleFormat": "builtin", "name": "missing" })),
    )?;
    let err = h.warehouse.start().await.unwrap_err();
    assert!(matches!(err, KernelError::Panicked(_)));
    let panics = h.panics.lock().unwrap().clone();
    assert_eq!(panics.len(), 1);
    assert!(panics[0].contains("missing"), "{}", panics[0]);
    assert!(h.warehouse.active_vat_ids().is_empty());
    assert!(h.warehouse.recency().is_empty());
    Ok(())
}

#[tokio::test]
async fn lookup_reports_offline_vats() -> Result<()> {
    let h = harness(4, None);
    h.keeper.allocate_vat_keeper(
        &vat("v1"),
        counter().with_options(VatOptions {
            enable_pipelining: true,
            ..VatOptions::default()
        }),
        VatKind::Dynamic,
    )?;
    let lookup = h.warehouse.lookup(&vat("v1")).unwrap();
    assert!(lookup.enable_pipelining);
    assert!(!h.warehouse.is_resident(&vat("v1")));
    assert!(h.warehouse.lookup(&vat("v2")).is_none());
    Ok(())
}

#[tokio::test]
async fn terminated_vats_leave_the_warehouse() -> Result<()> {
    let h = harness(4, None);
    h.allocate("v1");
    h.increment("v1").await?;
    h.warehouse.vat_was_terminated(&vat("v1")).await;
    assert!(h.warehouse.active_vat_ids().is_empty());
    // Terminating an unknown vat is tolerated.
    h.warehouse.vat_was_terminated(&vat("v2")).await;
    Ok(())
}

#[tokio::test]
async fn snapshot_lets_recreation_skip_the_covered_prefix() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(SnapStore::open(tmp.path())?);
    let h = harness(1, Some(store.clone()));
    h.allocate("v1");
    h.allocate("v2");
    h.increment("v1").await?;
    h.increment("v1").await?;

    let first = h.warehouse.snapshot_vat(&vat("v1"), &store).await?;
    let keeper = h.keeper.get_vat_keeper(&vat("v1")).unwrap();
    let pointer = keeper.get_last_snapshot().unwrap();
    assert_eq!(pointer.snapshot_id, first.hash);
    assert_eq!(pointer.end_pos, 2);
    assert!(store.has_hash(&first.hash));

    h.increment("v1").await?;
    h.increment("v2").await?;
    assert!(!h.warehouse.is_resident(&vat("v1")));

    // Garbage before the snapshot point would fail a full replay.
    h.keeper
        .mem_transcript(&vat("v1"))
        .unwrap()
        .replace(0, TranscriptEntry::new(json!(["message", "o+0", "garbage"])))?;

    h.increment("v1").await?;
    assert_eq!(h.count("v1").as_deref(), Some("4"));
    assert!(h.panics.lock().unwrap().is_empty());

    // A newer snapshot queues the old one for deletion.
    let second = h.warehouse.snapshot_vat(&vat("v1"), &store).await?;
    assert_ne!(second.hash, first.hash);
    assert_eq!(store.pending_count(), 1);
    store.commit_deletes(false).await?;
    assert!(!store.has_hash(&first.hash));
    assert!(store.has_hash(&second.hash));
    Ok(())
}

#[tokio::test]
async fn snapshot_requires_a_resident_vat() {
    let tmp = TempDir::new().unwrap();
    let store = SnapStore::open(tmp.path()).unwrap();
    let h = harness(2, None);
    h.allocate("v1");
    let err = h
        .warehouse
        .snapshot_vat(&vat("v1"), &store)
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::NoWorker(_)));
}
