use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use flate2::{Compression, write::GzEncoder};
use serde_json::{Value, json};
use tempfile::TempDir;
use vat_replay::{AuditEvent, AuditKind, ReplayConfig, ReplayDriver, ReplaySummary};

const RECORDED_SNAPSHOT: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn create_vat() -> Value {
    json!({
        "type": "create-vat",
        "vatID": "v1",
        "vatParameters": { "start": 10 },
        "vatSourceBundle": { "moduleFormat": "builtin", "name": "counter" },
    })
}

fn increment(num: u64, count: i64) -> Value {
    json!({
        "transcriptNum": num,
        "d": ["message", "o+0", { "methargs": { "method": "increment", "args": [] } }],
        "syscalls": [
            { "d": ["vatstoreSet", "count", count.to_string()], "response": ["ok", null] }
        ],
    })
}

fn read(num: u64, count: i64) -> Value {
    json!({
        "transcriptNum": num,
        "d": ["message", "o+0", { "methargs": { "method": "read", "args": [] } }],
        "syscalls": [
            { "d": ["vatstoreGet", "count"], "response": ["ok", count.to_string()] }
        ],
    })
}

fn ndjson(records: &[Value]) -> String {
    records.iter().map(|r| format!("{r}\n")).collect()
}

struct Fixture {
    tmp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            tmp: TempDir::new().unwrap(),
        }
    }

    fn config(&self) -> ReplayConfig {
        let snapshots = self.tmp.path().join("snapshots");
        fs::create_dir_all(&snapshots).unwrap();
        ReplayConfig {
            snapshot_dir: snapshots,
            audit_log_path: self.audit_path(),
            forced_snapshot_interval: 0,
            ..ReplayConfig::default()
        }
    }

    fn audit_path(&self) -> PathBuf {
        self.tmp.path().join("snapshot-activity.jsonl")
    }

    fn write(&self, name: &str, records: &[Value]) -> PathBuf {
        let path = self.tmp.path().join(name);
        fs::write(&path, ndjson(records)).unwrap();
        path
    }

    fn write_gz(&self, name: &str, records: &[Value]) -> PathBuf {
        let path = self.tmp.path().join(name);
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(ndjson(records).as_bytes()).unwrap();
        encoder.finish().unwrap();
        path
    }

    fn audit(&self) -> Vec<AuditEvent> {
        read_audit(&self.audit_path())
    }
}

fn read_audit(path: &Path) -> Vec<AuditEvent> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn replays_a_plain_transcript() -> Result<()> {
    let fx = Fixture::new();
    let transcript = fx.write(
        "transcript.jsonl",
        &[create_vat(), increment(0, 11), read(1, 11), increment(2, 12)],
    );
    let summary = ReplayDriver::new(fx.config())?.replay(&transcript).await?;
    assert_eq!(
        summary,
        ReplaySummary {
            lines: 4,
            deliveries: 3,
            ..ReplaySummary::default()
        }
    );
    let audit = fx.audit();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, AuditKind::Create);
    assert_eq!(audit[0].vat_id.as_str(), "v1");
    Ok(())
}

#[tokio::test]
async fn replays_a_gzipped_transcript() -> Result<()> {
    let fx = Fixture::new();
    let transcript = fx.write_gz(
        "transcript.jsonl.gz",
        &[create_vat(), increment(0, 11), increment(1, 12)],
    );
    let summary = ReplayDriver::new(fx.config())?.replay(&transcript).await?;
    assert_eq!(summary.deliveries, 2);
    Ok(())
}

#[tokio::test]
async fn forced_snapshots_are_audited() -> Result<()> {
    let fx = Fixture::new();
    let config = ReplayConfig {
        forced_snapshot_initial: 1,
        forced_snapshot_interval: 2,
        ..fx.config()
    };
    let transcript = fx.write(
        "transcript.jsonl",
        &[
            create_vat(),
            increment(0, 11),
            increment(1, 12),
            increment(2, 13),
            increment(3, 14),
        ],
    );
    let driver = ReplayDriver::new(config)?;
    let summary = driver.replay(&transcript).await?;
    assert_eq!(summary.forced_snapshots, 2);

    let saves: Vec<AuditEvent> = fx
        .audit()
        .into_iter()
        .filter(|event| event.kind == AuditKind::Save)
        .collect();
    assert_eq!(saves.len(), 2);
    assert_eq!(saves[0].transcript_num, Some(1));
    assert_eq!(saves[1].transcript_num, Some(3));
    assert!(saves[0].save_snapshot_id.is_none());
    let hash = vat_codec::Hash::from_hex_str(saves[1].snapshot_id.as_deref().unwrap())?;
    assert!(driver.snap_store().has_hash(&hash));
    Ok(())
}

#[tokio::test]
async fn divergent_syscall_aborts_and_keeps_the_audit_log() -> Result<()> {
    let fx = Fixture::new();
    let transcript = fx.write(
        "transcript.jsonl",
        &[create_vat(), increment(0, 11), increment(1, 99), increment(2, 13)],
    );
    let err = ReplayDriver::new(fx.config())?
        .replay(&transcript)
        .await
        .unwrap_err();
    let chain = format!("{err:#}");
    assert!(chain.contains("line 3"), "{chain}");
    assert!(chain.contains("historical inaccuracy in replay of v1"), "{chain}");
    assert_eq!(fx.audit().len(), 1);
    Ok(())
}

#[tokio::test]
async fn transcript_must_start_with_a_vat() -> Result<()> {
    let fx = Fixture::new();
    let transcript = fx.write("transcript.jsonl", &[increment(0, 11)]);
    let err = ReplayDriver::new(fx.config())?
        .replay(&transcript)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("first record of transcript"));
    Ok(())
}

fn save_then_load() -> Vec<Value> {
    vec![
        create_vat(),
        increment(0, 11),
        json!({ "type": "heap-snapshot-save", "snapshotID": RECORDED_SNAPSHOT }),
        json!({ "type": "heap-snapshot-load", "snapshotID": RECORDED_SNAPSHOT }),
        increment(1, 12),
        read(2, 12),
    ]
}

#[tokio::test]
async fn rewritten_snapshot_ids_still_resolve() -> Result<()> {
    let fx = Fixture::new();
    let config = ReplayConfig {
        ignore_snapshot_hash_differences: true,
        ..fx.config()
    };
    let transcript = fx.write("transcript.jsonl", &save_then_load());
    let summary = ReplayDriver::new(config)?.replay(&transcript).await?;
    assert_eq!(summary.hash_mismatches, 1);
    assert_eq!(summary.snapshots_saved, 1);
    assert_eq!(summary.snapshots_loaded, 1);
    assert_eq!(summary.deliveries, 3);

    let audit = fx.audit();
    let kinds: Vec<AuditKind> = audit.iter().map(|event| event.kind).collect();
    assert_eq!(kinds, vec![AuditKind::Create, AuditKind::Save, AuditKind::Load]);
    let saved = audit[1].snapshot_id.clone().unwrap();
    assert_eq!(audit[1].save_snapshot_id.as_deref(), Some(RECORDED_SNAPSHOT));
    assert_eq!(audit[1].transcript_num, Some(0));
    assert_eq!(audit[2].snapshot_id.as_deref(), Some(RECORDED_SNAPSHOT));
    assert_eq!(audit[2].load_snapshot_id, Some(saved));
    Ok(())
}

#[tokio::test]
async fn snapshot_hash_mismatch_is_fatal_by_default() -> Result<()> {
    let fx = Fixture::new();
    let transcript = fx.write("transcript.jsonl", &save_then_load());
    let err = ReplayDriver::new(fx.config())?
        .replay(&transcript)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("snapshot hash does not match"));
    // The save is audited before the run aborts.
    let audit = fx.audit();
    assert_eq!(audit.last().map(|event| event.kind), Some(AuditKind::Save));
    Ok(())
}
