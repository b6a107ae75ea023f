use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};
use vat_kernel::VatId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    Create,
    Load,
    Save,
}

/// One line of the snapshot audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub transcript_file: String,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    #[serde(rename = "vatID")]
    pub vat_id: VatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_num: Option<u64>,
    /// Snapshot the event is about: the recorded id for loads, the computed
    /// hash for saves.
    #[serde(rename = "snapshotID", default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Id actually loaded after applying the rewrite map.
    #[serde(rename = "loadSnapshotID", default, skip_serializing_if = "Option::is_none")]
    pub load_snapshot_id: Option<String>,
    /// Id the transcript recorded for this save.
    #[serde(rename = "saveSnapshotID", default, skip_serializing_if = "Option::is_none")]
    pub save_snapshot_id: Option<String>,
}

impl AuditEvent {
    pub fn new(transcript_file: impl Into<String>, kind: AuditKind, vat_id: VatId) -> Self {
        Self {
            transcript_file: transcript_file.into(),
            kind,
            vat_id,
            transcript_num: None,
            snapshot_id: None,
            load_snapshot_id: None,
            save_snapshot_id: None,
        }
    }
}

/// Append-only JSON lines file. Every event is flushed as it is written so
/// the log survives an aborted run.
#[derive(Debug)]
pub struct AuditLog {
    file: File,
}

impl AuditLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, event: &AuditEvent) -> io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn events_are_appended_as_json_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("activity.jsonl");
        let mut log = AuditLog::open(&path).unwrap();
        log.append(&AuditEvent::new("t.jsonl", AuditKind::Create, VatId::new("v1")))
            .unwrap();
        drop(log);

        let mut log = AuditLog::open(&path).unwrap();
        let mut save = AuditEvent::new("t.jsonl", AuditKind::Save, VatId::new("v1"));
        save.transcript_num = Some(4);
        save.snapshot_id = Some("aa".into());
        log.append(&save).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            r#"{"transcriptFile":"t.jsonl","type":"create","vatID":"v1"}"#
        );
        let parsed: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, save);
    }
}
