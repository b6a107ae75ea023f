//! Transcript file records.
//!
//! A transcript file holds one JSON record per line. Records carrying a
//! `type` field describe vat creation and snapshot activity; every other
//! record is a delivery.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vat_kernel::{SyscallRecord, VatId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVat {
    #[serde(rename = "vatID")]
    pub vat_id: VatId,
    #[serde(default)]
    pub vat_parameters: Value,
    pub vat_source_bundle: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotLoad {
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,
    #[serde(rename = "vatID", default)]
    pub vat_id: Option<VatId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSave {
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub transcript_num: u64,
    pub d: Value,
    #[serde(default)]
    pub syscalls: Vec<SyscallRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptRecord {
    CreateVat(CreateVat),
    HeapSnapshotLoad(SnapshotLoad),
    HeapSnapshotSave(SnapshotSave),
    Delivery(Delivery),
}

impl TranscriptRecord {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some("create-vat") => serde_json::from_value(value).map(Self::CreateVat),
            Some("heap-snapshot-load") => serde_json::from_value(value).map(Self::HeapSnapshotLoad),
            Some("heap-snapshot-save") => serde_json::from_value(value).map(Self::HeapSnapshotSave),
            _ => serde_json::from_value(value).map(Self::Delivery),
        }
    }
}

/// Open a transcript for line reading, gunzipping files whose name ends in `.gz`.
pub fn open_transcript(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let gzipped = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with(".gz"));
    Ok(if gzipped {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}
