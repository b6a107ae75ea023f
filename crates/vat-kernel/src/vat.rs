use crate::journal::TranscriptPos;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use vat_codec::Hash;

/// Stable identifier of a vat across restarts, e.g. `v7`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VatId(String);

impl VatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VatId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for VatId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VatKind {
    Static,
    Dynamic,
}

/// Where a vat's program comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VatSource {
    Bundle(Value),
    BundleId(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VatOptions {
    pub name: Option<String>,
    pub enable_pipelining: bool,
    pub vat_parameters: Value,
    pub virtual_object_cache_size: Option<u64>,
    pub use_transcript: bool,
}

impl Default for VatOptions {
    fn default() -> Self {
        Self {
            name: None,
            enable_pipelining: false,
            vat_parameters: Value::Null,
            virtual_object_cache_size: None,
            use_transcript: true,
        }
    }
}

/// Persisted definition of a vat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VatSourceAndOptions {
    pub source: VatSource,
    pub options: VatOptions,
}

impl VatSourceAndOptions {
    pub fn bundle(bundle: Value) -> Self {
        Self {
            source: VatSource::Bundle(bundle),
            options: VatOptions::default(),
        }
    }

    pub fn with_options(mut self, options: VatOptions) -> Self {
        self.options = options;
        self
    }
}

/// One syscall a vat made during a delivery, with the answer it received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallRecord {
    pub d: Value,
    pub response: Value,
}

/// One delivery and every syscall it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub d: Value,
    #[serde(default)]
    pub syscalls: Vec<SyscallRecord>,
}

impl TranscriptEntry {
    pub fn new(delivery: Value) -> Self {
        Self {
            d: delivery,
            syscalls: Vec::new(),
        }
    }
}

/// Latest heap snapshot of a vat and the transcript position it covers.
///
/// Deliveries before `end_pos` are baked into the snapshot; recreating the vat
/// replays from `end_pos` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPointer {
    pub snapshot_id: Hash,
    pub end_pos: TranscriptPos,
}
