//! Per-vat transcript logs.

pub mod fs;
pub mod mem;

use crate::vat::TranscriptEntry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vat_codec::{Hash, canonical_json};

/// Monotonic position assigned to every persisted transcript entry.
pub type TranscriptPos = u64;

const SPAN_SEED: &[u8] = b"start of transcript span";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("entry encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// Append-only storage for one vat's transcript.
pub trait TranscriptLog: Send {
    fn append(&mut self, entry: &TranscriptEntry) -> Result<TranscriptPos, JournalError>;

    /// Entries at `from` and later. Passing 0 returns the full transcript.
    fn load_from(&self, from: TranscriptPos) -> Result<Vec<PositionedEntry>, JournalError>;

    /// Position the next append will receive.
    fn next_pos(&self) -> TranscriptPos;

    /// Rolling hash over every entry appended so far.
    fn span_hash(&self) -> Hash;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionedEntry {
    pub pos: TranscriptPos,
    pub entry: TranscriptEntry,
}

/// Rolling transcript hash: `h' = sha256(hex(h) ++ hex(sha256(item)))`, where
/// `item` is the canonical JSON of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanHash(Hash);

impl Default for SpanHash {
    fn default() -> Self {
        Self(Hash::of_bytes(SPAN_SEED))
    }
}

impl SpanHash {
    pub fn update(&mut self, entry: &TranscriptEntry) -> Result<(), JournalError> {
        let item = canonical_json(&serde_json::to_value(entry)?);
        let item_hash = Hash::of_bytes(item.as_bytes());
        self.0 = Hash::of_bytes(format!("{}{}", self.0, item_hash).as_bytes());
        Ok(())
    }

    pub fn current(&self) -> Hash {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn span_hash_depends_on_order_and_content() {
        let a = TranscriptEntry::new(json!(["message", "o+0", {"method": "a"}]));
        let b = TranscriptEntry::new(json!(["message", "o+0", {"method": "b"}]));

        let mut ab = SpanHash::default();
        ab.update(&a).unwrap();
        ab.update(&b).unwrap();
        let mut ba = SpanHash::default();
        ba.update(&b).unwrap();
        ba.update(&a).unwrap();
        assert_ne!(ab.current(), ba.current());
        assert_ne!(ab.current(), SpanHash::default().current());

        let mut again = SpanHash::default();
        again.update(&a).unwrap();
        again.update(&b).unwrap();
        assert_eq!(ab, again);
    }
}
