use std::sync::{Arc, Mutex, PoisonError};

use vat_codec::Hash;

use super::{JournalError, PositionedEntry, SpanHash, TranscriptLog, TranscriptPos};
use crate::vat::TranscriptEntry;

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<TranscriptEntry>,
    span: SpanHash,
}

/// In-memory transcript log. Clones share the same entries, which lets tests
/// inspect or tamper with a log that a keeper owns.
#[derive(Debug, Default, Clone)]
pub struct MemTranscriptLog {
    inner: Arc<Mutex<Inner>>,
}

impl MemTranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.lock().entries.clone()
    }

    /// Overwrite the entry at `pos` in place. The span hash is not recomputed.
    pub fn replace(&self, pos: TranscriptPos, entry: TranscriptEntry) -> Result<(), JournalError> {
        let mut inner = self.lock();
        let slot = inner
            .entries
            .get_mut(pos as usize)
            .ok_or_else(|| JournalError::Corrupt(format!("no entry at position {pos}")))?;
        *slot = entry;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TranscriptLog for MemTranscriptLog {
    fn append(&mut self, entry: &TranscriptEntry) -> Result<TranscriptPos, JournalError> {
        let mut inner = self.lock();
        inner.span.update(entry)?;
        let pos = inner.entries.len() as TranscriptPos;
        inner.entries.push(entry.clone());
        Ok(pos)
    }

    fn load_from(&self, from: TranscriptPos) -> Result<Vec<PositionedEntry>, JournalError> {
        Ok(self
            .entries()
            .into_iter()
            .enumerate()
            .map(|(pos, entry)| PositionedEntry {
                pos: pos as TranscriptPos,
                entry,
            })
            .filter(|positioned| positioned.pos >= from)
            .collect())
    }

    fn next_pos(&self) -> TranscriptPos {
        self.lock().entries.len() as TranscriptPos
    }

    fn span_hash(&self) -> Hash {
        self.lock().span.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_and_load_round_trip() {
        let mut log = MemTranscriptLog::new();
        log.append(&TranscriptEntry::new(json!(["message", "first"])))
            .unwrap();
        log.append(&TranscriptEntry::new(json!(["message", "second"])))
            .unwrap();

        let all = log.load_from(0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].pos, 0);
        assert_eq!(all[1].entry.d, json!(["message", "second"]));

        let tail = log.load_from(1).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].pos, 1);
        assert_eq!(log.next_pos(), 2);
    }

    #[test]
    fn clones_share_entries() {
        let mut log = MemTranscriptLog::new();
        let view = log.clone();
        log.append(&TranscriptEntry::new(json!(["bringOutYourDead"])))
            .unwrap();
        assert_eq!(view.entries().len(), 1);
        assert_eq!(view.span_hash(), log.span_hash());
    }
}
