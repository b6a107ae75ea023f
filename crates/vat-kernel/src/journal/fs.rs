use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use vat_codec::{Hash, to_canonical_cbor};

use super::{JournalError, PositionedEntry, SpanHash, TranscriptLog, TranscriptPos};
use crate::vat::{TranscriptEntry, VatId};

const TRANSCRIPT_DIR: &str = "transcripts";

/// Filesystem-backed transcript log: one file per vat holding length-prefixed
/// canonical CBOR records.
#[derive(Debug)]
pub struct FsTranscriptLog {
    path: PathBuf,
    next_pos: TranscriptPos,
    span: SpanHash,
}

impl FsTranscriptLog {
    pub fn open(root: impl AsRef<Path>, vat_id: &VatId) -> Result<Self, JournalError> {
        let dir = root.as_ref().join(TRANSCRIPT_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{vat_id}.log"));
        if !path.exists() {
            File::create(&path)?;
        }
        let records = read_all_records(&path)?;
        let mut span = SpanHash::default();
        for record in &records {
            span.update(&record.entry)?;
        }
        let next_pos = records.last().map(|record| record.pos + 1).unwrap_or(0);
        Ok(Self {
            path,
            next_pos,
            span,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TranscriptLog for FsTranscriptLog {
    fn append(&mut self, entry: &TranscriptEntry) -> Result<TranscriptPos, JournalError> {
        let pos = self.next_pos;
        let record = PositionedEntry {
            pos,
            entry: entry.clone(),
        };
        let bytes = to_canonical_cbor(&record)?;
        let len = bytes.len();
        if len > u32::MAX as usize {
            return Err(JournalError::Corrupt("entry larger than 4GiB".into()));
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        file.write_all(&(len as u32).to_le_bytes())?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        self.span.update(entry)?;
        self.next_pos += 1;
        Ok(pos)
    }

    fn load_from(&self, from: TranscriptPos) -> Result<Vec<PositionedEntry>, JournalError> {
        let mut records = read_all_records(&self.path)?;
        records.retain(|record| record.pos >= from);
        Ok(records)
    }

    fn next_pos(&self) -> TranscriptPos {
        self.next_pos
    }

    fn span_hash(&self) -> Hash {
        self.span.current()
    }
}

fn read_all_records(path: &Path) -> Result<Vec<PositionedEntry>, JournalError> {
    let mut file = File::open(path)?;
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        let read = file.read(&mut len_buf)?;
        if read == 0 {
            break;
        }
        if read < len_buf.len() {
            file.read_exact(&mut len_buf[read..]).map_err(|err| {
                if err.kind() == ErrorKind::UnexpectedEof {
                    JournalError::Corrupt(format!("truncated length header (read {read} bytes)"))
                } else {
                    err.into()
                }
            })?;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        if let Err(err) = file.read_exact(&mut buf) {
            if err.kind() == ErrorKind::UnexpectedEof {
                return Err(JournalError::Corrupt("truncated entry payload".into()));
            }
            return Err(err.into());
        }
        let record: PositionedEntry = serde_cbor::from_slice(&buf)?;
        if record.pos != records.len() as TranscriptPos {
            return Err(JournalError::Corrupt(format!(
                "expected position {}, found {}",
                records.len(),
                record.pos
            )));
        }
        records.push(record);
    }
    Ok(records)
}
