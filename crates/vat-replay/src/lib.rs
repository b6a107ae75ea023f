//! Offline replay of recorded vat transcripts.
//!
//! Reconstructs a vat from a transcript file and replays every delivery
//! against the recorded syscalls. Snapshots recorded in the transcript are
//! taken again; all snapshot activity goes to an audit log.

pub mod audit;
pub mod config;
pub mod driver;
pub mod record;

pub use audit::{AuditEvent, AuditKind, AuditLog};
pub use config::{DEFAULT_AUDIT_LOG, ReplayConfig, WorkerMode};
pub use driver::{ReplayDriver, ReplaySummary};
pub use record::{TranscriptRecord, open_transcript};
