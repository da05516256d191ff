//! Error types for trackdex-core.
//!
//! The taxonomy deliberately separates hard failures from soft signals:
//! lock timeouts and consistency mismatches are *return values* on the
//! coordinator (an operation that cannot proceed reports `-1`), while
//! [`IndexError`] covers faults that occur once an operation is underway.
//! Configuration problems (unwritable index root, zero batch size) are the
//! one hard category and must never be folded into a soft signal.

use thiserror::Error;

use crate::record::RecordId;
use crate::store::StoreError;

/// Fault raised by index plumbing: sub-index I/O, document writes, rebuild
/// flows.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Invalid or unusable configuration. Hard: surfaced distinctly and the
    /// operation is prevented, never silently skipped.
    #[error("index configuration error: {reason}")]
    Config { reason: String },

    /// Underlying tantivy failure.
    #[error("index engine error: {0}")]
    Engine(#[from] tantivy::TantivyError),

    /// Failed opening an index directory.
    #[error("index directory error: {0}")]
    Directory(#[from] std::io::Error),

    /// Record store collaborator failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A conditional replace found a newer document already in the index.
    /// Soft: the stale write is dropped and recorded, siblings proceed.
    #[error(
        "stale write for record {record_id}: existing stamp {existing} is newer than incoming {incoming}"
    )]
    Stale {
        record_id: RecordId,
        existing: u64,
        incoming: u64,
    },

    /// The queued-write worker for a sub-index has shut down.
    #[error("queued writer for sub-index '{name}' is closed")]
    WriterClosed { name: &'static str },

    /// A group commit failed; every write in the group reports this.
    #[error("commit failed on sub-index '{name}': {reason}")]
    Commit { name: &'static str, reason: String },

    /// The document builders produced nothing for a record that needed a
    /// primary document.
    #[error("no document produced for record {record_id}")]
    DocumentAbsent { record_id: RecordId },

    /// A background rebuild observed its cancellation flag. Distinguishable
    /// from failure; the post-walk fixup passes are skipped.
    #[error("background rebuild cancelled")]
    Cancelled,

    /// The index is disabled or its lock could not be acquired in time.
    #[error("index temporarily unavailable")]
    Unavailable,
}

impl IndexError {
    /// Shorthand for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether this error is the cooperative-cancellation signal rather than
    /// a genuine fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
