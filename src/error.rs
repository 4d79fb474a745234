//! Error taxonomy for ingestion runs.
//!
//! Two tiers exist:
//!
//! - [`IngestError`] covers **fatal** conditions. These travel inside an
//!   [`anyhow::Error`] and abort the run for the affected dataset. Callers that
//!   need to branch on the cause can `downcast_ref::<IngestError>()`.
//! - [`RecordError`] covers **record-level** failures. The batch accumulator
//!   logs them and drops the record; they never escape a batch.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Unrecoverable conditions that abort an ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("existing metadata side-store {path} cannot be read: {reason}")]
    CorruptSideStore { path: PathBuf, reason: String },

    #[error("vector archive {path} holds {archive} channels but the batch has {batch}")]
    ChannelMismatch {
        path: PathBuf,
        archive: usize,
        batch: usize,
    },

    #[error("archive {path} is corrupt: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("vector archive has {archive_rows} rows but the side-store has {meta_rows}")]
    ArchiveOutOfSync { archive_rows: u64, meta_rows: u64 },

    #[error("metadata column '{field}' cannot be merged: {reason}")]
    SchemaMismatch { field: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A failure confined to a single record. The record is skipped.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The processor chose not to ingest this record (calibration file,
    /// not flagged for publication, ...).
    #[error("skipped: {0}")]
    Skipped(String),

    #[error("unparseable input: {0}")]
    Parse(String),

    #[error("shape mismatch: expected {expected}, found {found}")]
    Shape { expected: String, found: String },

    #[error("metadata problem: {0}")]
    Metadata(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RecordError {
    pub fn shape(expected: impl ToString, found: impl ToString) -> Self {
        Self::Shape {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}
