//! The dedup index: keys already present in the metadata side-store.
//!
//! Only the primary-key column is read, through a parquet projection mask, so
//! loading the index stays cheap even for large side-stores. The footer's row
//! count is kept as well; vector archives are reconciled against it.

use crate::error::IngestError;
use crate::logging::RunLog;
use crate::store::metadata::key_strings;
use anyhow::{Context, Result};
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

/// Keys already archived by earlier runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessedIndex {
    keys: HashSet<String>,
    rows: u64,
}

impl ProcessedIndex {
    /// Load the key column of the side-store at `path`.
    ///
    /// A missing file yields an empty index.
    ///
    /// # Errors
    /// An existing file that cannot be decoded is reported as
    /// [`IngestError::CorruptSideStore`], which is fatal.
    pub fn load(path: &Path, pkey_field: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let corrupt = |reason: String| IngestError::CorruptSideStore {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| corrupt(e.to_string()))?;
        let rows = u64::try_from(builder.metadata().file_metadata().num_rows())
            .map_err(|_| corrupt("negative row count in footer".into()))?;
        let idx = builder
            .schema()
            .index_of(pkey_field)
            .map_err(|_| corrupt(format!("no '{pkey_field}' column")))?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [idx]);
        let reader = builder
            .with_projection(mask)
            .build()
            .map_err(|e| corrupt(e.to_string()))?;

        let mut keys = HashSet::new();
        for batch in reader {
            let batch = batch.map_err(|e| corrupt(e.to_string()))?;
            keys.extend(key_strings(batch.column(0)).map_err(corrupt)?);
        }
        Ok(Self { keys, rows })
    }

    /// Build from keys directly.
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: HashSet<String> = keys.into_iter().map(Into::into).collect();
        let rows = keys.len() as u64;
        Self { keys, rows }
    }

    /// Map every stored key to a record key; keys mapped to `None` are dropped.
    #[must_use]
    pub fn normalized<F>(self, f: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            keys: self.keys.iter().filter_map(|k| f(k)).collect(),
            rows: self.rows,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Rows in the side-store, shots included.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

/// Load the dedup index for a run and report what was found.
///
/// # Errors
/// See [`ProcessedIndex::load`].
pub fn load_processed(path: &Path, pkey_field: &str, log: &RunLog) -> Result<ProcessedIndex> {
    if !path.exists() {
        log.info(format!("No previous output file at {}", path.display()));
    }
    ProcessedIndex::load(path, pkey_field)
}
