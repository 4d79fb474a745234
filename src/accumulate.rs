//! Runs a processor over one batch and gathers the results.
//!
//! Record-level failures stop here: every rejected record is logged with its
//! key, path and reason, and the rest of the batch carries on. Parsing may run
//! on a `rayon` pool, but results are always validated and stacked in batch
//! order on the calling thread.

use crate::batch::Batch;
use crate::config::Parallelism;
use crate::error::RecordError;
use crate::locate::Candidate;
use crate::logging::RunLog;
use crate::processor::{Layout, RecordProcessor};
use crate::record::{ColumnarTable, Matrix, Payload, ProcessedRecord};
use crate::store::BatchPayload;
use anyhow::{Result, ensure};

type Outcome = Result<Option<ProcessedRecord>, RecordError>;

/// Everything a batch contributes to the stores.
#[derive(Clone, Debug, PartialEq)]
pub struct AccumulatedBatch {
    pub label: String,
    pub payload: BatchPayload,
    /// Columnar metadata, one row per shot, aligned with `payload`.
    pub metadata: ColumnarTable,
    /// Records accepted.
    pub records: usize,
    /// Records dropped.
    pub skipped: usize,
}

impl AccumulatedBatch {
    /// Shots (rows) in the batch.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.payload.shot_count()
    }
}

/// Drives a [`RecordProcessor`] over batches.
pub struct BatchAccumulator<'a> {
    processor: &'a dyn RecordProcessor,
    log: &'a RunLog,
    parallelism: Parallelism,
}

impl<'a> BatchAccumulator<'a> {
    #[must_use]
    pub fn new(processor: &'a dyn RecordProcessor, log: &'a RunLog) -> Self {
        Self {
            processor,
            log,
            parallelism: Parallelism::Sequential,
        }
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    fn process_all(&self, items: &[Candidate]) -> Vec<Outcome> {
        match self.parallelism {
            Parallelism::Sequential => items
                .iter()
                .map(|c| self.processor.process(c, self.log))
                .collect(),
            #[cfg(feature = "parallel")]
            Parallelism::Parallel { threads } => {
                use rayon::prelude::*;
                // ok() to ignore "already built" on later batches
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads.unwrap_or_else(num_cpus::get))
                    .build_global()
                    .ok();
                items
                    .par_iter()
                    .map(|c| self.processor.process(c, self.log))
                    .collect()
            }
            #[cfg(not(feature = "parallel"))]
            Parallelism::Parallel { .. } => items
                .iter()
                .map(|c| self.processor.process(c, self.log))
                .collect(),
        }
    }

    /// Process `batch`. Returns `None`, after logging an error, when no record
    /// survived.
    ///
    /// # Errors
    /// Only failures of the batch-level derived-column hook are returned.
    pub fn accumulate(&self, batch: &Batch) -> Result<Option<AccumulatedBatch>> {
        let settings = self.processor.settings();
        let pkey = settings.pkey_field.as_str();
        let mut payload = match settings.layout {
            Layout::Vector { channels } => BatchPayload::Rows(Matrix::empty(channels)),
            Layout::Trajectory => BatchPayload::Trajectories(Vec::new()),
        };
        let mut metadata = ColumnarTable::new();
        let mut records = 0;
        let mut skipped = 0;

        for (candidate, outcome) in batch.items.iter().zip(self.process_all(&batch.items)) {
            let admitted = outcome
                .and_then(|r| {
                    r.ok_or_else(|| RecordError::Skipped("processor returned no record".into()))
                })
                .and_then(|r| admit(&mut payload, &mut metadata, r, pkey));
            match admitted {
                Ok(()) => records += 1,
                Err(e) => {
                    skipped += 1;
                    self.log.record_skipped(&candidate.key, &candidate.path, e);
                }
            }
        }

        if records == 0 {
            self.log.error(format!(
                "{}: none of {} records could be processed; nothing written",
                batch.label,
                batch.len()
            ));
            return Ok(None);
        }

        self.processor.derive_batch_columns(&mut metadata, &payload)?;
        ensure!(
            metadata.row_count() == payload.shot_count(),
            "{}: metadata has {} rows for {} shots after deriving batch columns",
            batch.label,
            metadata.row_count(),
            payload.shot_count()
        );

        Ok(Some(AccumulatedBatch {
            label: batch.label.clone(),
            payload,
            metadata,
            records,
            skipped,
        }))
    }
}

/// Validate one record against the batch so far and append it.
/// Nothing is modified when an error is returned.
fn admit(
    payload: &mut BatchPayload,
    metadata: &mut ColumnarTable,
    record: ProcessedRecord,
    pkey: &str,
) -> Result<(), RecordError> {
    let Some(keys) = record.metadata.shot_count(pkey) else {
        return Err(RecordError::Metadata(format!("missing primary-key field '{pkey}'")));
    };
    let shots = record.payload.shot_count();
    if shots != keys {
        return Err(RecordError::shape(
            format!("{keys} shots to match '{pkey}'"),
            format!("{shots} shots"),
        ));
    }
    metadata.check_record(&record.metadata, shots)?;

    match (payload, record.payload) {
        (BatchPayload::Rows(all), Payload::Vector(rows)) => all.append(&rows)?,
        (BatchPayload::Trajectories(all), Payload::Trajectories(t)) => all.extend(t),
        (BatchPayload::Rows(_), Payload::Trajectories(_)) => {
            return Err(RecordError::shape("a vector payload", "trajectories"));
        }
        (BatchPayload::Trajectories(_), Payload::Vector(_)) => {
            return Err(RecordError::shape("trajectories", "a vector payload"));
        }
    }
    metadata.push_record(&record.metadata, shots);
    Ok(())
}
