//! Ingestion runs.
//!
//! [`Ingestor::run`] performs one incremental run for one dataset:
//!
//! 1. Resolve paths and create the log and output directories.
//! 2. Load the dedup index from the side-store, once.
//! 3. Reconcile the spectral archive with the side-store.
//! 4. Locate candidate files and drop those already archived.
//! 5. Load master metadata, then process, stage and commit batch by batch.
//!
//! Each batch is committed as: merge metadata in memory (schema conflicts
//! fail here, before anything is written), append to the spectral archive,
//! then atomically replace the side-store. A crash therefore loses at most
//! the batch in flight; a vector tail written without its metadata is
//! dropped by the next run's reconciliation.
//!
//! [`run_all`] drives every dataset of an [`IngestConfig`].

use crate::accumulate::BatchAccumulator;
use crate::batch::{filter_candidates, make_batches};
use crate::config::{DatasetConfig, IngestConfig, Parallelism};
use crate::locate::{RecordLocator, candidate_count};
use crate::logging::RunLog;
use crate::paths::ResolvedPaths;
use crate::processed::load_processed;
use crate::processor::{ProcessorRegistry, RecordProcessor};
use crate::store::{MetadataStore, open_writer};
use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Instant;

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every located record was already archived.
    NothingToDo,
    /// New records were found and every batch was attempted.
    Completed,
}

/// Counters for one dataset run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub dataset: String,
    pub status: RunStatus,
    /// Distinct keys in the side-store before the run.
    pub existing_keys: usize,
    /// Candidate files found in the data directories.
    pub located: usize,
    /// Candidates left after dedup.
    pub new_records: usize,
    pub batches: usize,
    /// Batches in which no record survived.
    pub empty_batches: usize,
    pub committed_records: usize,
    pub committed_rows: usize,
    pub skipped_records: usize,
    pub warnings: usize,
    pub errors: usize,
}

impl RunSummary {
    fn new(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_owned(),
            status: RunStatus::NothingToDo,
            existing_keys: 0,
            located: 0,
            new_records: 0,
            batches: 0,
            empty_batches: 0,
            committed_records: 0,
            committed_rows: 0,
            skipped_records: 0,
            warnings: 0,
            errors: 0,
        }
    }
}

/// One dataset's ingestion: its configuration, processor and log handle.
pub struct Ingestor {
    config: DatasetConfig,
    processor: Box<dyn RecordProcessor>,
    log: RunLog,
}

impl Ingestor {
    /// # Errors
    /// [`crate::error::IngestError::InvalidConfig`] when `config` does not
    /// validate.
    pub fn new(config: DatasetConfig, processor: Box<dyn RecordProcessor>) -> Result<Self> {
        config.validate()?;
        let log = RunLog::new(config.display_name());
        Ok(Self {
            config,
            processor,
            log,
        })
    }

    /// Replace the log handle, e.g. with [`RunLog::capturing`].
    #[must_use]
    pub fn with_log(mut self, log: RunLog) -> Self {
        self.log = log;
        self
    }

    #[must_use]
    pub fn log(&self) -> &RunLog {
        &self.log
    }

    #[must_use]
    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// Run one incremental ingestion.
    ///
    /// Skipped records and empty batches are logged, not returned.
    ///
    /// # Errors
    /// Fatal conditions only: filesystem failures on the output side, a
    /// corrupt side-store or archive, a channel mismatch, an archive out of
    /// sync with its side-store, or a metadata schema conflict.
    pub fn run(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::new(self.config.display_name());
        let settings = self.processor.settings().clone();
        let paths = ResolvedPaths::resolve(&self.config)?;

        let meta = MetadataStore::new(paths.metadata_store());
        let processor = &*self.processor;
        let index = load_processed(meta.path(), &settings.pkey_field, &self.log)?
            .normalized(|k| processor.record_key_for_stored(k));
        summary.existing_keys = index.len();
        self.log
            .info(format!("Found {} IDs in existing output", index.len()));

        let mut writer = open_writer(settings.layout, settings.driver, &paths)?;
        writer.reconcile(index.rows(), &self.log)?;

        let located = RecordLocator::new(&settings.file_ext)
            .with_flat_pool(self.config.flat_pool)
            .with_exclude(&self.config.exclude)?
            .locate(&paths.data, |name| processor.identify(name), &self.log)?;
        summary.located = candidate_count(&located);
        self.log.info(format!(
            "Found {} IDs in the data directories",
            summary.located
        ));

        let filtered = filter_candidates(located, &index);
        summary.new_records = candidate_count(&filtered);
        if summary.new_records == 0 {
            self.log.info("No new IDs, nothing to do");
            return Ok(self.finish(summary));
        }

        self.processor
            .parse_metadata(&paths.metadata, &self.log)
            .context("load master metadata")?;

        let batch_size = self.config.batch_size();
        let batches = make_batches(&filtered, batch_size);
        summary.batches = batches.len();
        summary.status = RunStatus::Completed;
        self.log.info(format!(
            "Processing {} new records in {} batches of at most {batch_size}",
            summary.new_records,
            batches.len()
        ));

        let accumulator = BatchAccumulator::new(&*self.processor, &self.log)
            .with_parallelism(self.config.parallelism.unwrap_or(Parallelism::Sequential));
        for batch in &batches {
            let started = Instant::now();
            let Some(acc) = accumulator.accumulate(batch)? else {
                summary.empty_batches += 1;
                summary.skipped_records += batch.len();
                continue;
            };
            let keys = acc
                .metadata
                .keys(&settings.pkey_field)
                .with_context(|| format!("{}: no '{}' column", acc.label, settings.pkey_field))?;
            let staged = meta.stage(&acc.metadata)?;
            writer
                .append(&acc.payload, &keys, &self.log)
                .with_context(|| format!("{}: append to {}", acc.label, writer.describe()))?;
            meta.persist(&staged)
                .with_context(|| format!("{}: write {}", acc.label, meta.path().display()))?;

            summary.committed_records += acc.records;
            summary.committed_rows += acc.rows();
            summary.skipped_records += acc.skipped;
            self.log.info(format!(
                "{}: committed {} records ({} rows) in {:.2}s",
                acc.label,
                acc.records,
                acc.rows(),
                started.elapsed().as_secs_f64()
            ));
        }
        Ok(self.finish(summary))
    }

    fn finish(&self, mut summary: RunSummary) -> RunSummary {
        summary.warnings = self.log.warning_count();
        summary.errors = self.log.error_count();
        summary
    }
}

/// Run every dataset in `config`, in order.
///
/// Datasets that fail validation or name an unregistered type are logged at
/// error level and skipped. A fatal error in one dataset stops the whole
/// run, since later datasets may share its output directory.
///
/// # Errors
/// The first fatal error of any dataset run.
pub fn run_all(config: &IngestConfig, registry: &ProcessorRegistry) -> Result<Vec<RunSummary>> {
    let mut summaries = Vec::new();
    for dataset in config.resolved_datasets() {
        let processor = match registry.build(&dataset) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(dataset = dataset.display_name(), "skipping dataset: {e:#}");
                continue;
            }
        };
        let name = dataset.display_name().to_owned();
        let summary = Ingestor::new(dataset, processor)?
            .run()
            .with_context(|| format!("dataset {name}"))?;
        summaries.push(summary);
    }
    Ok(summaries)
}
