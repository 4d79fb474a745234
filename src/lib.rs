//! # spectral-ingest
//!
//! Incremental ingestion of instrument spectra into append-only archives.
//!
//! Every run scans the data directories, skips records whose key is already
//! in the metadata side-store, and commits the rest batch by batch. A batch
//! becomes durable only once both the spectral archive and the side-store
//! have been written, so an interrupted run loses at most the batch in
//! flight and the next run picks up where it stopped.
//!
//! ## Key Features
//!
//! - **Idempotent, resumable runs** - dedup against the side-store's key column
//! - **Partial-failure tolerance** - bad records are logged and dropped, never abort a batch
//! - **Two archive layouts** - fixed-width vector rows (single file or segment family)
//!   and keyed trajectories with overwrite on re-ingestion
//! - **Columnar side-store** - Parquet, merged old-before-new on every commit
//! - **Pluggable instruments** - the [`RecordProcessor`] trait and a [`ProcessorRegistry`]
//! - **Sequential or parallel parsing** - with Rayon, store writes stay single-writer
//!
//! ## Quick Start
//!
//! ```no_run
//! use spectral_ingest::*;
//! use spectral_ingest::testing::registry;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let config = IngestConfig::load("ingest.yaml")?;
//! init_tracing(&config.logging, None)?;
//! for summary in run_all(&config, &registry())? {
//!     println!("{}: {:?}, {} rows", summary.dataset, summary.status, summary.committed_rows);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Components
//!
//! - [`ResolvedPaths`] derives the directory layout from a [`DatasetConfig`].
//! - [`RecordLocator`] walks the data directories and keys candidate files.
//! - [`ProcessedIndex`] holds the keys already archived.
//! - [`filter_candidates`] and [`make_batches`] dedup and batch candidates.
//! - [`BatchAccumulator`] runs a processor over a batch.
//! - [`VectorStore`], [`TrajectoryStore`] and [`MetadataStore`] persist the results.
//! - [`Ingestor`] ties it together for one dataset; [`run_all`] for a whole config.

pub mod accumulate;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod locate;
pub mod logging;
pub mod paths;
pub mod processed;
pub mod processor;
pub mod record;
pub mod store;
pub mod testing;

pub use accumulate::{AccumulatedBatch, BatchAccumulator};
pub use batch::{Batch, filter_candidates, make_batches};
pub use config::{DatasetConfig, Driver, IngestConfig, LoggingConfig, Parallelism};
pub use engine::{Ingestor, RunStatus, RunSummary, run_all};
pub use error::{IngestError, RecordError};
pub use locate::{Candidate, Located, RecordLocator, locate};
pub use logging::{RunLog, init_tracing};
pub use paths::ResolvedPaths;
pub use processed::{ProcessedIndex, load_processed};
pub use processor::{Layout, ProcessorDefaults, ProcessorRegistry, ProcessorSettings, RecordProcessor};
pub use record::{
    Column, ColumnKind, ColumnarTable, Matrix, MetaValue, MetadataRecord, Payload, ProcessedRecord,
    Scalar, Trajectory,
};
pub use store::{BatchPayload, MetadataStore, SpectralWriter, TrajectoryStore, VectorStore, open_writer};
