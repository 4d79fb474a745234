//! Testing utilities for ingestion pipelines.
//!
//! - **Fixtures**: write synthetic instrument files and master tables.
//! - **Processors**: reference and scripted [`RecordProcessor`](crate::processor::RecordProcessor)
//!   implementations.
//! - **[`TestDataset`]**: a throwaway directory tree with a matching
//!   [`DatasetConfig`].
//!
//! # Quick Start
//!
//! ```no_run
//! use spectral_ingest::engine::Ingestor;
//! use spectral_ingest::testing::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let ds = TestDataset::new(ShotCsvProcessor::KIND)?.with_channels(20);
//! write_shot_file(&ds.data_dir(), "A.csv", &synthetic_shots(5, 20, 1.0))?;
//!
//! let processor = ShotCsvProcessor::boxed(ds.config())?;
//! let summary = Ingestor::new(ds.config().clone(), processor)?.run()?;
//! assert_eq!(summary.committed_rows, 5);
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod processors;

pub use fixtures::*;
pub use processors::*;

use crate::config::DatasetConfig;
use crate::paths::ResolvedPaths;
use std::fs::create_dir_all;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary dataset directory, deleted on drop.
///
/// The layout is `<tmp>/data/` for inputs and `<tmp>/master.csv` for the
/// master table (written with a header only). Output goes to the usual
/// defaults under `<tmp>` with the prefix `test`.
pub struct TestDataset {
    dir: TempDir,
    config: DatasetConfig,
}

impl TestDataset {
    /// # Errors
    /// Returns an error if the temporary directory cannot be created.
    pub fn new(kind: &str) -> io::Result<Self> {
        let dir = TempDir::new()?;
        let mut config = DatasetConfig::new("test", kind);
        config.base_dir = dir.path().to_path_buf();
        config.metadata = vec!["master.csv".into()];
        config.data_dir = vec!["data".into()];
        config.output_prefix = "test".into();
        create_dir_all(dir.path().join("data"))?;
        write_master_table(&dir.path().join("master.csv"), &[])?;
        Ok(Self { dir, config })
    }

    #[must_use]
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.config.channels = Some(channels);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = Some(batch_size);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// The first data directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    #[must_use]
    pub fn master_table(&self) -> PathBuf {
        self.dir.path().join("master.csv")
    }

    #[must_use]
    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut DatasetConfig {
        &mut self.config
    }

    /// Paths the dataset resolves to, without creating anything.
    #[must_use]
    pub fn paths(&self) -> ResolvedPaths {
        ResolvedPaths::compute(&self.config)
    }
}
