//! Directory layout for a dataset.

use crate::config::DatasetConfig;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

/// Suffix of the metadata side-store file.
pub const META_SUFFIX: &str = "_meta.parquet";
/// Extension of vector archive files.
pub const VECTOR_EXT: &str = "spectra";
/// Extension of trajectory archive files.
pub const TRAJECTORY_EXT: &str = "traj";

/// Every path a run needs, derived from a [`DatasetConfig`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedPaths {
    pub base: PathBuf,
    pub metadata: Vec<PathBuf>,
    pub data: Vec<PathBuf>,
    pub log: PathBuf,
    pub output: PathBuf,
    pub output_prefix: String,
    /// Configured row width, carried alongside the paths for the writers.
    pub channels: Option<usize>,
}

impl ResolvedPaths {
    /// Compute the layout and make sure the log and output directories exist.
    ///
    /// # Errors
    /// Directory creation failures are returned as-is and are fatal.
    pub fn resolve(config: &DatasetConfig) -> Result<Self> {
        let paths = Self::compute(config);
        for dir in [&paths.log, &paths.output] {
            create_dir_all(dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
        }
        Ok(paths)
    }

    /// Pure path computation, without touching the filesystem.
    #[must_use]
    pub fn compute(config: &DatasetConfig) -> Self {
        let base = config.root_dir.join(&config.base_dir);
        Self {
            metadata: config.metadata.iter().map(|m| base.join(m)).collect(),
            data: config.data_dir.iter().map(|d| base.join(d)).collect(),
            log: base.join(&config.log_dir),
            output: base.join(&config.output_dir),
            output_prefix: config.output_prefix.clone(),
            channels: config.channels,
            base,
        }
    }

    /// `<output>/<prefix>`: the stem every archive file name starts with.
    #[must_use]
    pub fn output_stem(&self) -> PathBuf {
        self.output.join(&self.output_prefix)
    }

    /// The metadata side-store file.
    #[must_use]
    pub fn metadata_store(&self) -> PathBuf {
        self.output
            .join(format!("{}{META_SUFFIX}", self.output_prefix))
    }

    /// Place a relative path under the log directory; absolute paths pass through.
    #[must_use]
    pub fn in_log_dir(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.log.join(path)
        }
    }
}
