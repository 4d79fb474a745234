//! Typed configuration for ingestion runs.
//!
//! A YAML document (JSON works too) holds global settings plus a list of
//! datasets:
//!
//! ```yaml
//! root_dir: /data
//! chunk_size: 500
//! logging:
//!   level: info
//! datasets:
//!   - name: raman
//!     type: Raman
//!     base_dir: raman
//!     metadata: master.xlsx
//!     data_dir: [spectra]
//!     output_prefix: raman
//! ```
//!
//! Each dataset is validated when it is turned into a processor, and
//! processor-specific settings live under `options`, which each processor
//! deserializes into its own typed struct via [`DatasetConfig::options`].

use crate::error::IngestError;
use anyhow::{Context, Result};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Default number of records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default number of rows per segment in a family archive.
pub const DEFAULT_SEGMENT_ROWS: u64 = 100_000;

/// Top-level configuration document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Prefix applied to every dataset's `base_dir`.
    pub root_dir: PathBuf,
    /// Records per batch, unless a dataset overrides it.
    #[serde(alias = "batch_size")]
    pub chunk_size: usize,
    pub parallelism: Parallelism,
    pub logging: LoggingConfig,
    pub datasets: Vec<DatasetConfig>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::new(),
            chunk_size: DEFAULT_BATCH_SIZE,
            parallelism: Parallelism::default(),
            logging: LoggingConfig::default(),
            datasets: Vec::new(),
        }
    }
}

impl IngestConfig {
    /// Parse a YAML (or JSON) document.
    ///
    /// # Errors
    /// Returns an error if the document does not match the schema.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parse ingestion config")
    }

    /// Load a config file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        serde_yaml::from_reader(f).with_context(|| format!("parse config {}", path.display()))
    }

    /// Datasets with the global `root_dir`, batch size and parallelism applied.
    #[must_use]
    pub fn resolved_datasets(&self) -> Vec<DatasetConfig> {
        self.datasets
            .iter()
            .cloned()
            .map(|mut ds| {
                ds.root_dir.clone_from(&self.root_dir);
                ds.batch_size.get_or_insert(self.chunk_size);
                ds.parallelism.get_or_insert(self.parallelism);
                ds
            })
            .collect()
    }
}

/// How records inside a batch are parsed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    /// One record at a time, in batch order.
    #[default]
    Sequential,
    /// Parse records on a thread pool. Store writes stay single-threaded.
    Parallel { threads: Option<usize> },
}

/// Physical layout of a vector archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    /// One file holding every row.
    Single,
    /// Numbered segment files holding at most `segment_rows` rows each.
    Family { segment_rows: u64 },
}

impl Driver {
    /// A family driver with the default segment size.
    #[must_use]
    pub fn family() -> Self {
        Self::Family {
            segment_rows: DEFAULT_SEGMENT_ROWS,
        }
    }
}

/// Logging output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `spectral_ingest=debug`.
    pub level: String,
    /// Log file. Relative paths are placed under the dataset log directory.
    pub filename: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            filename: None,
        }
    }
}

/// Settings for one dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub name: Option<String>,
    /// Processor type name, looked up in the registry.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub root_dir: PathBuf,
    pub base_dir: PathBuf,
    /// Master metadata file(s), relative to the base directory.
    #[serde(deserialize_with = "one_or_many")]
    pub metadata: Vec<String>,
    /// Input directories, relative to the base directory. Entries with glob
    /// metacharacters are expanded.
    #[serde(deserialize_with = "one_or_many")]
    pub data_dir: Vec<String>,
    pub log_dir: String,
    pub output_dir: String,
    pub output_prefix: String,
    /// Row width for vector archives.
    pub channels: Option<usize>,
    pub driver: Option<Driver>,
    pub file_ext: Option<String>,
    pub pkey_field: Option<String>,
    /// Treat every input directory as a single `"."` group.
    pub flat_pool: bool,
    /// Regexes; matching file names are never considered.
    pub exclude: Vec<String>,
    pub batch_size: Option<usize>,
    pub parallelism: Option<Parallelism>,
    /// Processor-specific settings.
    pub options: serde_json::Value,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: None,
            kind: None,
            root_dir: PathBuf::new(),
            base_dir: PathBuf::new(),
            metadata: Vec::new(),
            data_dir: Vec::new(),
            log_dir: "nightly-logs".into(),
            output_dir: "to-DEVAS".into(),
            output_prefix: "prepro_no_blr".into(),
            channels: None,
            driver: None,
            file_ext: None,
            pkey_field: None,
            flat_pool: false,
            exclude: Vec::new(),
            batch_size: None,
            parallelism: None,
            options: serde_json::Value::Null,
        }
    }
}

impl DatasetConfig {
    /// A dataset with the two identifying fields set and defaults elsewhere.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Dataset name, or `"<unnamed>"`.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    /// Check the fields every processor relies on.
    ///
    /// # Errors
    /// Returns [`IngestError::InvalidConfig`] naming the first problem.
    pub fn validate(&self) -> Result<(), IngestError> {
        let name = self.display_name();
        if self.name.as_deref().is_none_or(str::is_empty) {
            return Err(IngestError::InvalidConfig("dataset missing name".into()));
        }
        if self.kind.as_deref().is_none_or(str::is_empty) {
            return Err(IngestError::InvalidConfig(format!("dataset {name} missing type")));
        }
        if self.metadata.is_empty() {
            return Err(IngestError::InvalidConfig(format!(
                "dataset {name}: attribute \"metadata\" is required"
            )));
        }
        if self.output_prefix.is_empty() {
            return Err(IngestError::InvalidConfig(format!(
                "dataset {name}: output_prefix must not be empty"
            )));
        }
        if self.batch_size == Some(0) {
            return Err(IngestError::InvalidConfig(format!(
                "dataset {name}: batch_size must be positive"
            )));
        }
        if let Some(Driver::Family { segment_rows: 0 }) = self.driver {
            return Err(IngestError::InvalidConfig(format!(
                "dataset {name}: segment_rows must be positive"
            )));
        }
        Ok(())
    }

    /// Deserialize the `options` block into a processor's own settings type.
    /// A missing block is treated as an empty map, so all-default structs work.
    ///
    /// # Errors
    /// Returns [`IngestError::InvalidConfig`] when the block does not match `T`.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, IngestError> {
        let value = if self.options.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.options.clone()
        };
        serde_json::from_value(value).map_err(|e| {
            IngestError::InvalidConfig(format!("dataset {}: bad options: {e}", self.display_name()))
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}
