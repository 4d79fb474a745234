//! The record-processor contract and the registry of processor types.
//!
//! A processor owns everything instrument specific: how a file name maps to a
//! record key, how master metadata is loaded, and how one file becomes a
//! [`ProcessedRecord`]. The engine only relies on the shape rules enforced
//! by the batch accumulator.
//!
//! Settings are explicit: a processor type supplies typed
//! [`ProcessorDefaults`], and [`ProcessorDefaults::resolve`] applies the
//! dataset configuration on top, failing on missing required values.

use crate::config::{DatasetConfig, Driver};
use crate::error::{IngestError, RecordError};
use crate::locate::Candidate;
use crate::logging::RunLog;
use crate::record::{ColumnarTable, ProcessedRecord};
use crate::store::BatchPayload;
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Which spectral archive a processor writes, fixed per processor instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Fixed-width rows of `channels` values.
    Vector { channels: usize },
    /// Keyed variable-length trajectories.
    Trajectory,
}

/// Archive kind a processor type writes, before channels are known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Vector,
    Trajectory,
}

/// Typed defaults supplied by a processor type.
#[derive(Clone, Debug)]
pub struct ProcessorDefaults {
    pub archive: ArchiveKind,
    pub file_ext: String,
    pub pkey_field: String,
    pub driver: Driver,
    pub channels: Option<usize>,
}

impl ProcessorDefaults {
    /// Defaults for a vector-archive processor.
    pub fn vector(file_ext: impl Into<String>, pkey_field: impl Into<String>) -> Self {
        Self {
            archive: ArchiveKind::Vector,
            file_ext: file_ext.into(),
            pkey_field: pkey_field.into(),
            driver: Driver::Single,
            channels: None,
        }
    }

    /// Defaults for a trajectory-archive processor.
    pub fn trajectory(file_ext: impl Into<String>, pkey_field: impl Into<String>) -> Self {
        Self {
            archive: ArchiveKind::Trajectory,
            ..Self::vector(file_ext, pkey_field)
        }
    }

    #[must_use]
    pub fn with_driver(mut self, driver: Driver) -> Self {
        self.driver = driver;
        self
    }

    #[must_use]
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Apply `config` on top of these defaults.
    ///
    /// # Errors
    /// [`IngestError::InvalidConfig`] when the configuration is invalid, or a
    /// vector processor ends up without a positive channel count.
    pub fn resolve(&self, config: &DatasetConfig) -> Result<ProcessorSettings, IngestError> {
        config.validate()?;
        let name = config.display_name();
        let file_ext = config.file_ext.clone().unwrap_or_else(|| self.file_ext.clone());
        let pkey_field = config
            .pkey_field
            .clone()
            .unwrap_or_else(|| self.pkey_field.clone());
        if pkey_field.is_empty() {
            return Err(IngestError::InvalidConfig(format!(
                "dataset {name}: pkey_field must not be empty"
            )));
        }
        let layout = match self.archive {
            ArchiveKind::Trajectory => Layout::Trajectory,
            ArchiveKind::Vector => match config.channels.or(self.channels) {
                Some(channels) if channels > 0 => Layout::Vector { channels },
                Some(_) => {
                    return Err(IngestError::InvalidConfig(format!(
                        "dataset {name}: channels must be positive"
                    )));
                }
                None => {
                    return Err(IngestError::InvalidConfig(format!(
                        "dataset {name}: attribute \"channels\" is required"
                    )));
                }
            },
        };
        Ok(ProcessorSettings {
            file_ext,
            pkey_field,
            layout,
            driver: config.driver.unwrap_or(self.driver),
        })
    }
}

/// Resolved settings for one processor instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessorSettings {
    /// File name suffix, matched case-insensitively.
    pub file_ext: String,
    /// Metadata field holding the primary key of each shot.
    pub pkey_field: String,
    pub layout: Layout,
    pub driver: Driver,
}

/// Instrument-specific behavior plugged into the engine.
///
/// `process` may be called from several threads at once when parallel
/// parsing is enabled, hence the `Sync` bound.
pub trait RecordProcessor: Send + Sync {
    fn settings(&self) -> &ProcessorSettings;

    /// Record key for a file name, or `None` to ignore the file.
    fn identify(&self, file_name: &str) -> Option<String>;

    /// Map a primary-key value stored in the side-store back to the record
    /// key `identify` would produce. Instruments that store a per-shot id
    /// derived from the record key override this; `None` drops the value.
    fn record_key_for_stored(&self, stored: &str) -> Option<String> {
        Some(stored.to_owned())
    }

    /// Load master metadata. Called once per run, only when there is new
    /// work, before the first batch.
    ///
    /// # Errors
    /// Failures are fatal for the run.
    fn parse_metadata(&mut self, _metadata_paths: &[PathBuf], _log: &RunLog) -> Result<()> {
        Ok(())
    }

    /// Turn one file into a record. `Ok(None)` skips the record without an
    /// explanation; errors skip it with one.
    ///
    /// # Errors
    /// Any [`RecordError`]; the record is dropped and the batch continues.
    fn process(&self, candidate: &Candidate, log: &RunLog)
    -> Result<Option<ProcessedRecord>, RecordError>;

    /// Add columns computed across the whole batch, after every record has
    /// been accumulated.
    ///
    /// # Errors
    /// Failures are fatal for the run.
    fn derive_batch_columns(
        &self,
        _metadata: &mut ColumnarTable,
        _payload: &BatchPayload,
    ) -> Result<(), IngestError> {
        Ok(())
    }
}

/// Builds a processor from a dataset configuration.
pub type ProcessorFactory =
    Box<dyn Fn(&DatasetConfig) -> Result<Box<dyn RecordProcessor>> + Send + Sync>;

/// Processor types by name.
#[derive(Default)]
pub struct ProcessorRegistry {
    factories: BTreeMap<String, ProcessorFactory>,
}

impl ProcessorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `kind`, replacing any previous entry.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&DatasetConfig) -> Result<Box<dyn RecordProcessor>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
        self
    }

    /// Builder-style [`Self::register`].
    #[must_use]
    pub fn with<F>(mut self, kind: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&DatasetConfig) -> Result<Box<dyn RecordProcessor>> + Send + Sync + 'static,
    {
        self.register(kind, factory);
        self
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered type names, sorted.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Validate `config` and build the processor for its type.
    ///
    /// # Errors
    /// [`IngestError::InvalidConfig`] for an invalid dataset or an unknown
    /// type; otherwise whatever the factory returns.
    pub fn build(&self, config: &DatasetConfig) -> Result<Box<dyn RecordProcessor>> {
        config.validate()?;
        let kind = config.kind.as_deref().unwrap_or_default();
        let Some(factory) = self.factories.get(kind) else {
            return Err(IngestError::InvalidConfig(format!(
                "dataset {}: unknown type {kind}",
                config.display_name()
            ))
            .into());
        };
        factory(config)
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
